//! Cycle metrics and memory statistics.

use std::sync::Arc;
use std::time::Duration;

use spangc::{CollectMode, Heap, HeapConfig, TypeDescriptor};

fn heap() -> Arc<Heap> {
    Heap::new(HeapConfig::default().arena_size(32 << 20).gc_percent(Some(100)))
}

#[test]
fn test_cycle_metrics_are_recorded() {
    let heap = heap();
    let w = heap.register_worker();
    let node = TypeDescriptor::from_pointer_words(16, &[0]);
    let keep = w.new_object(&node).as_ptr() as usize;
    w.push_root(keep);
    for _ in 0..1000 {
        w.new_object(&node);
    }
    w.safepoint();

    heap.collect();
    let m = heap.metrics().last_cycle().expect("one cycle");
    assert_eq!(m.cycle, 1);
    assert_eq!(m.mode, CollectMode::Blocking);
    assert_eq!(m.heap_marked, 16);
    assert!(m.heap_scan > 0);
    assert_eq!(m.mark_duration, Duration::ZERO);
    assert!(m.duration >= m.pause());
    assert_eq!(m.next_gc, heap.mem_stats().next_gc);
}

#[test]
fn test_background_cycle_times_each_phase() {
    let heap = heap();
    let w = heap.register_worker();
    let slot = TypeDescriptor::from_pointer_words(8, &[0]);
    let node = TypeDescriptor::from_pointer_words(16, &[0]);
    let arr = w.new_array(&slot, 1024).as_ptr() as usize;
    w.push_root(arr);
    for i in 0..1024 {
        let p = w.new_object(&node).as_ptr() as usize;
        // SAFETY: element `i` of a live array.
        unsafe { w.write_pointer((arr + i * 8) as *mut usize, p) };
    }

    heap.collect_with(CollectMode::Background);
    let m = heap.metrics().last_cycle().expect("one cycle");
    assert_eq!(m.mode, CollectMode::Background);
    assert!(m.mark_duration > Duration::ZERO);
    assert!(m.duration >= m.start_pause + m.mark_duration + m.termination_pause);
    assert_eq!(m.heap_marked, 8192 + 1024 * 16);
    assert_eq!(heap.metrics().total_background_collections(), 1);
}

#[test]
fn test_totals_accumulate() {
    let heap = heap();
    for mode in [CollectMode::Blocking, CollectMode::Background, CollectMode::Blocking] {
        heap.collect_with(mode);
    }
    let metrics = heap.metrics();
    assert_eq!(metrics.total_collections(), 3);
    assert_eq!(metrics.total_blocking_collections(), 2);
    assert_eq!(metrics.total_background_collections(), 1);
    assert_eq!(metrics.recent(10).len(), 3);
    assert!(metrics.max_pause(10) >= metrics.average_pause(10));
    let cycles: Vec<u32> = metrics.recent(10).iter().map(|m| m.cycle).collect();
    assert_eq!(cycles, [1, 2, 3]);
    assert_eq!(heap.mem_stats().num_gc, 3);
}

#[test]
fn test_mem_stats_track_spans() {
    let heap = heap();
    let before = heap.mem_stats();
    assert_eq!(before.heap_inuse, 0);
    assert_eq!(before.pages_in_use, 0);

    let w = heap.register_worker();
    w.alloc_bytes(100);
    w.alloc_bytes(64 << 10);
    let stats = heap.mem_stats();
    assert!(stats.pages_in_use >= 9);
    assert_eq!(stats.heap_inuse, stats.pages_in_use * spangc::sizeclass::PAGE_SIZE);
    assert!(stats.heap_sys >= stats.heap_inuse + stats.heap_idle);
    assert!(stats.arena_committed >= stats.heap_sys);
    assert_eq!(stats.arena_pages, (32 << 20) / spangc::sizeclass::PAGE_SIZE);
}

#[test]
fn test_mallocs_and_frees_balance_after_collection() {
    let heap = heap();
    let w = heap.register_worker();
    for size in [8, 24, 100, 1000, 5000, 40_000] {
        for _ in 0..50 {
            w.alloc_bytes(size);
        }
    }
    drop(w);
    heap.collect();
    let stats = heap.mem_stats();
    assert_eq!(stats.mallocs, 300);
    assert_eq!(stats.frees, stats.mallocs);
    assert_eq!(stats.large_allocs, 50);
    assert_eq!(stats.large_frees, 50);
}
