//! Finalizers and sampled heap profiles across whole collection cycles.

#![cfg(feature = "test-util")]

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use spangc::test_util::{build_list, list_len, list_node, quiet_heap};
use spangc::{AllocFlags, Heap, HeapConfig, MemProfileRecord};

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn record_of(profile: &[MemProfileRecord], size: usize) -> Option<MemProfileRecord> {
    profile.iter().copied().find(|r| r.size == size)
}

#[test]
fn test_resurrected_object_survives_and_finalizes_once() {
    let heap = quiet_heap(16 << 20);
    let w = heap.register_worker();
    let head = build_list(&w, 10);
    let list = w.root(head);
    w.truncate_roots(head);
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    w.set_finalizer(NonNull::new(list as *mut u8).unwrap(), move |w, obj| {
        c.fetch_add(1, Ordering::Relaxed);
        w.set_global(0, obj.as_ptr() as usize);
    });
    w.safepoint();

    heap.collect();
    assert_eq!(w.run_finalizers(), 1);
    assert_eq!(w.global(0), list);

    heap.collect();
    heap.collect();
    assert_eq!(list_len(w.global(0)), 10);
    assert_eq!(w.run_finalizers(), 0);
    assert_eq!(calls.load(Ordering::Relaxed), 1);

    w.set_global(0, 0);
    heap.collect();
    assert_eq!(heap.mem_stats().pages_in_use, 0);
}

#[test]
fn test_background_collector_runs_finalizers() {
    let heap = Heap::new(
        HeapConfig::default()
            .arena_size(16 << 20)
            .gc_percent(None)
            .background_collector(true),
    );
    let w = heap.register_worker();
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let r = Arc::clone(&ran);
        let obj = w.new_object(&list_node());
        w.set_finalizer(obj, move |_, _| {
            r.fetch_add(1, Ordering::Relaxed);
        });
    }
    w.safepoint();

    heap.collect();
    assert!(wait_until(|| ran.load(Ordering::Relaxed) == 4), "finalizers did not run");
    assert!(wait_until(|| heap.finalizers_run() == 4));
    let stats = heap.mem_stats();
    assert_eq!(stats.finalizers, 0);
    assert_eq!(stats.finalizers_queued, 0);
    assert_eq!(stats.finalizers_run, 4);
}

#[test]
fn test_finalizer_stats() {
    let heap = quiet_heap(16 << 20);
    let w = heap.register_worker();
    let (kept, _) = w.new_object_rooted(&list_node());
    w.set_finalizer(kept, |_, _| {});
    let dropped = w.new_object(&list_node());
    w.set_finalizer(dropped, |_, _| {});
    w.safepoint();

    heap.collect();
    let stats = heap.mem_stats();
    assert_eq!(stats.finalizers, 1);
    assert_eq!(stats.finalizers_queued, 1);
    assert_eq!(stats.finalizers_run, 0);
}

#[test]
fn test_profile_counts_frees_two_cycles_late() {
    let heap = quiet_heap(16 << 20);
    heap.set_mem_profile_rate(1);
    let w = heap.register_worker();
    for _ in 0..10 {
        w.allocate(64, None, AllocFlags::NO_SCAN);
    }
    for _ in 0..5 {
        w.allocate_rooted(128, None, AllocFlags::NO_SCAN);
    }
    w.safepoint();

    heap.collect();
    heap.collect();
    let profile = heap.mem_profile(false);
    assert_eq!(record_of(&profile, 64), None, "fully freed");
    let live = record_of(&profile, 128).expect("live bucket");
    assert_eq!((live.allocs, live.frees), (5, 0));
    assert_eq!(live.in_use_bytes(), 640);

    let freed = record_of(&heap.mem_profile(true), 64).expect("freed bucket");
    assert_eq!(freed, MemProfileRecord { size: 64, allocs: 10, frees: 10, alloc_bytes: 640, free_bytes: 640 });
}

#[test]
fn test_profile_before_first_cycle_shows_allocations() {
    let heap = quiet_heap(16 << 20);
    heap.set_mem_profile_rate(1);
    let w = heap.register_worker();
    w.allocate(256, None, AllocFlags::NO_SCAN);
    let rec = record_of(&heap.mem_profile(false), 256).expect("bucket");
    assert_eq!(rec.allocs, 1);
}

#[test]
fn test_profiling_off_records_nothing() {
    let heap = Heap::new(HeapConfig::default().arena_size(16 << 20).gc_percent(None).mem_profile_rate(0));
    assert_eq!(heap.mem_profile_rate(), 0);
    let w = heap.register_worker();
    for _ in 0..100 {
        w.alloc_bytes(4096);
    }
    assert!(heap.mem_profile(true).is_empty());
}

#[test]
fn test_sampling_averages_one_per_rate_bytes() {
    const RATE: usize = 64 << 10;
    let heap = quiet_heap(64 << 20);
    assert_eq!(heap.set_mem_profile_rate(RATE), spangc::config::DEFAULT_MEM_PROFILE_RATE);
    let w = heap.register_worker();
    for _ in 0..16 << 10 {
        w.alloc_bytes(1024);
    }
    let samples = record_of(&heap.mem_profile(false), 1024).map_or(0, |r| r.allocs);
    // 16 MiB at one sample per 64 KiB.
    assert!((128..=512).contains(&samples), "{samples} samples");
}

#[test]
fn test_profile_record_outlives_a_pending_finalizer() {
    let heap = quiet_heap(16 << 20);
    heap.set_mem_profile_rate(1);
    let w = heap.register_worker();
    let obj = w.new_object(&list_node());
    w.set_finalizer(obj, |_, _| {});
    w.safepoint();

    heap.collect();
    heap.collect();
    let rec = record_of(&heap.mem_profile(false), 16).expect("bucket");
    assert_eq!((rec.allocs, rec.frees), (1, 0), "kept while queued");

    assert_eq!(w.run_finalizers(), 1);
    heap.collect();
    heap.collect();
    let rec = record_of(&heap.mem_profile(true), 16).expect("bucket");
    assert_eq!((rec.allocs, rec.frees), (1, 1));
}
