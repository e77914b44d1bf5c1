//! Allocator behaviour under many threads and repeated reuse.

#![cfg(feature = "test-util")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use spangc::sizeclass::{table, PAGE_SIZE, TINY_SIZE_CLASS};
use spangc::test_util::{build_list, deduct_sweep_credit, list_len, quiet_heap, unswept_spans};
use spangc::{AllocFlags, CollectMode, Heap, HeapConfig};

const SIZES: [usize; 10] = [1, 7, 10, 16, 24, 48, 200, 1024, 5000, 40_000];

#[test]
fn test_concurrent_allocations_are_distinct() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 10_000;
    let heap = quiet_heap(256 << 20);

    let mut ranges: Vec<(usize, usize)> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let heap = &heap;
                s.spawn(move || {
                    let w = heap.register_worker();
                    (0..PER_THREAD)
                        .map(|i| {
                            let mut size = SIZES[(i + t) % SIZES.len()];
                            if size > 5000 && i % 97 != 0 {
                                size = 64;
                            }
                            let p = w.allocate(size, None, AllocFlags::NO_SCAN).as_ptr() as usize;
                            (p, size)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(ranges.len(), THREADS * PER_THREAD);
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let (a, a_size) = pair[0];
        let (b, _) = pair[1];
        assert!(a + a_size <= b, "{a:#x}+{a_size} overlaps {b:#x}");
    }
}

#[test]
fn test_tiny_allocations_fill_one_block_each_when_they_do_not_fit_together() {
    let heap = quiet_heap(16 << 20);
    let w = heap.register_worker();
    // Two 10-byte requests never share a 16-byte block.
    for _ in 0..1000 {
        w.allocate(10, None, AllocFlags::NO_SCAN);
    }
    let per_span = table().class(TINY_SIZE_CLASS).objects_per_span();
    assert_eq!(heap.central(TINY_SIZE_CLASS).spans_obtained(), 1000usize.div_ceil(per_span) as u64);

    let heap = quiet_heap(16 << 20);
    let w = heap.register_worker();
    // Four 4-byte requests per block.
    for _ in 0..1000 {
        w.allocate(4, None, AllocFlags::NO_SCAN);
    }
    assert_eq!(heap.central(TINY_SIZE_CLASS).spans_obtained(), 250usize.div_ceil(per_span) as u64);
}

#[test]
fn test_no_spans_leak_across_reuse_rounds() {
    let heap = quiet_heap(64 << 20);
    let mut sys_after_first = 0;
    for round in 0..10 {
        let w = heap.register_worker();
        let keep = build_list(&w, 100);
        for i in 0..3000 {
            let size = SIZES[i % SIZES.len()];
            w.allocate(size, None, AllocFlags::NO_SCAN);
        }
        assert_eq!(list_len(w.root(keep)), 100);
        drop(w);
        heap.collect();

        let stats = heap.mem_stats();
        assert_eq!(stats.pages_in_use, 0, "round {round}");
        assert_eq!(stats.heap_inuse, 0, "round {round}");
        assert_eq!(stats.mallocs, stats.frees, "round {round}");
        if round == 0 {
            sys_after_first = stats.heap_sys;
        } else {
            assert!(stats.heap_sys <= sys_after_first, "round {round} grew the heap");
        }
    }
}

#[test]
fn test_sweep_credit_races_allocating_workers() {
    // Cycles only start from this thread; the minimum keeps the pacer out.
    let heap = Heap::new(
        HeapConfig::default()
            .arena_size(256 << 20)
            .heap_minimum(1 << 30)
            .gc_percent(Some(100))
            .background_collector(false),
    );
    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                let w = heap.register_worker();
                let keep = build_list(&w, 300);
                while !stop.load(Ordering::Relaxed) {
                    let garbage = build_list(&w, 50);
                    w.truncate_roots(garbage);
                    for size in SIZES {
                        w.alloc_bytes(size.max(16));
                    }
                    assert_eq!(list_len(w.root(keep)), 300);
                }
            });
        }
        s.spawn(|| {
            while !stop.load(Ordering::Relaxed) {
                deduct_sweep_credit(&heap, 2048 * PAGE_SIZE);
                thread::yield_now();
            }
        });

        let mut early = 0;
        for _ in 0..50 {
            heap.collect_with(CollectMode::Background);
            while !heap.sweep_done() {
                thread::yield_now();
            }
            if unswept_spans(&heap) != 0 {
                early += 1;
            }
        }
        stop.store(true, Ordering::Relaxed);
        assert_eq!(early, 0, "sweep reported done with spans left");
    });

    assert!(heap.metrics().total_collections() >= 50);
}
