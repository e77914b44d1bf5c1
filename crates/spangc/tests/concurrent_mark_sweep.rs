//! Concurrent marking against running mutators.
//!
//! These tests keep several workers allocating and rewiring pointers while
//! cycles start and finish underneath them, then check that nothing
//! reachable was freed.

#![cfg(feature = "test-util")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use spangc::test_util::{build_list, list_len, list_node};
use spangc::{AllocFlags, CollectMode, Heap, HeapConfig, TypeDescriptor, Worker};

/// Small xorshift generator, deterministic per thread.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

fn paced_heap(background: bool) -> Arc<Heap> {
    Heap::new(
        HeapConfig::default()
            .arena_size(256 << 20)
            .heap_minimum(1 << 20)
            .gc_percent(Some(100))
            .background_collector(background),
    )
}

#[test]
fn test_lists_survive_background_cycles() {
    let heap = paced_heap(true);
    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let heap = Arc::clone(&heap);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let w = heap.register_worker();
                barrier.wait();
                let keep = w.push_root(0);
                for round in 0..40 {
                    let slot = build_list(&w, 500 + round);
                    w.set_root(keep, w.root(slot));
                    w.truncate_roots(slot);
                    // Garbage to keep the pacer busy.
                    for _ in 0..2000 {
                        w.alloc_bytes(64);
                    }
                    assert_eq!(list_len(w.root(keep)), 500 + round);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert!(heap.metrics().total_collections() > 0);
}

/// Slots of a rooted pointer array are shuffled while marking runs; each
/// node carries an id that must still be there at the end.
fn shuffle(w: &Worker, seed: u64, steps: usize) {
    const SLOTS: usize = 256;
    let node = list_node();
    let slot = TypeDescriptor::from_pointer_words(8, &[0]);
    let arr = w.new_array(&slot, SLOTS).as_ptr() as usize;
    w.push_root(arr);
    let slot_addr = |i: usize| (arr + i * 8) as *mut usize;

    let mut rng = Rng(seed);
    let mut ids = vec![0usize; SLOTS];
    let mut next_id = 1;
    for step in 0..steps {
        let i = rng.below(SLOTS);
        let j = rng.below(SLOTS);
        match step % 3 {
            0 => {
                let p = w.new_object(&node).as_ptr() as usize;
                // SAFETY: `p` is a fresh node, word 1 a scalar.
                unsafe {
                    ((p + 8) as *mut usize).write(next_id);
                    w.write_pointer(slot_addr(i), p);
                }
                ids[i] = next_id;
                next_id += 1;
            }
            _ => {
                // Move the pointer from `i` to `j`, hiding it from a
                // collector that already scanned `j`.
                // SAFETY: slots of a live array only this worker writes.
                unsafe {
                    let p = slot_addr(i).read();
                    w.write_pointer(slot_addr(j), p);
                    if i != j {
                        w.write_pointer(slot_addr(i), 0);
                    }
                }
                ids[j] = ids[i];
                if i != j {
                    ids[i] = 0;
                }
            }
        }
        if step % 64 == 0 {
            for _ in 0..256 {
                w.alloc_bytes(128);
            }
        }
    }

    for (i, &id) in ids.iter().enumerate() {
        // SAFETY: slot `i` holds zero or a live node.
        let p = unsafe { slot_addr(i).read() };
        if id == 0 {
            assert_eq!(p, 0);
        } else {
            // SAFETY: `p` is a live node.
            assert_eq!(unsafe { ((p + 8) as *const usize).read() }, id, "node in slot {i} was freed");
        }
    }
}

#[test]
fn test_write_barrier_under_concurrent_mark() {
    let heap = paced_heap(true);
    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                let w = heap.register_worker();
                shuffle(&w, 0x9e37_79b9_7f4a_7c15 ^ (t + 1), 20_000);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(heap.metrics().total_background_collections() > 0);
}

#[test]
fn test_write_barrier_with_inline_cycles() {
    // No collector thread: the allocating worker runs each cycle itself.
    let heap = paced_heap(false);
    let w = heap.register_worker();
    shuffle(&w, 42, 30_000);
    assert!(heap.metrics().total_collections() > 0);
}

#[test]
fn test_explicit_collections_race_mutators() {
    let heap = Heap::new(HeapConfig::default().arena_size(128 << 20).gc_percent(None));
    let stop = Arc::new(AtomicBool::new(false));

    let collector = {
        let heap = Arc::clone(&heap);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut mode = CollectMode::Background;
            while !stop.load(Ordering::Relaxed) {
                heap.collect_with(mode);
                mode = match mode {
                    CollectMode::Background => CollectMode::Blocking,
                    CollectMode::Blocking => CollectMode::Background,
                };
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let mutators: Vec<_> = (0..3u64)
        .map(|t| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                let w = heap.register_worker();
                shuffle(&w, 7 + t, 10_000);
                let keep = build_list(&w, 1000);
                for _ in 0..20 {
                    let garbage = build_list(&w, 100);
                    w.truncate_roots(garbage);
                    assert_eq!(list_len(w.root(keep)), 1000);
                }
            })
        })
        .collect();

    for h in mutators {
        h.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    collector.join().unwrap();
    assert!(heap.metrics().total_collections() > 0);
}

#[test]
fn test_worker_threads_come_and_go() {
    let heap = paced_heap(true);
    let global = {
        let w = heap.register_worker();
        let slot = build_list(&w, 200);
        let head = w.root(slot);
        w.set_global(0, head);
        head
    };

    for _ in 0..8 {
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let heap = Arc::clone(&heap);
                thread::spawn(move || {
                    let w = heap.register_worker();
                    for _ in 0..50 {
                        let slot = build_list(&w, 200);
                        w.truncate_roots(slot);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    assert_eq!(heap.worker_count(), 0);
    heap.collect();
    assert_eq!(heap.global(0), global);
    assert_eq!(list_len(global), 200);
}

/// Writes `tag` into the first and last word of a `size`-byte object.
fn stamp(p: usize, size: usize, tag: usize) {
    // SAFETY: `p` is a live object of at least `size` bytes.
    unsafe {
        if size >= 8 {
            (p as *mut usize).write_unaligned(tag);
            ((p + size - 8) as *mut usize).write_unaligned(tag);
        } else {
            (p as *mut u8).write(tag as u8);
        }
    }
}

fn is_stamped(p: usize, size: usize, tag: usize) -> bool {
    // SAFETY: `p` is a rooted object of at least `size` bytes.
    unsafe {
        if size >= 8 {
            (p as *const usize).read_unaligned() == tag
                && ((p + size - 8) as *const usize).read_unaligned() == tag
        } else {
            (p as *const u8).read() == tag as u8
        }
    }
}

#[test]
fn test_fresh_objects_survive_inline_cycles_on_many_workers() {
    const RING: usize = 32;
    // Every cycle is started inline by whichever worker crosses the
    // trigger, while the other one sits between allocating and rooting.
    let heap = paced_heap(false);
    let handles: Vec<_> = (0..2usize)
        .map(|t| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                let w = heap.register_worker();
                let mut rng = Rng(0x2545_f491_4f6c_dd1d ^ (t as u64 + 1));
                let base = w.roots_len();
                for _ in 0..RING {
                    w.push_root(0);
                }
                let mut ring = [(0usize, 0usize, 0usize); RING];
                for i in 0..10_000 {
                    let size = 1 + rng.below(70_000);
                    let tag = t * 1_000_000 + i + 1;
                    if i % 3 != 0 {
                        let p = w.allocate(size, None, AllocFlags::NO_SCAN).as_ptr() as usize;
                        stamp(p, size, tag);
                        continue;
                    }
                    let (p, top) = if i % 6 == 0 {
                        w.allocate_rooted(size, None, AllocFlags::NO_SCAN)
                    } else {
                        let p = w.allocate(size, None, AllocFlags::NO_SCAN);
                        (p, w.push_root(p.as_ptr() as usize))
                    };
                    let p = p.as_ptr() as usize;
                    stamp(p, size, tag);

                    let k = (i / 3) % RING;
                    let (old, old_size, old_tag) = ring[k];
                    if old != 0 {
                        assert!(is_stamped(old, old_size, old_tag), "rooted object {old_tag} was reused");
                    }
                    w.set_root(base + k, p);
                    w.truncate_roots(top);
                    ring[k] = (p, size, tag);
                }
                for &(p, size, tag) in &ring {
                    assert!(is_stamped(p, size, tag), "rooted object {tag} was reused");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(heap.metrics().total_collections() > 0);
}
