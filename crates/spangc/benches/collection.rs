//! Benchmark: collection pause and throughput.
//!
//! Builds a rooted binary tree and measures blocking and concurrent
//! cycles over it, plus the cost of sweeping dead spans.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use spangc::{CollectMode, Heap, HeapConfig, TypeDescriptor, Worker};

fn quiet_heap() -> Arc<Heap> {
    Heap::new(HeapConfig::default().arena_size(512 << 20).gc_percent(None))
}

/// Builds a complete binary tree of the given depth and returns the root
/// slot holding it.
fn build_tree(w: &Worker, depth: u32) -> usize {
    let node = TypeDescriptor::from_pointer_words(24, &[0, 1]);
    let slot = w.push_root(0);
    let root = grow(w, &node, depth);
    w.set_root(slot, root);
    slot
}

fn grow(w: &Worker, node: &TypeDescriptor, depth: u32) -> usize {
    let n = w.new_object(node).as_ptr() as usize;
    let slot = w.push_root(n);
    if depth > 0 {
        let left = grow(w, node, depth - 1);
        // SAFETY: word 0 of a live node.
        unsafe { w.write_pointer(n as *mut usize, left) };
        let right = grow(w, node, depth - 1);
        // SAFETY: word 1 of a live node.
        unsafe { w.write_pointer((n + 8) as *mut usize, right) };
    }
    w.pop_root();
    debug_assert_eq!(w.roots_len(), slot);
    n
}

fn bench_mark(c: &mut Criterion) {
    let mut group = c.benchmark_group("mark_tree");
    for depth in [10u32, 14, 17] {
        let heap = quiet_heap();
        let w = heap.register_worker();
        build_tree(&w, depth);
        for mode in [CollectMode::Blocking, CollectMode::Background] {
            group.bench_with_input(BenchmarkId::new(mode.as_str(), depth), &mode, |b, &mode| {
                b.iter(|| heap.collect_with(mode));
            });
        }
        heap.finish_sweep();
    }
    group.finish();
}

fn bench_pause(c: &mut Criterion) {
    let heap = quiet_heap();
    let w = heap.register_worker();
    build_tree(&w, 16);
    c.bench_function("max_pause_depth_16", |b| {
        b.iter(|| {
            heap.collect_with(CollectMode::Background);
            black_box(heap.metrics().last_cycle().map(|m| m.pause()))
        });
    });
}

fn bench_sweep(c: &mut Criterion) {
    let heap = quiet_heap();
    let w = heap.register_worker();
    let node = TypeDescriptor::from_pointer_words(16, &[0]);
    c.bench_function("sweep_100k_dead", |b| {
        b.iter_batched(
            || {
                for _ in 0..100_000 {
                    w.new_object(&node);
                }
                heap.collect_with(CollectMode::Background);
            },
            |()| heap.finish_sweep(),
            criterion::BatchSize::PerIteration,
        );
    });
}

criterion_group!(benches, bench_mark, bench_pause, bench_sweep);
criterion_main!(benches);
