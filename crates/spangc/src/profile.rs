//! Sampled heap profiling.
//!
//! On average one allocation per `rate` bytes is sampled. A sample is
//! counted in a bucket keyed by the allocated size and tagged with a
//! profile record, so the sweep that frees the object counts the free.
//!
//! Counts are published in two steps at mark termination. Allocations
//! since the last cycle are `recent`. Those of the cycle before, together
//! with the frees its sweep found, are `prev`. Only older counts are
//! reported, so a profile never shows an allocation whose free is still
//! pending in an unfinished sweep.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::fatal::{throw, FatalKind};
use crate::heap::cache::ThreadCache;
use crate::heap::special::SpecialRecord;
use crate::heap::Heap;

/// Default sampling rate: one sample per 512 KiB allocated.
pub const DEFAULT_MEM_PROFILE_RATE: usize = 512 << 10;

/// Largest rate the sampler draws intervals for; keeps `2 * rate` small.
const MAX_SAMPLE_RATE: usize = 0x3fff_ffff;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counts {
    allocs: u64,
    frees: u64,
    alloc_bytes: u64,
    free_bytes: u64,
}

impl Counts {
    fn add(&mut self, other: &Self) {
        self.allocs += other.allocs;
        self.frees += other.frees;
        self.alloc_bytes += other.alloc_bytes;
        self.free_bytes += other.free_bytes;
    }
}

#[derive(Debug)]
struct Bucket {
    size: usize,
    published: Counts,
    prev: Counts,
    recent: Counts,
}

/// One bucket of a heap profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemProfileRecord {
    /// Allocated size of the sampled objects.
    pub size: usize,
    /// Sampled allocations.
    pub allocs: u64,
    /// Sampled allocations since freed.
    pub frees: u64,
    /// Bytes of sampled allocations.
    pub alloc_bytes: u64,
    /// Bytes of sampled allocations since freed.
    pub free_bytes: u64,
}

impl MemProfileRecord {
    /// Sampled objects still live.
    #[must_use]
    pub const fn in_use_objects(&self) -> u64 {
        self.allocs - self.frees
    }

    /// Bytes of sampled objects still live.
    #[must_use]
    pub const fn in_use_bytes(&self) -> u64 {
        self.alloc_bytes - self.free_bytes
    }
}

/// Sampling rate and buckets of one heap.
#[derive(Debug)]
pub(crate) struct Profiler {
    rate: AtomicUsize,
    buckets: Mutex<Vec<Bucket>>,
}

impl Profiler {
    pub(crate) const fn new(rate: usize) -> Self {
        Self {
            rate: AtomicUsize::new(rate),
            buckets: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn rate(&self) -> usize {
        self.rate.load(Ordering::Relaxed)
    }

    /// Counts a sampled allocation and returns its bucket.
    fn record_alloc(&self, size: usize) -> usize {
        let mut buckets = self.buckets.lock();
        let i = buckets.iter().position(|b| b.size == size).unwrap_or_else(|| {
            buckets.push(Bucket {
                size,
                published: Counts::default(),
                prev: Counts::default(),
                recent: Counts::default(),
            });
            buckets.len() - 1
        });
        let recent = &mut buckets[i].recent;
        recent.allocs += 1;
        recent.alloc_bytes += size as u64;
        i
    }

    /// Counts frees found by a sweep. Sweeping follows the mark termination
    /// that rotated the counts, so frees belong to `prev`.
    pub(crate) fn record_frees(&self, frees: &[(usize, usize)]) {
        if frees.is_empty() {
            return;
        }
        let mut buckets = self.buckets.lock();
        for &(bucket, size) in frees {
            let prev = &mut buckets[bucket].prev;
            prev.frees += 1;
            prev.free_bytes += size as u64;
        }
    }

    /// Publishes `prev` and moves `recent` into its place.
    pub(crate) fn rotate(&self) {
        Self::rotate_locked(&mut self.buckets.lock());
    }

    fn rotate_locked(buckets: &mut [Bucket]) {
        for b in buckets {
            let prev = b.prev;
            b.published.add(&prev);
            b.prev = std::mem::take(&mut b.recent);
        }
    }

    /// Published counts. Buckets whose objects were all freed are left
    /// out unless `inuse_zero`.
    fn snapshot(&self, inuse_zero: bool) -> Vec<MemProfileRecord> {
        let mut buckets = self.buckets.lock();
        // Nothing published yet: publish everything so a profile taken
        // before the first cycles still shows something.
        if buckets.iter().all(|b| b.published.allocs == 0 && b.published.frees == 0) {
            Self::rotate_locked(&mut buckets);
            Self::rotate_locked(&mut buckets);
        }
        buckets
            .iter()
            .filter(|b| inuse_zero || b.published.alloc_bytes != b.published.free_bytes)
            .map(|b| MemProfileRecord {
                size: b.size,
                allocs: b.published.allocs,
                frees: b.published.frees,
                alloc_bytes: b.published.alloc_bytes,
                free_bytes: b.published.free_bytes,
            })
            .collect()
    }
}

impl Heap {
    /// Decides whether an allocation of `size` bytes at `x` is sampled and
    /// records it if so. The worker's local lock is held.
    pub(crate) fn sample_allocation(&self, cache: &mut ThreadCache, x: usize, size: usize) {
        let rate = self.profile.rate();
        if rate == 0 {
            return;
        }
        if size < rate && size < cache.next_sample {
            cache.next_sample -= size;
            return;
        }
        if size < rate {
            // Carry over the part of this allocation past the sample point,
            // or sizes close to the rate would be under-sampled.
            let next = cache.draw_sample_interval(rate.min(MAX_SAMPLE_RATE));
            cache.next_sample = next.saturating_sub(size - cache.next_sample);
        }
        let bucket = self.profile.record_alloc(size);
        if !self.add_special(x, SpecialRecord::Profile(bucket)) {
            throw(FatalKind::InvariantViolation, "profile record already set");
        }
    }

    /// Sets the sampling rate in bytes; 0 turns sampling off. Returns the
    /// previous rate.
    pub fn set_mem_profile_rate(&self, rate: usize) -> usize {
        self.profile.rate.swap(rate, Ordering::Relaxed)
    }

    /// Current sampling rate in bytes.
    pub fn mem_profile_rate(&self) -> usize {
        self.profile.rate()
    }

    /// The heap profile as of the last completed sweep, one record per
    /// allocation size. With `inuse_zero`, sizes with nothing live are
    /// included.
    pub fn mem_profile(&self, inuse_zero: bool) -> Vec<MemProfileRecord> {
        self.profile.snapshot(inuse_zero)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_publish_two_cycles_late() {
        let p = Profiler::new(1);
        let b = p.record_alloc(64);
        assert_eq!(p.record_alloc(64), b);
        p.rotate();
        // The sweep after the first cycle frees one of them.
        p.record_frees(&[(b, 64)]);
        assert_eq!(p.buckets.lock()[b].published, Counts::default());

        p.rotate();
        let records = p.snapshot(false);
        assert_eq!(
            records,
            vec![MemProfileRecord { size: 64, allocs: 2, frees: 1, alloc_bytes: 128, free_bytes: 64 }]
        );
        assert_eq!(records[0].in_use_objects(), 1);
        assert_eq!(records[0].in_use_bytes(), 64);
    }

    #[test]
    fn test_snapshot_before_any_cycle_publishes_everything() {
        let p = Profiler::new(1);
        p.record_alloc(4096);
        let records = p.snapshot(false);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].allocs, 1);
    }

    #[test]
    fn test_fully_freed_buckets_need_inuse_zero() {
        let p = Profiler::new(1);
        let b = p.record_alloc(32);
        p.rotate();
        p.record_frees(&[(b, 32)]);
        p.rotate();
        assert!(p.snapshot(false).is_empty());
        assert_eq!(p.snapshot(true)[0].frees, 1);
    }
}
