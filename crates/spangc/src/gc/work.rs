//! Gray-object work buffers.
//!
//! Every marking participant owns a [`GcWork`]: a small stack of gray
//! object addresses plus counters of the bytes it marked and the scan work
//! it did. Full buffers move to a global [`SegQueue`] where any participant
//! can pick them up; counters are flushed into [`WorkState`] on dispose.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use crossbeam_queue::SegQueue;

/// Gray objects per buffer.
pub const WORK_BUF_ENTRIES: usize = 256;

/// Participant count while marking is concurrent. Participants step `nwait`
/// down while they work and back up when they run dry.
pub(crate) const NPROC_CONCURRENT: u32 = u32::MAX;

/// Mark-phase work state shared by all participants.
#[derive(Debug)]
pub(crate) struct WorkState {
    full: SegQueue<Vec<usize>>,
    pub(crate) nwait: AtomicU32,
    pub(crate) nproc: AtomicU32,
    pub(crate) bytes_marked: CachePadded<AtomicU64>,
    pub(crate) scan_work: CachePadded<AtomicI64>,
    /// Scan work done by the background drainer that assists may claim.
    pub(crate) bg_scan_credit: CachePadded<AtomicI64>,
}

impl WorkState {
    pub(crate) fn new() -> Self {
        Self {
            full: SegQueue::new(),
            nwait: AtomicU32::new(NPROC_CONCURRENT),
            nproc: AtomicU32::new(NPROC_CONCURRENT),
            bytes_marked: CachePadded::new(AtomicU64::new(0)),
            scan_work: CachePadded::new(AtomicI64::new(0)),
            bg_scan_credit: CachePadded::new(AtomicI64::new(0)),
        }
    }

    /// Clears everything for a new cycle. The world is stopped.
    pub(crate) fn reset(&self) {
        while self.full.pop().is_some() {}
        self.nwait.store(NPROC_CONCURRENT, Ordering::Relaxed);
        self.nproc.store(NPROC_CONCURRENT, Ordering::Relaxed);
        self.bytes_marked.store(0, Ordering::Relaxed);
        self.scan_work.store(0, Ordering::Relaxed);
        self.bg_scan_credit.store(0, Ordering::Relaxed);
    }

    /// No buffer is waiting in the global queue.
    pub(crate) fn is_empty(&self) -> bool {
        self.full.is_empty()
    }

    pub(crate) fn queued_buffers(&self) -> usize {
        self.full.len()
    }

    /// Registers the caller as busy.
    pub(crate) fn begin_work(&self) {
        self.nwait.fetch_sub(1, Ordering::AcqRel);
    }

    /// Registers the caller as idle again. Returns `true` if every
    /// participant is idle and no work is queued.
    pub(crate) fn end_work(&self) -> bool {
        let nwait = self.nwait.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        nwait == self.nproc.load(Ordering::Acquire) && self.is_empty()
    }
}

/// A participant's gray object buffer.
#[derive(Debug, Default)]
pub struct GcWork {
    buf: Vec<usize>,
    /// Bytes marked since the last dispose.
    pub(crate) bytes_marked: u64,
    /// Words scanned since the last dispose.
    pub(crate) scan_work: i64,
}

impl GcWork {
    pub const fn new() -> Self {
        Self {
            buf: Vec::new(),
            bytes_marked: 0,
            scan_work: 0,
        }
    }

    /// Queues a gray object.
    #[inline]
    pub(crate) fn put(&mut self, work: &WorkState, obj: usize) {
        if self.buf.len() >= WORK_BUF_ENTRIES {
            let full = std::mem::replace(&mut self.buf, Vec::with_capacity(WORK_BUF_ENTRIES));
            work.full.push(full);
        } else if self.buf.capacity() == 0 {
            self.buf.reserve_exact(WORK_BUF_ENTRIES);
        }
        self.buf.push(obj);
    }

    /// Takes a gray object, from the local buffer first.
    #[inline]
    pub(crate) fn try_get(&mut self, work: &WorkState) -> Option<usize> {
        if let Some(obj) = self.buf.pop() {
            return Some(obj);
        }
        let full = work.full.pop()?;
        self.buf = full;
        self.buf.pop()
    }

    /// Hands half of a large local buffer to the global queue when nobody
    /// else has work.
    pub(crate) fn balance(&mut self, work: &WorkState) {
        if self.buf.len() > WORK_BUF_ENTRIES / 2 && work.is_empty() {
            let half = self.buf.split_off(self.buf.len() / 2);
            work.full.push(half);
        }
    }

    /// Publishes the buffer and the counters.
    pub(crate) fn dispose(&mut self, work: &WorkState) {
        if !self.buf.is_empty() {
            work.full.push(std::mem::take(&mut self.buf));
        }
        if self.bytes_marked != 0 {
            work.bytes_marked.fetch_add(self.bytes_marked, Ordering::AcqRel);
            self.bytes_marked = 0;
        }
        if self.scan_work != 0 {
            work.scan_work.fetch_add(self.scan_work, Ordering::AcqRel);
            self.scan_work = 0;
        }
    }

    /// Drops everything without publishing. Used when a cycle starts.
    pub(crate) fn reset(&mut self) {
        self.buf.clear();
        self.bytes_marked = 0;
        self.scan_work = 0;
    }

    /// No gray object is buffered locally.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Gray objects buffered locally.
    pub fn len(&self) -> usize {
        self.buf.len()
    }
}
