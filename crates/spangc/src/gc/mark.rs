//! Marking: object lookup, graying, scanning, draining and mark assists.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use super::work::GcWork;
use crate::fatal::{throw, FatalKind};
use crate::heap::bitmap::HeapBits;
use crate::heap::span::Span;
use crate::heap::{Heap, SpanState};
use crate::sizeclass::PTR_SIZE;
use crate::worker::{ShadowStack, WorkerLocal};

/// Scan work the background drainer accumulates before publishing it as
/// credit for assists.
const CREDIT_SLACK: i64 = 2000;

impl Heap {
    /// Resolves `p` to the object containing it.
    ///
    /// Pointers outside the heap, or into spans that do not hold objects
    /// right now, are not heap pointers and yield `None`. A pointer into a
    /// free span or past a span's last object means the heap is corrupt.
    pub(crate) fn find_object(&self, p: usize) -> Option<(usize, &Span)> {
        if !self.arena.contains(p) {
            return None;
        }
        let id = self.spans.span_at_page(self.arena.page_index(p))?;
        let s = self.spans.get(id);
        match s.state() {
            SpanState::Dead | SpanState::Reserved => return None,
            SpanState::Free => throw(FatalKind::InvariantViolation, "found bad pointer in heap"),
            SpanState::InUse => {}
        }
        let start = s.start();
        if p < start || p >= s.limit() {
            throw(FatalKind::InvariantViolation, "found bad pointer in heap");
        }
        let elem = s.elem_size();
        Some((start + (p - start) / elem * elem, s))
    }

    /// Marks `obj` and queues it for scanning unless it holds no pointers.
    #[inline]
    pub(crate) fn grey_object(&self, obj: usize, span: &Span, gcw: &mut GcWork) {
        let hb = HeapBits::new(&self.arena, obj);
        if !hb.set_marked() {
            return;
        }
        let size = span.elem_size();
        if !hb.has_pointers(size) {
            gcw.bytes_marked += size as u64;
            return;
        }
        gcw.put(&self.gc.work, obj);
    }

    /// Grays whatever object `p` points into.
    #[inline]
    pub(crate) fn shade(&self, p: usize, gcw: &mut GcWork) {
        if let Some((obj, span)) = self.find_object(p) {
            self.grey_object(obj, span, gcw);
        }
    }

    /// Blackens `b`: grays every object its pointer words refer to.
    pub(crate) fn scan_object(&self, b: usize, gcw: &mut GcWork) {
        let Some(id) = self.spans.span_at_page(self.arena.page_index(b)) else {
            throw(FatalKind::InvariantViolation, "scanobject of an unmapped address");
        };
        let n = self.spans.get(id).elem_size();
        if n == 0 {
            throw(FatalKind::InvariantViolation, "scanobject n == 0");
        }
        self.scan_referents(b, n, gcw);
        gcw.bytes_marked += n as u64;
    }

    /// Grays what the `n`-byte object at `b` points to, leaving `b` itself
    /// alone.
    pub(crate) fn scan_referents(&self, b: usize, n: usize, gcw: &mut GcWork) {
        let mut hb = HeapBits::new(&self.arena, b);
        let mut i = 0;
        while i < n {
            if i != 0 {
                hb = hb.next();
                if !hb.high_bit() {
                    break;
                }
            }
            if hb.is_pointer() {
                // SAFETY: `b + i` is a word of a live object in committed memory.
                let obj = unsafe { AtomicUsize::from_ptr((b + i) as *mut usize) }.load(Ordering::Acquire);
                if obj != 0 && obj.wrapping_sub(b) >= n {
                    self.shade(obj, gcw);
                }
            }
            i += PTR_SIZE;
        }
        gcw.scan_work += i as i64;
    }

    /// Shades every non-null word of a root region.
    fn scan_block<'a>(&self, words: impl Iterator<Item = &'a AtomicUsize>, gcw: &mut GcWork) {
        for slot in words {
            let p = slot.load(Ordering::Acquire);
            if p != 0 {
                self.shade(p, gcw);
            }
        }
    }

    pub(crate) fn scan_globals(&self, gcw: &mut GcWork) {
        self.scan_block(self.globals.iter(), gcw);
    }

    /// Scans root slots `[from, len)` of a shadow stack.
    pub(crate) fn scan_stack(&self, stack: &ShadowStack, from: usize, gcw: &mut GcWork) {
        let len = stack.len();
        for i in from..len {
            let p = stack.get(i);
            if p != 0 {
                self.shade(p, gcw);
            }
        }
        gcw.scan_work += ((len.saturating_sub(from)) * PTR_SIZE) as i64;
    }

    /// Scans until no gray object is left anywhere. With `flush_credit`,
    /// completed scan work is published as background credit as it
    /// accumulates.
    pub(crate) fn drain(&self, gcw: &mut GcWork, flush_credit: bool) {
        let work = &self.gc.work;
        let mut last_flush = gcw.scan_work;
        loop {
            if work.is_empty() {
                gcw.balance(work);
            }
            let Some(obj) = gcw.try_get(work) else {
                break;
            };
            self.scan_object(obj, gcw);
            if flush_credit && gcw.scan_work - last_flush >= CREDIT_SLACK {
                work.bg_scan_credit.fetch_add(gcw.scan_work - last_flush, Ordering::AcqRel);
                last_flush = gcw.scan_work;
            }
        }
        if flush_credit && gcw.scan_work > last_flush {
            work.bg_scan_credit.fetch_add(gcw.scan_work - last_flush, Ordering::AcqRel);
        }
    }

    /// Scans until roughly `scan_work` units are done or no work is left.
    pub(crate) fn drain_n(&self, gcw: &mut GcWork, scan_work: i64) {
        let target = gcw.scan_work + scan_work;
        while gcw.scan_work < target {
            let Some(obj) = gcw.try_get(&self.gc.work) else {
                return;
            };
            self.scan_object(obj, gcw);
        }
    }

    /// Charges `size` allocated bytes to the worker and, when `allow`, pays
    /// the resulting scan-work debt: first from background credit, then by
    /// scanning.
    pub(crate) fn assist_alloc(&self, local: &mut WorkerLocal, size: usize, allow: bool) {
        local.assist_alloc += size as u64;
        if !allow {
            return;
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let mut owed = (self.gc.pacer.assist_ratio.load() * local.assist_alloc as f64) as i64
            - local.assist_scan_work;
        if owed <= 0 {
            return;
        }

        let work = &self.gc.work;
        let stolen = self.steal_scan_credit(owed);
        if stolen > 0 {
            local.assist_scan_work += stolen;
            owed -= stolen;
            if owed == 0 {
                return;
            }
        }
        if !self.gc.blacken_enabled() {
            return;
        }

        let start = Instant::now();
        work.begin_work();
        let before = local.gcw.scan_work;
        self.drain_n(&mut local.gcw, owed);
        let done = local.gcw.scan_work - before;
        local.assist_scan_work += done;
        local.gcw.dispose(work);
        if work.end_work() {
            self.gc.mark_done.complete();
        }
        let elapsed = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.gc.pacer.assist_time.fetch_add(elapsed, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_assist(done, owed);
    }

    /// Takes up to `want` units of background scan credit. The credit
    /// never goes negative, however many assists race for it.
    fn steal_scan_credit(&self, want: i64) -> i64 {
        self.gc
            .work
            .bg_scan_credit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| (c > 0).then(|| c - c.min(want)))
            .map_or(0, |prev| prev.min(want))
    }

    /// Colors a fresh allocation black.
    #[inline]
    pub(crate) fn mark_new_object(&self, obj: usize, size: usize) {
        if HeapBits::new(&self.arena, obj).set_marked() {
            self.gc.work.bytes_marked.fetch_add(size as u64, Ordering::AcqRel);
        }
    }
}
