//! Special records attached to objects: finalizers and profile samples.
//!
//! Each span keeps the records of its objects sorted by byte offset, then
//! by kind, behind a leaf lock of its own. A record may name an inner byte
//! of an object (tiny blocks are shared), so sweeping maps every offset
//! back to its object before checking the mark.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crossbeam::utils::Backoff;
use parking_lot::Mutex;

use super::bitmap::HeapBits;
use super::span::Span;
use super::{Heap, SpanId};
use crate::fatal::{throw, FatalKind};
use crate::heap::central::claim;
use crate::heap::span::SpanState;
use crate::worker::Worker;

/// Work run once an object with a finalizer is found unreachable. It gets
/// the address the finalizer was set on.
pub type Finalizer = Box<dyn FnOnce(&Worker, NonNull<u8>) + Send>;

const KIND_FINALIZER: u8 = 1;
const KIND_PROFILE: u8 = 2;

/// What a special record carries.
pub(crate) enum SpecialRecord {
    Finalizer(Finalizer),
    /// Index of the profile bucket the allocation was sampled into.
    Profile(usize),
}

impl SpecialRecord {
    /// Sort key among records on the same byte; finalizers come first.
    const fn kind(&self) -> u8 {
        match self {
            Self::Finalizer(_) => KIND_FINALIZER,
            Self::Profile(_) => KIND_PROFILE,
        }
    }
}

impl fmt::Debug for SpecialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finalizer(_) => f.write_str("Finalizer"),
            Self::Profile(bucket) => f.debug_tuple("Profile").field(bucket).finish(),
        }
    }
}

/// Records a sweep took from objects it found dead.
#[derive(Default)]
pub(crate) struct Dying {
    /// Address the finalizer was set on, and the finalizer.
    pub(crate) finalizers: Vec<(usize, Finalizer)>,
    /// Profile bucket and object size of each sampled object freed.
    pub(crate) profile_frees: Vec<(usize, usize)>,
}

#[derive(Debug)]
pub(crate) struct Special {
    /// Byte offset from the span start.
    offset: usize,
    record: SpecialRecord,
}

impl Special {
    fn key(&self) -> (usize, u8) {
        (self.offset, self.record.kind())
    }
}

/// The sorted records of one span.
#[derive(Debug)]
pub(crate) struct Specials(Mutex<Vec<Special>>);

impl Specials {
    pub(crate) const fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub(crate) fn clear(&self) {
        self.0.lock().clear();
    }

    /// Inserts unless a record of the same kind exists on `offset`.
    fn insert(&self, offset: usize, record: SpecialRecord) -> bool {
        let key = (offset, record.kind());
        let mut list = self.0.lock();
        match list.binary_search_by_key(&key, Special::key) {
            Ok(_) => false,
            Err(at) => {
                list.insert(at, Special { offset, record });
                true
            }
        }
    }

    fn remove(&self, offset: usize, kind: u8) -> Option<SpecialRecord> {
        let mut list = self.0.lock();
        let at = list.binary_search_by_key(&(offset, kind), Special::key).ok()?;
        Some(list.remove(at).record)
    }

    /// Offsets of every finalizer record.
    fn finalizer_offsets(&self) -> Vec<usize> {
        self.0
            .lock()
            .iter()
            .filter(|s| matches!(s.record, SpecialRecord::Finalizer(_)))
            .map(|s| s.offset)
            .collect()
    }
}

impl Heap {
    /// Sweeps span `id` now unless it already was swept this cycle.
    /// Waits for a sweep another thread is running.
    pub(crate) fn ensure_swept(&self, id: SpanId) {
        let s = self.spans.get(id);
        let sg = self.sweepgen();
        if s.sweepgen.load(Ordering::Acquire) == sg {
            return;
        }
        if claim(s, sg) {
            self.sweep_span(id, false);
            return;
        }
        let backoff = Backoff::new();
        while s.sweepgen.load(Ordering::Acquire) != sg {
            backoff.snooze();
        }
    }

    /// The in-use span holding `p`.
    fn special_span(&self, p: usize) -> Option<(SpanId, &Span)> {
        if !self.arena.contains(p) {
            return None;
        }
        let id = self.spans.span_at_page(self.arena.page_index(p))?;
        let s = self.spans.get(id);
        (s.state() == SpanState::InUse && p >= s.start() && p < s.limit()).then_some((id, s))
    }

    /// Attaches `record` to the byte at `p`. Returns `false` if a record of
    /// the same kind is already there.
    pub(crate) fn add_special(&self, p: usize, record: SpecialRecord) -> bool {
        let Some((id, s)) = self.special_span(p) else {
            throw(FatalKind::Misuse, "special record for a pointer outside the heap");
        };
        // A sweep would free the object under a record added too late.
        self.ensure_swept(id);
        s.specials.insert(p - s.start(), record)
    }

    /// Detaches the finalizer set on `p`.
    pub(crate) fn remove_finalizer(&self, p: usize) -> Option<Finalizer> {
        let (id, s) = self.special_span(p)?;
        self.ensure_swept(id);
        match s.specials.remove(p - s.start(), KIND_FINALIZER)? {
            SpecialRecord::Finalizer(f) => Some(f),
            SpecialRecord::Profile(_) => None,
        }
    }

    /// Takes the records of every unmarked object of a span being swept.
    ///
    /// An object with a finalizer is marked on the spot: it survives this
    /// sweep until its finalizers have run, and keeps its profile record.
    /// Every finalizer of the object is queued together.
    pub(crate) fn sweep_specials(&self, s: &Span) -> Dying {
        let mut out = Dying::default();
        let start = s.start();
        let size = s.elem_size();
        let mut list = s.specials.0.lock();
        if list.is_empty() {
            return out;
        }
        let mut kept = Vec::with_capacity(list.len());
        let mut specials = list.drain(..).peekable();
        while let Some(first) = specials.next() {
            let obj_offset = first.offset / size * size;
            let mut group = vec![first];
            while let Some(next) = specials.next_if(|n| n.offset < obj_offset + size) {
                group.push(next);
            }
            let hb = HeapBits::new(&self.arena, start + obj_offset);
            if hb.is_marked() {
                kept.extend(group);
                continue;
            }
            let has_finalizer = group
                .iter()
                .any(|n| matches!(n.record, SpecialRecord::Finalizer(_)));
            if has_finalizer {
                hb.set_marked();
            }
            for special in group {
                if let SpecialRecord::Profile(bucket) = special.record {
                    if has_finalizer {
                        kept.push(special);
                    } else {
                        out.profile_frees.push((bucket, size));
                    }
                } else if let SpecialRecord::Finalizer(f) = special.record {
                    out.finalizers.push((start + special.offset, f));
                }
            }
        }
        drop(specials);
        *list = kept;
        out
    }

    /// Object starts of every finalizer record, for the root scan.
    pub(crate) fn finalizer_objects(&self) -> Vec<(usize, usize)> {
        let mut objs = Vec::new();
        for i in 0..self.spans.high_water() {
            let s = self.spans.get(self.spans.id_at(i));
            if s.state() != SpanState::InUse {
                continue;
            }
            let size = s.elem_size();
            for offset in s.specials.finalizer_offsets() {
                objs.push((s.start() + offset / size * size, size));
            }
        }
        objs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> SpecialRecord {
        SpecialRecord::Finalizer(Box::new(|_, _| {}))
    }

    #[test]
    fn test_records_stay_sorted_and_unique_per_kind() {
        let specials = Specials::new();
        assert!(specials.insert(32, SpecialRecord::Profile(0)));
        assert!(specials.insert(32, noop()));
        assert!(specials.insert(8, noop()));
        assert!(!specials.insert(32, noop()), "one finalizer per byte");
        let keys: Vec<_> = specials.0.lock().iter().map(Special::key).collect();
        assert_eq!(keys, vec![(8, KIND_FINALIZER), (32, KIND_FINALIZER), (32, KIND_PROFILE)]);

        assert!(matches!(specials.remove(32, KIND_PROFILE), Some(SpecialRecord::Profile(0))));
        assert!(specials.remove(32, KIND_PROFILE).is_none());
        assert_eq!(specials.finalizer_offsets(), vec![8, 32]);
        specials.clear();
        assert!(specials.is_empty());
    }
}
