//! Unrecoverable failures.
//!
//! Nothing in the allocator or collector returns a soft error. A corrupted
//! heap, an exhausted arena or a collaborator breaking the calling contract
//! all end in [`throw`], which reports the problem and panics. Build with
//! `panic = "abort"` to turn these into process aborts.

use std::fmt;

/// Category of a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// Heap structures are inconsistent (double free, corrupted free list,
    /// wrong size class count).
    InvariantViolation,
    /// The arena or the OS cannot supply more memory, or a size computation
    /// overflowed.
    OutOfMemory,
    /// A caller broke the contract (allocating during mark termination,
    /// missing type descriptor, unaligned barrier arguments).
    Misuse,
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvariantViolation => "invariant violation",
            Self::OutOfMemory => "out of memory",
            Self::Misuse => "misuse",
        };
        f.write_str(s)
    }
}

/// Reports a fatal error and unwinds.
///
/// # Panics
///
/// Always.
#[cold]
#[inline(never)]
#[track_caller]
pub fn throw(kind: FatalKind, msg: &str) -> ! {
    #[cfg(feature = "tracing")]
    tracing::error!(kind = %kind, "{msg}");
    eprintln!("fatal error: {msg}");
    panic!("{kind}: {msg}");
}
