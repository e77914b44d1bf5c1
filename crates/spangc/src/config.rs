//! Heap configuration.
//!
//! [`HeapConfig`] carries everything fixed at heap creation. Defaults can be
//! overridden in code through the builder methods or from the environment
//! with [`HeapConfig::from_env`]:
//!
//! | variable                 | meaning                                  |
//! |--------------------------|------------------------------------------|
//! | `SPANGC_GOGC`            | heap growth percent, or `off`            |
//! | `SPANGC_ARENA_MB`        | arena reservation in MiB                 |
//! | `SPANGC_HEAP_MINIMUM_MB` | smallest collection trigger in MiB       |
//! | `SPANGC_BACKGROUND`      | `1`/`true` to run a collector thread     |
//! | `SPANGC_MEMPROFILERATE`  | bytes per heap profile sample, 0 for off |

use std::time::Duration;

pub use crate::profile::DEFAULT_MEM_PROFILE_RATE;

/// Default arena reservation (256 MiB).
pub const DEFAULT_ARENA_SIZE: usize = 256 << 20;

/// Default growth percent between cycles.
pub const DEFAULT_GC_PERCENT: u32 = 100;

/// Default minimum trigger (4 MiB), scaled by the growth percent.
pub const DEFAULT_HEAP_MINIMUM: usize = 4 << 20;

/// Default shadow stack capacity per worker.
pub const DEFAULT_STACK_SLOTS: usize = 4096;

/// Default number of global root slots.
pub const DEFAULT_GLOBAL_SLOTS: usize = 1024;

/// Default age after which idle free pages go back to the OS.
pub const DEFAULT_SCAVENGE_DELAY: Duration = Duration::from_secs(5 * 60);

/// Configuration of a [`Heap`](crate::Heap).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Bytes of address space reserved for the arena.
    pub arena_size: usize,
    /// Growth percent of the live heap before the next cycle starts.
    /// `None` disables automatic collection.
    pub gc_percent: Option<u32>,
    /// Trigger floor before scaling by `gc_percent`.
    pub heap_minimum: usize,
    /// Run triggered cycles, background sweeping and scavenging on a
    /// dedicated thread.
    pub background_collector: bool,
    /// Root slots in each worker's shadow stack.
    pub stack_slots: usize,
    /// Global root slots.
    pub global_slots: usize,
    /// Idle time before the background thread scavenges a free span.
    pub scavenge_delay: Duration,
    /// Average bytes allocated between heap profile samples; 0 disables
    /// sampling.
    pub mem_profile_rate: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            arena_size: DEFAULT_ARENA_SIZE,
            gc_percent: Some(DEFAULT_GC_PERCENT),
            heap_minimum: DEFAULT_HEAP_MINIMUM,
            background_collector: false,
            stack_slots: DEFAULT_STACK_SLOTS,
            global_slots: DEFAULT_GLOBAL_SLOTS,
            scavenge_delay: DEFAULT_SCAVENGE_DELAY,
            mem_profile_rate: DEFAULT_MEM_PROFILE_RATE,
        }
    }
}

impl HeapConfig {
    /// Defaults overridden by the `SPANGC_*` environment variables.
    ///
    /// Unparsable values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = var("SPANGC_GOGC") {
            self.gc_percent = match v.trim() {
                s if s.eq_ignore_ascii_case("off") => None,
                s => s.parse().map_or(self.gc_percent, Some),
            };
        }
        if let Some(mb) = var("SPANGC_ARENA_MB").and_then(|v| v.trim().parse::<usize>().ok()) {
            self.arena_size = mb << 20;
        }
        if let Some(mb) = var("SPANGC_HEAP_MINIMUM_MB").and_then(|v| v.trim().parse::<usize>().ok())
        {
            self.heap_minimum = mb << 20;
        }
        if let Some(v) = var("SPANGC_BACKGROUND") {
            self.background_collector = matches!(v.trim(), "1" | "true" | "on");
        }
        if let Some(rate) = var("SPANGC_MEMPROFILERATE").and_then(|v| v.trim().parse().ok()) {
            self.mem_profile_rate = rate;
        }
        self
    }

    /// Sets the arena reservation.
    #[must_use]
    pub const fn arena_size(mut self, bytes: usize) -> Self {
        self.arena_size = bytes;
        self
    }

    /// Sets the growth percent; `None` turns automatic collection off.
    #[must_use]
    pub const fn gc_percent(mut self, percent: Option<u32>) -> Self {
        self.gc_percent = percent;
        self
    }

    /// Sets the trigger floor.
    #[must_use]
    pub const fn heap_minimum(mut self, bytes: usize) -> Self {
        self.heap_minimum = bytes;
        self
    }

    /// Enables or disables the background collector thread.
    #[must_use]
    pub const fn background_collector(mut self, enabled: bool) -> Self {
        self.background_collector = enabled;
        self
    }

    /// Sets the shadow stack capacity of each worker.
    #[must_use]
    pub const fn stack_slots(mut self, slots: usize) -> Self {
        self.stack_slots = slots;
        self
    }

    /// Sets the number of global root slots.
    #[must_use]
    pub const fn global_slots(mut self, slots: usize) -> Self {
        self.global_slots = slots;
        self
    }

    /// Sets the scavenger idle delay.
    #[must_use]
    pub const fn scavenge_delay(mut self, delay: Duration) -> Self {
        self.scavenge_delay = delay;
        self
    }

    /// Sets the heap profile sampling rate; 0 turns sampling off.
    #[must_use]
    pub const fn mem_profile_rate(mut self, bytes: usize) -> Self {
        self.mem_profile_rate = bytes;
        self
    }

    /// Trigger floor for a given growth percent.
    pub(crate) fn scaled_heap_minimum(&self, percent: u32) -> u64 {
        (self.heap_minimum as u64).saturating_mul(u64::from(percent)) / 100
    }
}
