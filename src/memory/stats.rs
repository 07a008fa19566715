//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., total may briefly disagree with the sum of
//! per-subsystem counters). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.
//!
//! Nothing here is touched on a successful claim or release; only
//! construction, teardown and exhaustion update counters.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }

    #[inline]
    pub fn fetch_add(&self, val: usize, ordering: Ordering) -> usize {
        self.0.fetch_add(Self::delta(val), ordering).max(0).cast_unsigned()
    }
}

// Total address space reserved by slot allocator arenas
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Total memory made readable/writable by slot allocator arenas
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}

// Breakdown by component
crate::sync::static_atomic! {
    pub static ARENA_COMMITTED: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static OCCUPANCY_COMMITTED: Counter = Counter::new();
}

// Allocations refused because their size class was full
crate::sync::static_atomic! {
    pub static EXHAUSTED_CLAIMS: Counter = Counter::new();
}

/// Point-in-time copy of the process-wide counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub arena_committed: usize,
    pub occupancy_committed: usize,
    pub exhausted_claims: usize,
}

#[must_use]
pub fn snapshot() -> MemoryStats {
    MemoryStats {
        total_reserved: TOTAL_RESERVED.load(Ordering::Relaxed),
        total_committed: TOTAL_COMMITTED.load(Ordering::Relaxed),
        arena_committed: ARENA_COMMITTED.load(Ordering::Relaxed),
        occupancy_committed: OCCUPANCY_COMMITTED.load(Ordering::Relaxed),
        exhausted_claims: EXHAUSTED_CLAIMS.load(Ordering::Relaxed),
    }
}
