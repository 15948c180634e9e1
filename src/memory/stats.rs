//! Process-wide diagnostic gauges for file-backed memory.
//!
//! All counters use `Relaxed` ordering and are only eventually consistent
//! with each other. They are for display; allocation decisions use the
//! per-manager state.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Readers clamp transient negative values to zero.
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
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

// Bytes currently mapped from chunk files
crate::sync::static_atomic! {
    pub static MAPPED_BYTES: Counter = Counter::new();
}
// Chunk files currently alive
crate::sync::static_atomic! {
    pub static LIVE_CHUNKS: Counter = Counter::new();
}
// Allocations handed out and not yet freed or torn down
crate::sync::static_atomic! {
    pub static LIVE_ALLOCATIONS: Counter = Counter::new();
}
// Chunk bytes consumed by allocations, headers and padding included
crate::sync::static_atomic! {
    pub static USED_BYTES: Counter = Counter::new();
}

/// Snapshot of the process-wide gauges, summed over every manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessTotals {
    pub mapped_bytes: usize,
    pub live_chunks: usize,
    pub live_allocations: usize,
    pub used_bytes: usize,
}

#[must_use]
pub fn process_totals() -> ProcessTotals {
    ProcessTotals {
        mapped_bytes: MAPPED_BYTES.get(),
        live_chunks: LIVE_CHUNKS.get(),
        live_allocations: LIVE_ALLOCATIONS.get(),
        used_bytes: USED_BYTES.get(),
    }
}
