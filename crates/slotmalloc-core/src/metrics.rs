//! Atomic counters for allocator observability.
//!
//! All counters use relaxed ordering. They are diagnostic, not
//! synchronization primitives, and are updated outside the heap lock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-heap operation counters.
pub struct AllocatorMetrics {
    /// Successful allocations (including zeroed and moved resizes).
    pub allocations: AtomicU64,
    /// Successful slot releases.
    pub deallocations: AtomicU64,
    /// Allocations served from a freshly mapped region.
    pub fresh_region_allocations: AtomicU64,
    /// Zeroed allocations served.
    pub zeroed_allocations: AtomicU64,
    /// Resizes answered with the same pointer.
    pub resizes_in_place: AtomicU64,
    /// Resizes that moved data to a new slot.
    pub resizes_moved: AtomicU64,
    /// Requests rejected as invalid (zero size, overflowing arithmetic).
    pub invalid_requests: AtomicU64,
    /// Requests that failed because the OS refused memory.
    pub exhaustion_failures: AtomicU64,
    /// Frees of a pointer already on its region's free list.
    pub double_frees_ignored: AtomicU64,
    /// Frees of a pointer not owned by this heap.
    pub foreign_frees_ignored: AtomicU64,
    /// Frees rejected because the region had no live slots.
    pub underflows_ignored: AtomicU64,
    /// Regions returned to the OS.
    pub regions_released: AtomicU64,
    /// Calls refused because the heap state was already borrowed on this
    /// thread.
    pub reentrant_calls_refused: AtomicU64,
}

impl AllocatorMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            fresh_region_allocations: AtomicU64::new(0),
            zeroed_allocations: AtomicU64::new(0),
            resizes_in_place: AtomicU64::new(0),
            resizes_moved: AtomicU64::new(0),
            invalid_requests: AtomicU64::new(0),
            exhaustion_failures: AtomicU64::new(0),
            double_frees_ignored: AtomicU64::new(0),
            foreign_frees_ignored: AtomicU64::new(0),
            underflows_ignored: AtomicU64::new(0),
            regions_released: AtomicU64::new(0),
            reentrant_calls_refused: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations: Self::get(&self.allocations),
            deallocations: Self::get(&self.deallocations),
            fresh_region_allocations: Self::get(&self.fresh_region_allocations),
            zeroed_allocations: Self::get(&self.zeroed_allocations),
            resizes_in_place: Self::get(&self.resizes_in_place),
            resizes_moved: Self::get(&self.resizes_moved),
            invalid_requests: Self::get(&self.invalid_requests),
            exhaustion_failures: Self::get(&self.exhaustion_failures),
            double_frees_ignored: Self::get(&self.double_frees_ignored),
            foreign_frees_ignored: Self::get(&self.foreign_frees_ignored),
            underflows_ignored: Self::get(&self.underflows_ignored),
            regions_released: Self::get(&self.regions_released),
            reentrant_calls_refused: Self::get(&self.reentrant_calls_refused),
        }
    }
}

impl Default for AllocatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`AllocatorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub allocations: u64,
    pub deallocations: u64,
    pub fresh_region_allocations: u64,
    pub zeroed_allocations: u64,
    pub resizes_in_place: u64,
    pub resizes_moved: u64,
    pub invalid_requests: u64,
    pub exhaustion_failures: u64,
    pub double_frees_ignored: u64,
    pub foreign_frees_ignored: u64,
    pub underflows_ignored: u64,
    pub regions_released: u64,
    pub reentrant_calls_refused: u64,
}

impl MetricsSnapshot {
    /// Allocations not yet matched by a release.
    #[must_use]
    pub const fn outstanding(&self) -> u64 {
        self.allocations.saturating_sub(self.deallocations)
    }

    /// Total misuse events that were detected and ignored.
    #[must_use]
    pub const fn misuse_ignored(&self) -> u64 {
        self.double_frees_ignored + self.foreign_frees_ignored + self.underflows_ignored
    }
}
