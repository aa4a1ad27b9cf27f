//! Public allocation API.
//!
//! A [`Heap`] owns one router behind the re-entrant heap lock plus a set of
//! counters. Every entry point collapses internal errors to `None`/null and
//! never panics across the boundary; misuse on the free path is counted and
//! ignored.

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::ptr::{self, NonNull};

use crate::config::{self, Mode, POISON_BYTE};
use crate::error::AllocError;
use crate::guard::{self, HeapLock};
use crate::metrics::{AllocatorMetrics, MetricsSnapshot};
use crate::page_source::{PageMapper, SystemPages};
use crate::recycler::FreeResult;
use crate::router::{Acquired, Audit, Router};
use crate::size_class::NUM_CLASSES;
use crate::util;

/// Where a heap takes its [`Mode`] from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSource {
    /// `SLOTMALLOC_MODE`, read once per process.
    FromEnv,
    Fixed(Mode),
}

/// Thread-safe page-backed allocator.
pub struct Heap<M: PageMapper = SystemPages> {
    state: HeapLock<RefCell<Router<M>>>,
    metrics: AllocatorMetrics,
    mode: ModeSource,
}

impl Heap<SystemPages> {
    /// Heap over kernel mappings, configured from the environment.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_config(SystemPages, ModeSource::FromEnv)
    }
}

impl Default for Heap<SystemPages> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: PageMapper> Heap<M> {
    pub const fn with_mapper(mapper: M) -> Self {
        Self::with_config(mapper, ModeSource::FromEnv)
    }

    pub const fn with_config(mapper: M, mode: ModeSource) -> Self {
        Self {
            state: guard::heap_lock(RefCell::new(Router::new(mapper))),
            metrics: AllocatorMetrics::new(),
            mode,
        }
    }

    /// Pins the mode, ignoring the environment.
    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = ModeSource::Fixed(mode);
        self
    }

    /// Effective mode.
    pub fn mode(&self) -> Mode {
        match self.mode {
            ModeSource::FromEnv => config::mode(),
            ModeSource::Fixed(mode) => mode,
        }
    }

    pub fn metrics(&self) -> &AllocatorMetrics {
        &self.metrics
    }

    pub fn stats(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn with_router<R>(&self, f: impl FnOnce(&mut Router<M>) -> R) -> Result<R, AllocError> {
        let guard = self.state.lock();
        let mut router = guard.try_borrow_mut().map_err(|_| AllocError::Reentered)?;
        Ok(f(&mut router))
    }

    fn note_error(&self, err: AllocError) {
        if err.is_invalid_input() {
            AllocatorMetrics::inc(&self.metrics.invalid_requests);
        } else if err.is_exhaustion() {
            AllocatorMetrics::inc(&self.metrics.exhaustion_failures);
        } else if err == AllocError::Reentered {
            AllocatorMetrics::inc(&self.metrics.reentrant_calls_refused);
        }
    }

    fn acquire(&self, size: usize) -> Result<Acquired, AllocError> {
        let acquired = self.with_router(|r| r.allocate(size))??;
        AllocatorMetrics::inc(&self.metrics.allocations);
        if acquired.fresh {
            AllocatorMetrics::inc(&self.metrics.fresh_region_allocations);
        }
        Ok(acquired)
    }

    /// Allocates at least `size` bytes aligned to 16. `None` for zero size,
    /// overflow, or when the OS refuses memory.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        match self.acquire(size) {
            Ok(acquired) => Some(acquired.ptr),
            Err(err) => {
                self.note_error(err);
                None
            }
        }
    }

    /// Allocates `count * size` zeroed bytes. `None` if the product
    /// overflows or is zero.
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let Some(total) = util::checked_mul(count, size) else {
            self.note_error(AllocError::SizeOverflow);
            return None;
        };
        let acquired = match self.acquire(total) {
            Ok(acquired) => acquired,
            Err(err) => {
                self.note_error(err);
                return None;
            }
        };
        AllocatorMetrics::inc(&self.metrics.zeroed_allocations);
        let ptr = acquired.ptr;
        // SAFETY: the slot is at least `total` bytes and 16-byte aligned.
        unsafe {
            if acquired.fresh {
                // Freshly mapped memory is zero apart from the free-list link.
                ptr.cast::<usize>().as_ptr().write(0);
            } else {
                ptr.as_ptr().write_bytes(0, total);
            }
        }
        Some(ptr)
    }

    /// Releases `ptr`. Null is a no-op; double, foreign and interior frees are
    /// ignored and counted.
    ///
    /// Any address is accepted in both modes: a pointer whose page is not
    /// the base of one of this heap's mapped regions is rejected before any
    /// memory is read. A free from inside a closure that already holds the
    /// heap state is refused and counted as
    /// [`MetricsSnapshot::reentrant_calls_refused`].
    ///
    /// # Safety
    ///
    /// If `ptr` is a live allocation of this heap, the caller gives it up and
    /// must not use it again.
    pub unsafe fn deallocate(&self, ptr: *mut u8) -> FreeResult {
        let Some(ptr) = NonNull::new(ptr) else {
            return FreeResult::Null;
        };
        let poison = self.mode().poisons_freed_slots().then_some(POISON_BYTE);
        // SAFETY: forwarded to the caller's contract.
        match self.with_router(|r| unsafe { r.release_slot(ptr, poison) }) {
            Ok(outcome) => {
                self.record_free(outcome);
                outcome
            }
            Err(err) => {
                self.note_error(err);
                FreeResult::ForeignPointer
            }
        }
    }

    fn record_free(&self, outcome: FreeResult) {
        let m = &self.metrics;
        match outcome {
            FreeResult::Released => AllocatorMetrics::inc(&m.deallocations),
            FreeResult::RegionReleased => {
                AllocatorMetrics::inc(&m.deallocations);
                AllocatorMetrics::inc(&m.regions_released);
            }
            FreeResult::DoubleFree => AllocatorMetrics::inc(&m.double_frees_ignored),
            FreeResult::ForeignPointer => AllocatorMetrics::inc(&m.foreign_frees_ignored),
            FreeResult::Underflow => AllocatorMetrics::inc(&m.underflows_ignored),
            FreeResult::Null => {}
        }
    }

    /// Bytes usable behind a live pointer (its slot size); `None` for null,
    /// freed and foreign pointers.
    ///
    /// # Safety
    ///
    /// Nothing is read for pointers this heap does not own; the function stays
    /// `unsafe` to match the rest of the pointer-taking API.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> Option<usize> {
        let ptr = NonNull::new(ptr)?;
        match self.with_router(|r| r.usable_size(ptr)) {
            Ok(size) => size,
            Err(err) => {
                self.note_error(err);
                None
            }
        }
    }

    /// Resizes an allocation, preserving `min(old, new)` bytes.
    ///
    /// - null `ptr` behaves as [`Heap::allocate`];
    /// - `new_size == 0` frees `ptr` and returns `None`;
    /// - a size that still fits the current slot returns `ptr` unchanged;
    /// - otherwise the data moves to a new slot and `ptr` is freed.
    ///
    /// On failure `None` is returned and `ptr` stays valid. A pointer that is
    /// not a live slot of this heap yields `None` in strict mode and a fresh
    /// allocation in hardened mode.
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::deallocate`].
    pub unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        let Some(old) = NonNull::new(ptr) else {
            return self.allocate(new_size);
        };
        if new_size == 0 {
            // SAFETY: forwarded to the caller's contract.
            unsafe { self.deallocate(ptr) };
            return None;
        }

        // Held across the nested calls so the move is atomic to other threads.
        let _outer = self.state.lock();

        // SAFETY: forwarded to the caller's contract.
        let Some(old_size) = (unsafe { self.usable_size(ptr) }) else {
            if self.mode().resize_unknown_as_allocate() {
                return self.allocate(new_size);
            }
            AllocatorMetrics::inc(&self.metrics.invalid_requests);
            return None;
        };
        let Some(aligned) = util::align_up(new_size) else {
            self.note_error(AllocError::SizeOverflow);
            return None;
        };
        if aligned <= old_size {
            AllocatorMetrics::inc(&self.metrics.resizes_in_place);
            return Some(old);
        }

        let new = self.allocate(new_size)?;
        // SAFETY: both slots are live, distinct, and at least this long.
        unsafe {
            ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(new_size));
            self.deallocate(ptr);
        }
        AllocatorMetrics::inc(&self.metrics.resizes_moved);
        Some(new)
    }

    /// Regions currently mapped.
    pub fn region_count(&self) -> usize {
        self.with_router(|r| r.region_count()).unwrap_or(0)
    }

    /// Regions currently mapped, per class.
    pub fn class_counts(&self) -> [usize; NUM_CLASSES] {
        self.with_router(|r| r.class_counts())
            .unwrap_or([0; NUM_CLASSES])
    }

    /// Bookkeeping check over every region.
    pub fn audit(&self) -> Option<Audit> {
        self.with_router(|r| r.audit()).ok()
    }

    /// Runs `f` against the mapper while holding the heap lock.
    pub fn with_mapper_ref<R>(&self, f: impl FnOnce(&M) -> R) -> Option<R> {
        self.with_router(|r| f(r.mapper())).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> Heap {
        Heap::new().with_mode(Mode::Strict)
    }

    fn hardened() -> Heap {
        Heap::new().with_mode(Mode::Hardened)
    }

    #[test]
    fn zero_size_is_null() {
        let heap = strict();
        assert!(heap.allocate(0).is_none());
        assert_eq!(heap.stats().invalid_requests, 1);
        assert_eq!(heap.region_count(), 0);
    }

    #[test]
    fn allocations_are_aligned() {
        let heap = strict();
        for size in [1, 15, 16, 17, 100, 1000, 1024, 1025, 9000] {
            let p = heap.allocate(size).unwrap();
            assert_eq!(p.as_ptr() as usize % util::ALIGNMENT, 0, "size {size}");
        }
    }

    #[test]
    fn basic_cycle_releases_region() {
        let heap = strict();
        let p = heap.allocate(10).unwrap();
        assert_eq!(heap.region_count(), 1);
        // SAFETY: live pointer.
        assert_eq!(unsafe { heap.deallocate(p.as_ptr()) }, FreeResult::RegionReleased);
        assert_eq!(heap.region_count(), 0);
        let s = heap.stats();
        assert_eq!((s.allocations, s.deallocations, s.regions_released), (1, 1, 1));
    }

    #[test]
    fn free_null_is_noop() {
        let heap = strict();
        // SAFETY: null is always accepted.
        assert_eq!(unsafe { heap.deallocate(ptr::null_mut()) }, FreeResult::Null);
        assert_eq!(heap.stats(), MetricsSnapshot::default());
    }

    #[test]
    fn resize_grows_preserving_bytes() {
        let heap = strict();
        let p = heap.allocate(10).unwrap();
        // SAFETY: writes within the 16-byte slot, then resize a live pointer.
        unsafe {
            for i in 0..10 {
                p.as_ptr().add(i).write(i as u8 + 1);
            }
            let q = heap.resize(p.as_ptr(), 20).unwrap();
            assert_ne!(p, q);
            for i in 0..10 {
                assert_eq!(q.as_ptr().add(i).read(), i as u8 + 1);
            }
            assert_eq!(heap.usable_size(q.as_ptr()), Some(32));
        }
        assert_eq!(heap.stats().resizes_moved, 1);
    }

    #[test]
    fn resize_shrink_keeps_pointer() {
        let heap = strict();
        let p = heap.allocate_zeroed(33, 1).unwrap();
        // SAFETY: live pointer.
        let q = unsafe { heap.resize(p.as_ptr(), 10) };
        assert_eq!(q, Some(p));
        assert_eq!(heap.stats().resizes_in_place, 1);
    }

    #[test]
    fn resize_to_zero_frees() {
        let heap = strict();
        let p = heap.allocate(48).unwrap();
        // SAFETY: live pointer.
        assert!(unsafe { heap.resize(p.as_ptr(), 0) }.is_none());
        assert_eq!(heap.region_count(), 0);
    }

    #[test]
    fn resize_null_allocates() {
        let heap = strict();
        // SAFETY: null is always accepted.
        let p = unsafe { heap.resize(ptr::null_mut(), 64) };
        assert!(p.is_some());
    }

    #[test]
    fn zeroed_allocation_is_zero() {
        let heap = strict();
        let p = heap.allocate_zeroed(20, 1).unwrap();
        // SAFETY: 20 readable bytes.
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 20) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn zeroed_recycled_slot_is_cleared() {
        let heap = strict();
        let keep = heap.allocate(64).unwrap();
        let p = heap.allocate(64).unwrap();
        // SAFETY: live pointers; `keep` holds the region mapped.
        unsafe {
            p.as_ptr().write_bytes(0xAB, 64);
            heap.deallocate(p.as_ptr());
            let z = heap.allocate_zeroed(8, 8).unwrap();
            assert_eq!(z, p);
            let bytes = std::slice::from_raw_parts(z.as_ptr(), 64);
            assert!(bytes.iter().all(|&b| b == 0));
            heap.deallocate(keep.as_ptr());
        }
    }

    #[test]
    fn zeroed_overflow_is_null() {
        let heap = strict();
        assert!(heap.allocate_zeroed(usize::MAX, 2).is_none());
        assert!(heap.allocate_zeroed(0, 8).is_none());
        assert_eq!(heap.stats().invalid_requests, 2);
    }

    #[test]
    fn double_free_is_ignored_and_counted() {
        let heap = strict();
        let keep = heap.allocate(32).unwrap();
        let p = heap.allocate(32).unwrap();
        // SAFETY: `p` is given up once.
        unsafe {
            assert_eq!(heap.deallocate(p.as_ptr()), FreeResult::Released);
            assert_eq!(heap.deallocate(p.as_ptr()), FreeResult::DoubleFree);
        }
        assert_eq!(heap.stats().double_frees_ignored, 1);
        assert_eq!(heap.audit().unwrap().live_slots, 1);
        // SAFETY: live pointer.
        assert_eq!(unsafe { heap.deallocate(keep.as_ptr()) }, FreeResult::RegionReleased);
    }

    #[test]
    fn strict_resize_of_unknown_pointer_fails() {
        let heap = strict();
        let keep = heap.allocate(64).unwrap();
        // SAFETY: interior pointer of a live slot.
        let interior = unsafe { keep.as_ptr().add(16) };
        // SAFETY: rejected without touching the slot.
        assert!(unsafe { heap.resize(interior, 8) }.is_none());
        assert_eq!(heap.audit().unwrap().live_slots, 1);
    }

    #[test]
    fn hardened_resize_of_unknown_pointer_allocates() {
        let heap = hardened();
        let mut local = [0u8; 32];
        // SAFETY: unknown pages are never read.
        let p = unsafe { heap.resize(local.as_mut_ptr(), 40) };
        assert!(p.is_some());
        assert_eq!(local, [0; 32]);
    }

    #[test]
    fn hardened_ignores_stack_pointer_free() {
        let heap = hardened();
        let mut local = [7u8; 64];
        // SAFETY: unknown pages are never read.
        let outcome = unsafe { heap.deallocate(local.as_mut_ptr()) };
        assert_eq!(outcome, FreeResult::ForeignPointer);
        assert_eq!(local, [7; 64]);
        assert_eq!(heap.stats().foreign_frees_ignored, 1);
    }

    #[test]
    fn hardened_poisons_freed_slot() {
        let heap = hardened();
        let keep = heap.allocate(64).unwrap();
        let p = heap.allocate(64).unwrap();
        // SAFETY: region held mapped by `keep`; reading freed storage in-process.
        unsafe {
            heap.deallocate(p.as_ptr());
            let tail = std::slice::from_raw_parts(p.as_ptr().add(8), 56);
            assert!(tail.iter().all(|&b| b == POISON_BYTE));
            heap.deallocate(keep.as_ptr());
        }
    }

    #[test]
    fn strict_double_free_after_region_release_is_ignored() {
        let heap = strict();
        let p = heap.allocate(1).unwrap();
        // SAFETY: `p` is given up once; the repeat free must not touch the
        // unmapped page.
        unsafe {
            assert_eq!(heap.deallocate(p.as_ptr()), FreeResult::RegionReleased);
            assert_eq!(heap.deallocate(p.as_ptr()), FreeResult::ForeignPointer);
            assert_eq!(heap.usable_size(p.as_ptr()), None);
        }
        assert_eq!(heap.stats().foreign_frees_ignored, 1);
        let q = heap.allocate(1).unwrap();
        assert_eq!(heap.region_count(), 1);
        // SAFETY: live pointer.
        assert_eq!(unsafe { heap.deallocate(q.as_ptr()) }, FreeResult::RegionReleased);
    }

    #[test]
    fn strict_ignores_stack_pointer_free() {
        let heap = strict();
        let _keep = heap.allocate(16).unwrap();
        let mut local = [7u8; 64];
        // SAFETY: unknown pages are never read.
        let outcome = unsafe { heap.deallocate(local.as_mut_ptr()) };
        assert_eq!(outcome, FreeResult::ForeignPointer);
        assert_eq!(local, [7; 64]);
    }

    #[test]
    fn reentrant_free_is_refused_and_counted() {
        let heap = strict();
        let p = heap.allocate(32).unwrap();
        // SAFETY: the nested free is refused, so `p` stays live.
        let nested = heap.with_mapper_ref(|_| unsafe { heap.deallocate(p.as_ptr()) });
        assert_eq!(nested, Some(FreeResult::ForeignPointer));
        assert_eq!(heap.with_mapper_ref(|_| heap.allocate(16)), Some(None));
        let stats = heap.stats();
        assert_eq!(stats.reentrant_calls_refused, 2);
        assert_eq!(stats.foreign_frees_ignored, 0);
        assert_eq!(heap.audit().unwrap().live_slots, 1);
        // SAFETY: live pointer.
        assert_eq!(unsafe { heap.deallocate(p.as_ptr()) }, FreeResult::RegionReleased);
    }
}
