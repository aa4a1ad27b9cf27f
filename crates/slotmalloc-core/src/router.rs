//! Size-class router.
//!
//! Maps requests to a class, finds a candidate region with a free slot or
//! maps a new one, and drives the region lifecycle:
//! new/partial -> full (delisted) -> partial (relisted) -> empty (unmapped).
//!
//! The router is single-threaded; [`crate::Heap`] wraps it in the heap lock.

#![allow(unsafe_code)]

use std::ptr::NonNull;

use crate::directory::RegionDirectory;
use crate::error::AllocError;
use crate::page_source::{self, PageMapper, Region};
use crate::recycler::FreeResult;
use crate::size_class::{self, NUM_CLASSES};

/// A slot handed out by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    pub ptr: NonNull<u8>,
    /// Slot size of the region it came from.
    pub slot_size: usize,
    /// The region was mapped for this request, so the slot is still
    /// zero-filled apart from its link word.
    pub fresh: bool,
}

/// Consistency summary over every region of a router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Audit {
    pub regions: usize,
    pub live_slots: usize,
    pub free_slots: usize,
    /// Regions whose live count exceeds capacity, whose free list disagrees
    /// with the live count, or whose candidate-list membership disagrees with
    /// fullness.
    pub violations: usize,
}

/// Per-heap allocation state.
pub struct Router<M: PageMapper> {
    mapper: M,
    directory: RegionDirectory,
}

// SAFETY: the router exclusively owns every region its directory links to;
// the raw header pointers are never shared outside it.
unsafe impl<M: PageMapper + Send> Send for Router<M> {}

impl<M: PageMapper> Router<M> {
    pub const fn new(mapper: M) -> Self {
        Self {
            mapper,
            directory: RegionDirectory::new(),
        }
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    pub fn directory(&self) -> &RegionDirectory {
        &self.directory
    }

    /// Routes and serves a request of `size` bytes.
    pub fn allocate(&mut self, size: usize) -> Result<Acquired, AllocError> {
        let route = size_class::route(size)?;
        self.acquire_slot(route.class, route.slot_size)
    }

    /// Takes a slot from the first candidate of `class`, mapping a new
    /// region when there is none.
    pub fn acquire_slot(&mut self, class: usize, slot_size: usize) -> Result<Acquired, AllocError> {
        while let Some(region) = self.directory.first_candidate(class, slot_size) {
            let taken = region.with_recycler(|r| r.allocate().map(|p| (p, r.slot_size(), r.is_full())));
            match taken {
                Some((ptr, region_slot, full)) => {
                    if full {
                        self.directory.delist(region);
                    }
                    return Ok(Acquired {
                        ptr,
                        slot_size: region_slot,
                        fresh: false,
                    });
                }
                // Free list ran dry early; stop offering this region.
                None => self.directory.delist(region),
            }
        }
        self.create_region(class, slot_size)
    }

    fn create_region(&mut self, class: usize, slot_size: usize) -> Result<Acquired, AllocError> {
        let region = page_source::reserve(&self.mapper, class, slot_size)?;
        let Some(ptr) = region.with_recycler(|r| r.allocate()) else {
            // SAFETY: never linked or handed out.
            unsafe { page_source::release(&self.mapper, region) };
            return Err(AllocError::RegionTooSmall {
                slot_size,
                available: 0,
            });
        };
        if let Err(err) = self.directory.insert(region) {
            // SAFETY: never linked or handed out.
            unsafe { page_source::release(&self.mapper, region) };
            return Err(err);
        }
        Ok(Acquired {
            ptr,
            slot_size,
            fresh: true,
        })
    }

    fn resolve(&self, ptr: NonNull<u8>) -> Option<Region> {
        self.directory.find_containing(ptr.as_ptr() as usize, self.mapper.page_size())
    }

    /// Returns a slot to its region; relists a region that was full and
    /// unmaps one whose last live slot this was. `poison` overwrites the
    /// freed slot after its link word.
    ///
    /// Any pointer is accepted; ones that do not resolve to one of this
    /// router's regions come back as [`FreeResult::ForeignPointer`].
    ///
    /// # Safety
    ///
    /// If `ptr` is a live slot, its owner gives it up: the slot may be handed
    /// out again and, with `poison`, is overwritten.
    pub unsafe fn release_slot(&mut self, ptr: NonNull<u8>, poison: Option<u8>) -> FreeResult {
        let Some(region) = self.resolve(ptr) else {
            return FreeResult::ForeignPointer;
        };
        let (outcome, was_full, empty) = region.with_recycler(|r| {
            let was_full = r.is_full();
            let outcome = r.deallocate(ptr);
            if outcome == FreeResult::Released {
                if let Some(byte) = poison {
                    r.scrub_free_slot(ptr, byte);
                }
            }
            (outcome, was_full, r.is_empty())
        });
        if outcome != FreeResult::Released {
            return outcome;
        }
        if empty {
            self.directory.remove(region);
            // SAFETY: unlinked; its only live slot was just released.
            unsafe { page_source::release(&self.mapper, region) };
            return FreeResult::RegionReleased;
        }
        if was_full {
            self.directory.relist(region);
        }
        FreeResult::Released
    }

    /// Slot size behind a live pointer; `None` for anything else.
    #[must_use]
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let region = self.resolve(ptr)?;
        region.with_recycler(|r| r.is_live(ptr.as_ptr() as usize).then(|| r.slot_size()))
    }

    #[must_use]
    pub fn region_count(&self) -> usize {
        self.directory.region_count()
    }

    #[must_use]
    pub fn class_counts(&self) -> [usize; NUM_CLASSES] {
        std::array::from_fn(|class| self.directory.class_count(class))
    }

    /// Walks every region and checks its bookkeeping.
    #[must_use]
    pub fn audit(&self) -> Audit {
        let mut audit = Audit::default();
        for class in 0..NUM_CLASSES {
            for region in self.directory.regions(class) {
                audit.regions += 1;
                let (live, capacity, free, full) =
                    region.with_recycler(|r| (r.live(), r.capacity(), r.free_count(), r.is_full()));
                audit.live_slots += live;
                audit.free_slots += free;
                let bad_counts = live > capacity || live + free != capacity;
                let bad_listing = region.is_listed() == full;
                if bad_counts || bad_listing || region.class() != class {
                    audit.violations += 1;
                }
            }
        }
        audit
    }
}

impl<M: PageMapper> Drop for Router<M> {
    fn drop(&mut self) {
        while let Some(region) = self.directory.any_region() {
            self.directory.remove(region);
            // SAFETY: the router is going away; no slot may be used past it.
            unsafe { page_source::release(&self.mapper, region) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_source::SystemPages;
    use crate::size_class::LARGE_CLASS;

    fn router() -> Router<SystemPages> {
        Router::new(SystemPages)
    }

    #[test]
    fn first_allocation_maps_fresh_region() {
        let mut r = router();
        let a = r.allocate(10).unwrap();
        assert!(a.fresh);
        assert_eq!(a.slot_size, 16);
        let b = r.allocate(10).unwrap();
        assert!(!b.fresh);
        assert_eq!(r.region_count(), 1);
        assert_eq!(r.audit().violations, 0);
    }

    #[test]
    fn full_region_is_delisted_then_relisted() {
        let mut r = router();
        let first = r.allocate(1024).unwrap();
        let capacity = r
            .directory()
            .regions(6)
            .next()
            .unwrap()
            .with_recycler(|rec| rec.capacity());
        let mut ptrs = vec![first.ptr];
        for _ in 1..capacity {
            ptrs.push(r.allocate(1024).unwrap().ptr);
        }
        assert_eq!(r.directory().candidate_count(6), 0);
        assert_eq!(r.directory().class_count(6), 1);
        assert_eq!(r.audit().violations, 0);

        // SAFETY: live pointer from this router.
        assert_eq!(unsafe { r.release_slot(ptrs[0], None) }, FreeResult::Released);
        assert_eq!(r.directory().candidate_count(6), 1);

        let again = r.allocate(1000).unwrap();
        assert_eq!(again.ptr, ptrs[0]);
        assert_eq!(r.region_count(), 1);
    }

    #[test]
    fn empty_region_is_unmapped() {
        let mut r = router();
        let a = r.allocate(100).unwrap();
        let b = r.allocate(100).unwrap();
        // SAFETY: live pointers from this router.
        unsafe {
            assert_eq!(r.release_slot(a.ptr, None), FreeResult::Released);
            assert_eq!(r.release_slot(b.ptr, None), FreeResult::RegionReleased);
        }
        assert_eq!(r.region_count(), 0);
    }

    #[test]
    fn double_free_is_reported_not_applied() {
        let mut r = router();
        let keep = r.allocate(64).unwrap();
        let a = r.allocate(64).unwrap();
        // SAFETY: `a` is given up once.
        unsafe {
            assert_eq!(r.release_slot(a.ptr, None), FreeResult::Released);
            assert_eq!(r.release_slot(a.ptr, None), FreeResult::DoubleFree);
        }
        assert_eq!(r.audit().live_slots, 1);
        assert_eq!(r.usable_size(keep.ptr), Some(64));
    }

    #[test]
    fn large_requests_get_one_region_each() {
        let mut r = router();
        let a = r.allocate(5000).unwrap();
        let b = r.allocate(5000).unwrap();
        assert!(a.fresh && b.fresh);
        assert_eq!(a.slot_size, 5008);
        assert_eq!(r.class_counts()[LARGE_CLASS], 2);
        assert_eq!(r.directory().candidate_count(LARGE_CLASS), 0);
        // SAFETY: live pointers.
        unsafe {
            assert_eq!(r.release_slot(a.ptr, None), FreeResult::RegionReleased);
            assert_eq!(r.release_slot(b.ptr, None), FreeResult::RegionReleased);
        }
        assert_eq!(r.region_count(), 0);
    }

    #[test]
    fn poison_fills_released_slot() {
        let mut r = router();
        let _keep = r.allocate(32).unwrap();
        let a = r.allocate(32).unwrap();
        // SAFETY: region kept mapped by `_keep`.
        unsafe {
            assert_eq!(r.release_slot(a.ptr, Some(0xFE)), FreeResult::Released);
            let tail = std::slice::from_raw_parts(a.ptr.as_ptr().add(8), 24);
            assert!(tail.iter().all(|&b| b == 0xFE));
        }
    }

    #[test]
    fn interior_pointer_is_foreign() {
        let mut r = router();
        let a = r.allocate(64).unwrap();
        // SAFETY: interior of a live slot.
        let interior = unsafe { a.ptr.byte_add(8) };
        // SAFETY: rejected without touching the slot.
        assert_eq!(unsafe { r.release_slot(interior, None) }, FreeResult::ForeignPointer);
        assert_eq!(r.usable_size(interior), None);
        assert_eq!(r.audit().live_slots, 1);
    }

    #[test]
    fn free_after_region_unmapped_is_foreign() {
        let mut r = router();
        let a = r.allocate(1).unwrap();
        // SAFETY: `a` is given up once; the second call must not read the
        // unmapped header.
        unsafe {
            assert_eq!(r.release_slot(a.ptr, None), FreeResult::RegionReleased);
            assert_eq!(r.release_slot(a.ptr, None), FreeResult::ForeignPointer);
        }
        assert_eq!(r.usable_size(a.ptr), None);
        assert!(r.allocate(1).is_ok());
        assert_eq!(r.region_count(), 1);
    }
}
