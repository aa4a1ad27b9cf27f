#![allow(unsafe_code)]

use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use slotmalloc_core::size_class::LARGE_CLASS;
use slotmalloc_core::{FreeResult, Heap, Mode, ModeSource, PageMapper, SystemPages};

/// Kernel mappings with live counters and an optional map budget.
#[derive(Clone)]
struct CountingPages {
    maps: Arc<AtomicUsize>,
    unmaps: Arc<AtomicUsize>,
    mapped_bytes: Arc<AtomicUsize>,
    budget: Option<usize>,
}

impl CountingPages {
    fn new(budget: Option<usize>) -> Self {
        Self {
            maps: Arc::default(),
            unmaps: Arc::default(),
            mapped_bytes: Arc::default(),
            budget,
        }
    }

    fn outstanding(&self) -> usize {
        self.maps.load(Ordering::SeqCst) - self.unmaps.load(Ordering::SeqCst)
    }
}

impl PageMapper for CountingPages {
    fn page_size(&self) -> usize {
        SystemPages.page_size()
    }

    fn map(&self, len: usize) -> Option<NonNull<u8>> {
        if let Some(budget) = self.budget {
            if self.maps.load(Ordering::SeqCst) >= budget {
                return None;
            }
        }
        let base = SystemPages.map(len)?;
        self.maps.fetch_add(1, Ordering::SeqCst);
        self.mapped_bytes.fetch_add(len, Ordering::SeqCst);
        Some(base)
    }

    unsafe fn unmap(&self, base: NonNull<u8>, len: usize) {
        self.unmaps.fetch_add(1, Ordering::SeqCst);
        self.mapped_bytes.fetch_sub(len, Ordering::SeqCst);
        // SAFETY: forwarded from the caller.
        unsafe { SystemPages.unmap(base, len) };
    }
}

fn counted(budget: Option<usize>) -> (Heap<CountingPages>, CountingPages) {
    let pages = CountingPages::new(budget);
    let heap = Heap::with_config(pages.clone(), ModeSource::Fixed(Mode::Strict));
    (heap, pages)
}

#[test]
fn basic_cycle() {
    let heap = Heap::new().with_mode(Mode::Strict);
    let p = heap.allocate(10).expect("allocate");
    assert_eq!(p.as_ptr() as usize % 16, 0);
    // SAFETY: 10 writable bytes, then free a live pointer.
    unsafe {
        ptr::write_bytes(p.as_ptr(), 0x5A, 10);
        assert_eq!(heap.deallocate(p.as_ptr()), FreeResult::RegionReleased);
    }
}

#[test]
fn growth_preserves_bytes() {
    let heap = Heap::new().with_mode(Mode::Strict);
    let p = heap.allocate(10).unwrap();
    let pattern: Vec<u8> = (0..10).map(|i| 0xA0 | i).collect();
    // SAFETY: live pointer with at least 10 bytes.
    let q = unsafe {
        ptr::copy_nonoverlapping(pattern.as_ptr(), p.as_ptr(), 10);
        heap.resize(p.as_ptr(), 20).unwrap()
    };
    // SAFETY: q has at least 20 bytes.
    let got = unsafe { std::slice::from_raw_parts(q.as_ptr(), 10) };
    assert_eq!(got, pattern.as_slice());
}

#[test]
fn shrink_is_noop() {
    let heap = Heap::new().with_mode(Mode::Strict);
    let p = heap.allocate_zeroed(33, 1).unwrap();
    // SAFETY: live pointer.
    assert_eq!(unsafe { heap.resize(p.as_ptr(), 10) }, Some(p));
}

#[test]
fn zeroed_twenty_bytes() {
    let heap = Heap::new().with_mode(Mode::Strict);
    // Dirty a slot first so the zeroed request reuses it.
    let keep = heap.allocate(20).unwrap();
    let dirty = heap.allocate(20).unwrap();
    // SAFETY: live pointers within their slots.
    unsafe {
        ptr::write_bytes(dirty.as_ptr(), 0xFF, 32);
        heap.deallocate(dirty.as_ptr());
    }
    let z = heap.allocate_zeroed(20, 1).unwrap();
    // SAFETY: 20 readable bytes.
    let bytes = unsafe { std::slice::from_raw_parts(z.as_ptr(), 20) };
    assert!(bytes.iter().all(|&b| b == 0));
    // SAFETY: live pointers.
    unsafe {
        heap.deallocate(z.as_ptr());
        heap.deallocate(keep.as_ptr());
    }
}

#[test]
fn overflow_rejected() {
    let heap = Heap::new().with_mode(Mode::Strict);
    assert!(heap.allocate_zeroed(usize::MAX, 2).is_none());
    assert!(heap.allocate(usize::MAX).is_none());
    assert_eq!(heap.region_count(), 0);
}

#[test]
fn regions_are_unmapped_when_empty() {
    let (heap, pages) = counted(None);
    let ptrs: Vec<_> = (0..200).map(|i| heap.allocate(1 + i % 100).unwrap()).collect();
    assert!(pages.outstanding() > 0);
    assert_eq!(pages.outstanding(), heap.region_count());
    for p in ptrs {
        // SAFETY: live pointers, each freed once.
        unsafe { heap.deallocate(p.as_ptr()) };
    }
    assert_eq!(pages.outstanding(), 0);
    assert_eq!(pages.mapped_bytes.load(Ordering::SeqCst), 0);
    assert_eq!(heap.region_count(), 0);
}

#[test]
fn large_region_is_exactly_sized() {
    let (heap, pages) = counted(None);
    let page = pages.page_size();
    let p = heap.allocate(page * 3).unwrap();
    assert_eq!(heap.class_counts()[LARGE_CLASS], 1);
    // Header plus three pages rounds to four.
    assert_eq!(pages.mapped_bytes.load(Ordering::SeqCst), page * 4);
    // SAFETY: live pointer.
    assert_eq!(unsafe { heap.usable_size(p.as_ptr()) }, Some(page * 3));
    // SAFETY: whole slot is writable.
    unsafe {
        ptr::write_bytes(p.as_ptr(), 1, page * 3);
        assert_eq!(heap.deallocate(p.as_ptr()), FreeResult::RegionReleased);
    }
    assert_eq!(pages.outstanding(), 0);
}

#[test]
fn exhaustion_is_ordinary_failure() {
    let (heap, pages) = counted(Some(1));
    let a = heap.allocate(64).unwrap();
    // The first region still serves its own class.
    let b = heap.allocate(64).unwrap();
    // Other classes need a new mapping and fail.
    assert!(heap.allocate(512).is_none());
    assert!(heap.allocate_zeroed(100, 100).is_none());
    assert_eq!(heap.stats().exhaustion_failures, 2);
    assert_eq!(pages.maps.load(Ordering::SeqCst), 1);
    // Existing allocations stay valid.
    // SAFETY: live pointers.
    unsafe {
        ptr::write_bytes(a.as_ptr(), 1, 64);
        ptr::write_bytes(b.as_ptr(), 2, 64);
        assert_eq!(*a.as_ptr(), 1);
    }
}

#[test]
fn failed_resize_keeps_original() {
    let (heap, _pages) = counted(Some(1));
    let p = heap.allocate(16).unwrap();
    // SAFETY: live pointer.
    unsafe {
        p.as_ptr().write(0x42);
        assert!(heap.resize(p.as_ptr(), 4096).is_none());
        assert_eq!(p.as_ptr().read(), 0x42);
        assert_eq!(heap.usable_size(p.as_ptr()), Some(16));
    }
}

#[test]
fn foreign_free_into_live_region_is_ignored() {
    let heap = Heap::new().with_mode(Mode::Strict);
    let p = heap.allocate(256).unwrap();
    // SAFETY: writes inside the slot; the interior free is rejected unread.
    unsafe {
        ptr::write_bytes(p.as_ptr(), 0x33, 256);
        let interior = p.as_ptr().add(48);
        assert_eq!(heap.deallocate(interior), FreeResult::ForeignPointer);
        assert!((0..256).all(|i| *p.as_ptr().add(i) == 0x33));
    }
    assert_eq!(heap.stats().foreign_frees_ignored, 1);
    assert_eq!(heap.region_count(), 1);
}

#[test]
fn pointer_from_other_heap_is_foreign() {
    let mine = Heap::new().with_mode(Mode::Strict);
    let theirs = Heap::new().with_mode(Mode::Strict);
    let _anchor = mine.allocate(32).unwrap();
    let p = theirs.allocate(32).unwrap();
    // SAFETY: rejected without touching `theirs`' slot.
    assert_eq!(unsafe { mine.deallocate(p.as_ptr()) }, FreeResult::ForeignPointer);
    // SAFETY: live pointer of `theirs`.
    assert_eq!(unsafe { theirs.deallocate(p.as_ptr()) }, FreeResult::RegionReleased);
}

#[test]
fn dropping_heap_returns_every_region() {
    let (heap, pages) = counted(None);
    for size in [8, 40, 300, 1000, 2000, 70_000] {
        heap.allocate(size).unwrap();
    }
    assert_eq!(pages.outstanding(), 6);
    drop(heap);
    assert_eq!(pages.outstanding(), 0);
}

#[test]
fn strict_double_free_after_region_unmapped() {
    let (heap, pages) = counted(None);
    let p = heap.allocate(1).unwrap();
    // SAFETY: `p` is given up by the first free; the repeat must be rejected
    // without reading the unmapped page.
    unsafe {
        assert_eq!(heap.deallocate(p.as_ptr()), FreeResult::RegionReleased);
        assert_eq!(heap.deallocate(p.as_ptr()), FreeResult::ForeignPointer);
    }
    assert_eq!(pages.outstanding(), 0);
    let q = heap.allocate(1).expect("heap usable after stale free");
    assert_eq!(pages.outstanding(), 1);
    assert_eq!(heap.stats().foreign_frees_ignored, 1);
    // SAFETY: live pointer.
    assert_eq!(unsafe { heap.deallocate(q.as_ptr()) }, FreeResult::RegionReleased);
}

#[test]
fn stale_frees_across_many_released_regions() {
    let (heap, pages) = counted(None);
    let stale: Vec<_> = (0..64).map(|i| heap.allocate(2000 + i * 100).unwrap()).collect();
    assert_eq!(pages.outstanding(), 64);
    for p in &stale {
        // SAFETY: live pointers, each given up once.
        assert_eq!(unsafe { heap.deallocate(p.as_ptr()) }, FreeResult::RegionReleased);
    }
    for p in &stale {
        // SAFETY: stale pointers into unmapped regions are rejected unread.
        assert_eq!(unsafe { heap.deallocate(p.as_ptr()) }, FreeResult::ForeignPointer);
    }
    assert_eq!(heap.stats().foreign_frees_ignored, 64);
    assert_eq!(heap.region_count(), 0);
}
