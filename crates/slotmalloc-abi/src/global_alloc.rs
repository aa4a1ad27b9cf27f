//! `#[global_allocator]` support.
//!
//! ```rust,ignore
//! use slotmalloc_abi::SlotMalloc;
//!
//! #[global_allocator]
//! static GLOBAL: SlotMalloc = SlotMalloc;
//! ```
//!
//! Every slot is 16-byte aligned. Power-of-two class slots are also aligned
//! to their own size, so alignments up to 1024 are served by requesting
//! `max(size, align)` bytes. Larger alignments, or over-aligned requests that
//! land in the large class, fail with null.

use std::alloc::{GlobalAlloc, Layout};
use std::ptr;

use slotmalloc_core::size_class::MAX_SMALL_SIZE;
use slotmalloc_core::util::ALIGNMENT;

use crate::HEAP;

/// Zero-sized handle to the process-wide heap.
pub struct SlotMalloc;

/// Request size that yields a slot aligned to `layout.align()`, or `None`
/// if no class can provide that alignment.
#[must_use]
pub fn request_size(layout: Layout) -> Option<usize> {
    let size = layout.size();
    let align = layout.align();
    if align <= ALIGNMENT {
        return Some(size);
    }
    let rounded = size.max(align);
    (rounded <= MAX_SMALL_SIZE).then_some(rounded)
}

// SAFETY: every pointer comes from HEAP with at least `layout.size()` bytes
// and the alignment checked by `request_size`.
unsafe impl GlobalAlloc for SlotMalloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return layout.align() as *mut u8;
        }
        request_size(layout)
            .and_then(|n| HEAP.allocate(n))
            .map_or(ptr::null_mut(), |p| p.as_ptr())
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return layout.align() as *mut u8;
        }
        request_size(layout)
            .and_then(|n| HEAP.allocate_zeroed(1, n))
            .map_or(ptr::null_mut(), |p| p.as_ptr())
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        // SAFETY: ptr came from `alloc` on this heap and is live.
        unsafe {
            HEAP.deallocate(ptr);
        }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let old_size = layout.size();
        let align = layout.align();
        // SAFETY: GlobalAlloc guarantees a valid layout for `new_size`.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, align) };
        if old_size == 0 {
            // SAFETY: new_layout is non-zero sized per the realloc contract.
            return unsafe { self.alloc(new_layout) };
        }
        if align <= ALIGNMENT {
            // SAFETY: ptr is live on HEAP.
            return unsafe { HEAP.resize(ptr, new_size) }.map_or(ptr::null_mut(), |p| p.as_ptr());
        }
        // Over-aligned: resize would only guarantee 16.
        // SAFETY: as above.
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            // SAFETY: both blocks are live and distinct.
            unsafe {
                ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
                HEAP.deallocate(ptr);
            }
        }
        new_ptr
    }
}
