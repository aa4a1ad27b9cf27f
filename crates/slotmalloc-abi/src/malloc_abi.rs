//! ABI layer for `malloc`, `free`, `calloc`, `realloc` and
//! `malloc_usable_size`.
//!
//! Every entry point forwards to [`crate::HEAP`]. Failures return null with
//! `errno` set to `ENOMEM`; misuse on the free path is ignored (and counted
//! in the heap's metrics).

use std::ffi::c_void;

use crate::HEAP;

#[inline]
fn set_enomem() {
    #[cfg(target_os = "linux")]
    // SAFETY: __errno_location returns this thread's errno slot.
    unsafe {
        *libc::__errno_location() = libc::ENOMEM;
    }
}

/// POSIX `malloc` -- allocates `size` bytes of uninitialized memory.
///
/// Returns null for `size == 0` and on exhaustion.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    match HEAP.allocate(size) {
        Some(p) => p.as_ptr().cast(),
        None => {
            if size != 0 {
                set_enomem();
            }
            std::ptr::null_mut()
        }
    }
}

/// POSIX `free`. Null is a no-op.
///
/// # Safety
///
/// A live pointer passed here must not be used again. Double, stale and
/// foreign pointers are ignored without being dereferenced.
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    // SAFETY: forwarded to the caller's contract.
    unsafe {
        HEAP.deallocate(ptr.cast());
    }
}

/// POSIX `calloc` -- `nmemb * size` zeroed bytes; null on overflow.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    match HEAP.allocate_zeroed(nmemb, size) {
        Some(p) => p.as_ptr().cast(),
        None => {
            if nmemb != 0 && size != 0 {
                set_enomem();
            }
            std::ptr::null_mut()
        }
    }
}

/// POSIX `realloc`.
///
/// `realloc(NULL, n)` allocates; `realloc(p, 0)` frees `p` and returns null.
/// On failure null is returned and `ptr` stays valid.
///
/// # Safety
///
/// Same contract as [`free`] for `ptr`.
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: forwarded to the caller's contract.
    match unsafe { HEAP.resize(ptr.cast(), size) } {
        Some(p) => p.as_ptr().cast(),
        None => {
            if size != 0 {
                set_enomem();
            }
            std::ptr::null_mut()
        }
    }
}

/// GNU `malloc_usable_size`; 0 for null or unknown pointers.
///
/// # Safety
///
/// Same contract as [`free`].
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    // SAFETY: forwarded to the caller's contract.
    unsafe { HEAP.usable_size(ptr.cast()) }.unwrap_or(0)
}
