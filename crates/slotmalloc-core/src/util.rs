//! Overflow-checked size arithmetic, alignment rounding and page-size discovery.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

/// Alignment guaranteed for every pointer handed out by the engine.
pub const ALIGNMENT: usize = 16;

/// Adds two sizes, returning `None` instead of wrapping.
#[inline]
#[must_use]
pub const fn checked_add(a: usize, b: usize) -> Option<usize> {
    a.checked_add(b)
}

/// Multiplies two sizes, returning `None` instead of wrapping.
#[inline]
#[must_use]
pub const fn checked_mul(a: usize, b: usize) -> Option<usize> {
    a.checked_mul(b)
}

/// Rounds `n` up to the next multiple of [`ALIGNMENT`].
#[inline]
#[must_use]
pub const fn align_up(n: usize) -> Option<usize> {
    match n.checked_add(ALIGNMENT - 1) {
        Some(v) => Some(v & !(ALIGNMENT - 1)),
        None => None,
    }
}

/// Returns true if `value` is a multiple of [`ALIGNMENT`].
#[inline]
#[must_use]
pub const fn is_aligned(value: usize) -> bool {
    value & (ALIGNMENT - 1) == 0
}

/// Rounds `n` up to a whole number of pages.
///
/// `page_size` must be a non-zero power of two.
#[must_use]
pub fn round_to_pages(n: usize, page_size: usize) -> Option<usize> {
    if !page_size.is_power_of_two() {
        return None;
    }
    let mask = page_size - 1;
    checked_add(n, mask).map(|v| v & !mask)
}

/// Masks `addr` down to the start of the page containing it.
#[inline]
#[must_use]
pub fn containing_page(addr: usize, page_size: usize) -> Option<usize> {
    if !page_size.is_power_of_two() {
        return None;
    }
    Some(addr & !(page_size - 1))
}

/// 0 until the first successful query.
static PAGE_SIZE_CACHED: AtomicUsize = AtomicUsize::new(0);

/// OS page size, queried once and cached for the life of the process.
///
/// Returns 0 if the OS reports something that is not a positive power of two.
/// Concurrent first callers may each query the OS; they all store the same
/// value, and readers only ever see 0 or that value.
#[must_use]
pub fn page_size() -> usize {
    let cached = PAGE_SIZE_CACHED.load(Ordering::Acquire);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let validated = validate_page_size(raw);
    if validated != 0 {
        PAGE_SIZE_CACHED.store(validated, Ordering::Release);
    }
    validated
}

/// Accepts a raw `sysconf` answer only if it is a positive power of two.
#[must_use]
pub fn validate_page_size(raw: libc::c_long) -> usize {
    if raw <= 0 {
        return 0;
    }
    let Ok(size) = usize::try_from(raw) else {
        return 0;
    };
    if size.is_power_of_two() { size } else { 0 }
}
