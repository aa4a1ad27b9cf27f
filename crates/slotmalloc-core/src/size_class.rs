//! Size classes.
//!
//! Requests are rounded up to 16 bytes and then to the next power of two in
//! 16..=1024. Anything larger goes to the large class, whose regions hold a
//! single slot of exactly the aligned request size.

use crate::error::AllocError;
use crate::util;

/// Smallest slot handed out (bytes).
pub const MIN_SIZE: usize = 16;

/// Largest slot served by a power-of-two class (bytes).
pub const MAX_SMALL_SIZE: usize = 1024;

/// Number of power-of-two classes.
pub const NUM_SMALL_CLASSES: usize = 7;

/// Class index of the large class.
pub const LARGE_CLASS: usize = NUM_SMALL_CLASSES;

/// Number of classes including the large class.
pub const NUM_CLASSES: usize = NUM_SMALL_CLASSES + 1;

const SIZE_TABLE: [usize; NUM_SMALL_CLASSES] = [16, 32, 64, 128, 256, 512, 1024];

/// Class and slot size chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub class: usize,
    pub slot_size: usize,
}

impl Route {
    #[must_use]
    pub const fn is_large(self) -> bool {
        self.class == LARGE_CLASS
    }
}

/// Routes a request of `size` bytes.
///
/// Fails for zero and for sizes whose alignment rounding overflows.
pub fn route(size: usize) -> Result<Route, AllocError> {
    if size == 0 {
        return Err(AllocError::ZeroSize);
    }
    let aligned = util::align_up(size).ok_or(AllocError::SizeOverflow)?;
    let class = class_index(aligned);
    let slot_size = if class == LARGE_CLASS {
        aligned
    } else {
        SIZE_TABLE[class]
    };
    Ok(Route { class, slot_size })
}

/// Class index for an already aligned size.
///
/// Sizes above [`MAX_SMALL_SIZE`] return [`LARGE_CLASS`].
#[must_use]
pub fn class_index(aligned: usize) -> usize {
    let size = aligned.max(MIN_SIZE);
    if size > MAX_SMALL_SIZE {
        return LARGE_CLASS;
    }
    // 16 -> 0, 17..=32 -> 1, ..., 513..=1024 -> 6
    let rounded = size.next_power_of_two();
    (rounded.trailing_zeros() - MIN_SIZE.trailing_zeros()) as usize
}

/// Slot size of a power-of-two class; 0 for the large class or out of range.
#[must_use]
pub fn class_size(index: usize) -> usize {
    SIZE_TABLE.get(index).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_rejected() {
        assert_eq!(route(0), Err(AllocError::ZeroSize));
    }

    #[test]
    fn overflowing_alignment_is_rejected() {
        assert_eq!(route(usize::MAX), Err(AllocError::SizeOverflow));
        assert_eq!(route(usize::MAX - 14), Err(AllocError::SizeOverflow));
    }

    #[test]
    fn minimum_class() {
        assert_eq!(route(1).unwrap(), Route { class: 0, slot_size: 16 });
        assert_eq!(route(16).unwrap(), Route { class: 0, slot_size: 16 });
    }

    #[test]
    fn rounds_up_to_power_of_two() {
        assert_eq!(route(17).unwrap().slot_size, 32);
        assert_eq!(route(33).unwrap().slot_size, 64);
        assert_eq!(route(100).unwrap().slot_size, 128);
        assert_eq!(route(129).unwrap().slot_size, 256);
        assert_eq!(route(513).unwrap().slot_size, 1024);
        assert_eq!(route(1024).unwrap(), Route { class: 6, slot_size: 1024 });
    }

    #[test]
    fn large_class_keeps_aligned_size() {
        let r = route(1025).unwrap();
        assert!(r.is_large());
        assert_eq!(r.slot_size, 1040);
        assert_eq!(route(5000).unwrap().slot_size, 5008);
        assert_eq!(route(1 << 20).unwrap().slot_size, 1 << 20);
    }

    #[test]
    fn class_index_matches_table() {
        for (i, &size) in SIZE_TABLE.iter().enumerate() {
            assert_eq!(class_index(size), i);
            assert_eq!(class_size(i), size);
        }
        assert_eq!(class_size(LARGE_CLASS), 0);
        assert_eq!(class_index(1040), LARGE_CLASS);
    }

    #[test]
    fn every_route_fits_request() {
        for size in 1..=4096 {
            let r = route(size).unwrap();
            assert!(r.slot_size >= size);
            assert!(util::is_aligned(r.slot_size));
        }
    }
}
