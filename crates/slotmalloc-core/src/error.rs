//! Failure taxonomy for the allocation engine.
//!
//! Internal steps return `Result<_, AllocError>`; the public [`crate::Heap`]
//! API collapses every error into a null/`None` result so nothing propagates
//! across the allocator boundary as a panic.

use thiserror::Error;

/// Reasons an allocation-side operation can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Zero-byte requests always fail.
    #[error("zero-size allocation request")]
    ZeroSize,
    /// A size computation (alignment, page rounding, `count * size`) overflowed.
    #[error("size arithmetic overflowed")]
    SizeOverflow,
    /// The OS page size is not a positive power of two.
    #[error("operating system page size unavailable")]
    PageSizeUnavailable,
    /// The OS refused to map memory.
    #[error("page mapping of {len} bytes refused")]
    MapFailed { len: usize },
    /// A region payload cannot hold a single slot.
    #[error("region payload of {available} bytes cannot hold a {slot_size}-byte slot")]
    RegionTooSmall { slot_size: usize, available: usize },
    /// Slot size or slot array start violates the engine alignment.
    #[error("slot size {slot_size} or start address {start:#x} is not 16-byte aligned")]
    Misaligned { slot_size: usize, start: usize },
    /// Allocator state is already borrowed further up this thread's stack.
    #[error("allocator state re-entered while borrowed")]
    Reentered,
}

impl AllocError {
    /// True for failures caused by the caller's request rather than the system.
    #[must_use]
    pub const fn is_invalid_input(self) -> bool {
        matches!(self, Self::ZeroSize | Self::SizeOverflow)
    }

    /// True when the OS could not provide memory.
    #[must_use]
    pub const fn is_exhaustion(self) -> bool {
        matches!(self, Self::MapFailed { .. } | Self::PageSizeUnavailable)
    }
}
