//! Fixed-size slot recycler.
//!
//! A recycler carves one contiguous chunk into equal slots and threads an
//! intrusive free list through the first word of every unused slot. A slot's
//! storage is either a free-list link or user data, never both: the link is
//! only read while the slot is on the free list.
//!
//! Every free path check (bounds, slot alignment, free-list membership) uses
//! only data the recycler already holds, so misuse is rejected without
//! writing through the offending pointer.

#![allow(unsafe_code)]

use std::ptr::NonNull;

use crate::error::AllocError;
use crate::util;

/// A free slot's first word, read as a link to the next free slot.
#[repr(C)]
struct FreeSlot {
    next: Option<NonNull<FreeSlot>>,
}

/// Result of a free operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeResult {
    /// Slot returned to its region's free list.
    Released,
    /// Slot returned and its region, now empty, unmapped.
    RegionReleased,
    /// Null pointer; nothing to do.
    Null,
    /// Pointer is already on the free list.
    DoubleFree,
    /// Pointer is not a slot boundary owned by this allocator.
    ForeignPointer,
    /// Region reported zero live slots.
    Underflow,
}

impl FreeResult {
    /// True if a slot actually changed state.
    #[must_use]
    pub const fn is_release(self) -> bool {
        matches!(self, Self::Released | Self::RegionReleased)
    }
}

/// Free-list manager for the slots of one region.
#[repr(C)]
#[derive(Debug)]
pub struct Recycler {
    slot_size: usize,
    capacity: usize,
    live: usize,
    chunk: usize,
    free: Option<NonNull<FreeSlot>>,
}

impl Recycler {
    /// Builds a recycler over `total_bytes` starting at `start`, linking every
    /// slot to its successor in address order.
    ///
    /// # Safety
    ///
    /// `[start, start + total_bytes)` must be writable, exclusively owned by
    /// the returned recycler, and outlive it.
    pub unsafe fn initialize(
        slot_size: usize,
        total_bytes: usize,
        start: NonNull<u8>,
    ) -> Result<Self, AllocError> {
        let start_addr = start.as_ptr() as usize;
        if slot_size == 0 || !util::is_aligned(slot_size) || !util::is_aligned(start_addr) {
            return Err(AllocError::Misaligned {
                slot_size,
                start: start_addr,
            });
        }
        let capacity = total_bytes / slot_size;
        if capacity == 0 {
            return Err(AllocError::RegionTooSmall {
                slot_size,
                available: total_bytes,
            });
        }

        let mut cur = start.cast::<FreeSlot>();
        for _ in 1..capacity {
            // SAFETY: the successor lies inside the chunk (i < capacity).
            let next = unsafe { cur.byte_add(slot_size) };
            // SAFETY: cur is a slot boundary inside the caller-provided span,
            // 16-byte aligned and at least one word wide.
            unsafe { cur.as_ptr().write(FreeSlot { next: Some(next) }) };
            cur = next;
        }
        // SAFETY: last slot of the chunk.
        unsafe { cur.as_ptr().write(FreeSlot { next: None }) };

        Ok(Self {
            slot_size,
            capacity,
            live: 0,
            chunk: start_addr,
            free: Some(start.cast()),
        })
    }

    /// Pops the head of the free list.
    ///
    /// Returns `None` when no slot is free. A head whose link points outside
    /// the chunk truncates the list instead of being followed.
    pub fn allocate(&mut self) -> Option<NonNull<u8>> {
        let head = self.free?;
        if self.live >= self.capacity {
            return None;
        }
        // SAFETY: head is on the free list, so it is an owned slot whose
        // first word is a link.
        let next = unsafe { head.as_ptr().read().next };
        self.free = next.filter(|n| self.owns(n.as_ptr() as usize));
        self.live += 1;
        Some(head.cast())
    }

    /// Pushes `ptr` back onto the free list.
    ///
    /// Rejects, without touching memory, a release when no slot is live, a
    /// pointer that is not a slot boundary of this chunk, and a pointer that
    /// is already free.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> FreeResult {
        if self.live == 0 {
            return FreeResult::Underflow;
        }
        let addr = ptr.as_ptr() as usize;
        if !self.owns(addr) {
            return FreeResult::ForeignPointer;
        }
        if self.free_list_contains(addr) {
            return FreeResult::DoubleFree;
        }
        let slot = ptr.cast::<FreeSlot>();
        // SAFETY: ownership check above; the slot is live so its storage is
        // ours to reinterpret as a link.
        unsafe { slot.as_ptr().write(FreeSlot { next: self.free }) };
        self.free = Some(slot);
        self.live -= 1;
        FreeResult::Released
    }

    /// True if `addr` is a slot boundary inside this chunk.
    #[must_use]
    pub fn owns(&self, addr: usize) -> bool {
        let Some(span) = util::checked_mul(self.capacity, self.slot_size) else {
            return false;
        };
        let Some(end) = util::checked_add(self.chunk, span) else {
            return false;
        };
        addr >= self.chunk && addr < end && (addr - self.chunk) % self.slot_size == 0
    }

    /// True if `addr` is an owned slot that is currently allocated.
    #[must_use]
    pub fn is_live(&self, addr: usize) -> bool {
        self.owns(addr) && !self.free_list_contains(addr)
    }

    /// Bounded scan of the free list; stops at `capacity` links or at the
    /// first link leaving the chunk.
    fn free_list_contains(&self, addr: usize) -> bool {
        let mut cur = self.free;
        for _ in 0..self.capacity {
            let Some(node) = cur else {
                return false;
            };
            let node_addr = node.as_ptr() as usize;
            if node_addr == addr {
                return true;
            }
            if !self.owns(node_addr) {
                return false;
            }
            // SAFETY: node is an owned free slot.
            cur = unsafe { node.as_ptr().read().next };
        }
        false
    }

    /// Number of slots reachable from the free-list head.
    #[must_use]
    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.free;
        while let Some(node) = cur {
            if count >= self.capacity || !self.owns(node.as_ptr() as usize) {
                break;
            }
            count += 1;
            // SAFETY: node is an owned free slot.
            cur = unsafe { node.as_ptr().read().next };
        }
        count
    }

    /// Overwrites a free slot's storage after its link word with `byte`.
    pub fn scrub_free_slot(&mut self, ptr: NonNull<u8>, byte: u8) {
        let link = size_of::<FreeSlot>();
        if self.slot_size <= link || !self.owns(ptr.as_ptr() as usize) {
            return;
        }
        // SAFETY: owned slot; the write stays within [ptr + link, ptr + slot_size).
        unsafe {
            ptr.as_ptr()
                .add(link)
                .write_bytes(byte, self.slot_size - link);
        }
    }

    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn live(&self) -> usize {
        self.live
    }

    /// Base address of the slot array.
    #[must_use]
    pub fn chunk(&self) -> usize {
        self.chunk
    }

    /// No slot can be handed out.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.free.is_none() || self.live >= self.capacity
    }

    /// No slot is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}
