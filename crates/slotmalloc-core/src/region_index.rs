//! Address-keyed set of region bases.
//!
//! Open addressing with linear probing over a table of `usize` slots, 0
//! meaning empty. The table lives in its own anonymous mapping from
//! [`SystemPages`], never from the heap's mapper and never from the global
//! allocator, and it doubles once it is half full. Removal shifts the rest of
//! the probe run back instead of leaving tombstones.

#![allow(unsafe_code)]

use std::ptr::NonNull;
use std::slice;

use crate::error::AllocError;
use crate::page_source::{PageMapper, SystemPages};
use crate::util;

/// Fibonacci hashing multiplier (2^64 / golden ratio), truncated on 32-bit.
const FIB_MULTIPLIER: usize = 0x9E37_79B9_7F4A_7C15_u64 as usize;

/// `capacity` (a power of two, at least 8) zero-initialised `usize` slots.
#[derive(Debug)]
struct Table {
    slots: NonNull<usize>,
    capacity: usize,
    map_len: usize,
}

impl Table {
    fn map(capacity: usize) -> Result<Self, AllocError> {
        let bytes =
            util::checked_mul(capacity, size_of::<usize>()).ok_or(AllocError::SizeOverflow)?;
        let map_len = util::round_to_pages(bytes, SystemPages.page_size())
            .ok_or(AllocError::PageSizeUnavailable)?;
        let base = SystemPages.map(map_len).ok_or(AllocError::MapFailed { len: map_len })?;
        Ok(Self {
            slots: base.cast::<usize>(),
            capacity,
            map_len,
        })
    }

    fn slots(&self) -> &[usize] {
        // SAFETY: `capacity` slots were mapped read/write and zero-filled.
        unsafe { slice::from_raw_parts(self.slots.as_ptr(), self.capacity) }
    }

    fn slots_mut(&mut self) -> &mut [usize] {
        // SAFETY: as above; `&mut self` makes the borrow unique.
        unsafe { slice::from_raw_parts_mut(self.slots.as_ptr(), self.capacity) }
    }

    fn home(&self, base: usize) -> usize {
        let shift = usize::BITS - self.capacity.trailing_zeros();
        base.wrapping_mul(FIB_MULTIPLIER) >> shift
    }

    /// Slot holding `base`, or the empty slot where it would go.
    fn find(&self, base: usize) -> (usize, bool) {
        let mask = self.capacity - 1;
        let slots = self.slots();
        let mut i = self.home(base);
        loop {
            match slots[i] {
                0 => return (i, false),
                v if v == base => return (i, true),
                _ => i = (i + 1) & mask,
            }
        }
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        // SAFETY: the span came from `SystemPages::map` in `Table::map`.
        unsafe { SystemPages.unmap(self.slots.cast::<u8>(), self.map_len) };
    }
}

/// Set of nonzero region base addresses with O(1) expected lookup.
#[derive(Debug)]
pub struct RegionIndex {
    table: Option<Table>,
    len: usize,
}

impl RegionIndex {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            table: None,
            len: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slots in the current table; 0 before the first insert.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.table.as_ref().map_or(0, |t| t.capacity)
    }

    #[must_use]
    pub fn contains(&self, base: usize) -> bool {
        base != 0 && self.table.as_ref().is_some_and(|t| t.find(base).1)
    }

    /// Adds `base`; returns `Ok(false)` if it was already present.
    ///
    /// Fails only when a larger table cannot be mapped, in which case the set
    /// is unchanged.
    pub fn insert(&mut self, base: usize) -> Result<bool, AllocError> {
        if base == 0 {
            return Ok(false);
        }
        if self.contains(base) {
            return Ok(false);
        }
        self.reserve_one()?;
        let Some(table) = self.table.as_mut() else {
            return Err(AllocError::MapFailed { len: 0 });
        };
        let (slot, _) = table.find(base);
        table.slots_mut()[slot] = base;
        self.len += 1;
        Ok(true)
    }

    /// Drops `base`; returns whether it was present.
    pub fn remove(&mut self, base: usize) -> bool {
        if base == 0 {
            return false;
        }
        let Some(table) = self.table.as_mut() else {
            return false;
        };
        let (mut hole, found) = table.find(base);
        if !found {
            return false;
        }
        let mask = table.capacity - 1;
        let mut i = hole;
        loop {
            i = (i + 1) & mask;
            let v = table.slots()[i];
            if v == 0 {
                break;
            }
            let home = table.home(v);
            // `v` may fill the hole unless its home lies cyclically in (hole, i].
            let stays = if hole <= i {
                hole < home && home <= i
            } else {
                hole < home || home <= i
            };
            if !stays {
                table.slots_mut()[hole] = v;
                hole = i;
            }
        }
        table.slots_mut()[hole] = 0;
        self.len -= 1;
        true
    }

    /// Grows so one more entry keeps the load at or below one half.
    fn reserve_one(&mut self) -> Result<(), AllocError> {
        let capacity = self.capacity();
        let needed = util::checked_mul(self.len + 1, 2).ok_or(AllocError::SizeOverflow)?;
        if capacity != 0 && needed <= capacity {
            return Ok(());
        }
        let initial = (SystemPages.page_size() / size_of::<usize>()).max(8);
        let mut new_capacity = capacity.max(initial.next_power_of_two());
        while new_capacity < needed {
            new_capacity =
                util::checked_mul(new_capacity, 2).ok_or(AllocError::SizeOverflow)?;
        }
        let mut grown = Table::map(new_capacity)?;
        if let Some(old) = self.table.take() {
            for &v in old.slots().iter().filter(|&&v| v != 0) {
                let (slot, _) = grown.find(v);
                grown.slots_mut()[slot] = v;
            }
        }
        self.table = Some(grown);
        Ok(())
    }
}

impl Default for RegionIndex {
    fn default() -> Self {
        Self::new()
    }
}
