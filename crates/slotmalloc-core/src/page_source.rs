//! Page source and region headers.
//!
//! A region is one anonymous mapping. Its first bytes hold a [`RegionHeader`]
//! followed by the region's [`Recycler`]; the slot array starts at the payload
//! offset. For power-of-two classes the payload offset is a multiple of the
//! slot size, so every slot is naturally aligned to its own size, and all
//! slots live in the first page so that masking any slot pointer down to its
//! page lands on the header.
//!
//! The mapping primitive is the [`PageMapper`] trait; [`SystemPages`] is the
//! `mmap`/`munmap` implementation.

#![allow(unsafe_code)]

use std::ptr::{self, NonNull};

use crate::error::AllocError;
use crate::recycler::Recycler;
use crate::size_class::{LARGE_CLASS, NUM_CLASSES};
use crate::util::{self, ALIGNMENT};

/// Source of zero-filled, page-aligned, read/write memory.
pub trait PageMapper {
    /// Page size in bytes; 0 if unknown.
    fn page_size(&self) -> usize;

    /// Maps `len` bytes (a multiple of the page size). `None` on refusal.
    fn map(&self, len: usize) -> Option<NonNull<u8>>;

    /// Returns a mapping to the OS.
    ///
    /// # Safety
    ///
    /// `base` and `len` must come from one earlier `map` call on this mapper,
    /// and nothing may touch the span afterwards.
    unsafe fn unmap(&self, base: NonNull<u8>, len: usize);
}

/// Anonymous private mappings from the kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPages;

impl PageMapper for SystemPages {
    fn page_size(&self) -> usize {
        util::page_size()
    }

    fn map(&self, len: usize) -> Option<NonNull<u8>> {
        if len == 0 {
            return None;
        }
        // SAFETY: anonymous private mapping with no address hint; the kernel
        // picks a fresh span.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(raw.cast::<u8>())
    }

    unsafe fn unmap(&self, base: NonNull<u8>, len: usize) {
        // SAFETY: caller passes a span returned by `map`.
        unsafe {
            libc::munmap(base.as_ptr().cast::<libc::c_void>(), len);
        }
    }
}

/// Metadata at the start of every region.
#[repr(C)]
pub struct RegionHeader {
    /// Address of this header; a masked pointer only trusts a header whose
    /// back-reference equals the page it landed on.
    base: usize,
    /// Token of the directory the region belongs to (0 while unlisted).
    cookie: usize,
    map_len: usize,
    class: usize,
    payload_offset: usize,
    dir_prev: Option<Region>,
    dir_next: Option<Region>,
    cand_prev: Option<Region>,
    cand_next: Option<Region>,
    /// On its class's candidate list.
    listed: bool,
}

const fn round16(n: usize) -> usize {
    (n + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Offset of the recycler inside a region.
pub const RECYCLER_OFFSET: usize = round16(size_of::<RegionHeader>());

/// Bytes of bookkeeping before the earliest possible slot.
pub const HEADER_SIZE: usize = round16(RECYCLER_OFFSET + size_of::<Recycler>());

/// Placement of the slot array inside a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub map_len: usize,
    pub payload_offset: usize,
    /// Bytes available to the slot array.
    pub usable: usize,
}

/// Computes the mapping length and slot placement for one region.
pub fn geometry(class: usize, slot_size: usize, page_size: usize) -> Result<Geometry, AllocError> {
    if page_size == 0 || !page_size.is_power_of_two() {
        return Err(AllocError::PageSizeUnavailable);
    }
    if slot_size == 0 || !util::is_aligned(slot_size) {
        return Err(AllocError::Misaligned {
            slot_size,
            start: HEADER_SIZE,
        });
    }
    if class == LARGE_CLASS {
        let min = util::checked_add(HEADER_SIZE, slot_size).ok_or(AllocError::SizeOverflow)?;
        let map_len = util::round_to_pages(min, page_size).ok_or(AllocError::SizeOverflow)?;
        return Ok(Geometry {
            map_len,
            payload_offset: HEADER_SIZE,
            usable: slot_size,
        });
    }

    let payload_offset = HEADER_SIZE.div_ceil(slot_size) * slot_size;
    if payload_offset + slot_size > page_size {
        return Err(AllocError::RegionTooSmall {
            slot_size,
            available: page_size.saturating_sub(payload_offset),
        });
    }
    Ok(Geometry {
        map_len: page_size,
        payload_offset,
        usable: page_size - payload_offset,
    })
}

/// Handle to a mapped region's header.
///
/// A handle is only valid while its region is mapped; every method assumes
/// the caller holds the heap lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region(NonNull<RegionHeader>);

impl Region {
    /// # Safety
    ///
    /// `header` must point to an initialized header of a mapped region.
    pub unsafe fn from_raw(header: NonNull<RegionHeader>) -> Self {
        Self(header)
    }

    /// Reads the header at `page` and accepts it only if its back-reference,
    /// directory token, class and geometry are consistent.
    ///
    /// # Safety
    ///
    /// `page` must be a readable address with at least `HEADER_SIZE` readable
    /// bytes behind it.
    pub unsafe fn validate_at(page: usize, cookie: usize, page_size: usize) -> Option<Self> {
        let header = NonNull::new(page as *mut RegionHeader)?;
        let raw = header.as_ptr();
        // SAFETY: caller guarantees the page is readable; only integer fields
        // are read so arbitrary bytes cannot form an invalid value.
        let (base, found_cookie, map_len, class, payload_offset) = unsafe {
            (
                ptr::addr_of!((*raw).base).read(),
                ptr::addr_of!((*raw).cookie).read(),
                ptr::addr_of!((*raw).map_len).read(),
                ptr::addr_of!((*raw).class).read(),
                ptr::addr_of!((*raw).payload_offset).read(),
            )
        };
        let sane = cookie != 0
            && base == page
            && found_cookie == cookie
            && class < NUM_CLASSES
            && map_len >= page_size
            && payload_offset >= HEADER_SIZE
            && payload_offset < map_len;
        sane.then_some(Self(header))
    }

    fn header(&self) -> &RegionHeader {
        // SAFETY: handle validity is a type invariant.
        unsafe { self.0.as_ref() }
    }

    fn header_mut(&mut self) -> &mut RegionHeader {
        // SAFETY: handle validity plus the heap lock give exclusive access.
        unsafe { self.0.as_mut() }
    }

    #[must_use]
    pub fn base(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[must_use]
    pub fn map_len(self) -> usize {
        self.header().map_len
    }

    #[must_use]
    pub fn class(self) -> usize {
        self.header().class
    }

    #[must_use]
    pub fn cookie(self) -> usize {
        self.header().cookie
    }

    pub fn set_cookie(mut self, cookie: usize) {
        self.header_mut().cookie = cookie;
    }

    /// Address of the first slot.
    #[must_use]
    pub fn payload_start(self) -> usize {
        self.base() + self.header().payload_offset
    }

    /// True if `addr` falls inside the mapped span.
    #[must_use]
    pub fn contains(self, addr: usize) -> bool {
        addr >= self.base() && addr - self.base() < self.map_len()
    }

    pub(crate) fn dir_prev(self) -> Option<Region> {
        self.header().dir_prev
    }

    pub(crate) fn dir_next(self) -> Option<Region> {
        self.header().dir_next
    }

    pub(crate) fn set_dir_links(mut self, prev: Option<Region>, next: Option<Region>) {
        let h = self.header_mut();
        h.dir_prev = prev;
        h.dir_next = next;
    }

    pub(crate) fn set_dir_prev(mut self, prev: Option<Region>) {
        self.header_mut().dir_prev = prev;
    }

    pub(crate) fn set_dir_next(mut self, next: Option<Region>) {
        self.header_mut().dir_next = next;
    }

    pub(crate) fn cand_prev(self) -> Option<Region> {
        self.header().cand_prev
    }

    pub(crate) fn cand_next(self) -> Option<Region> {
        self.header().cand_next
    }

    pub(crate) fn set_cand_links(mut self, prev: Option<Region>, next: Option<Region>) {
        let h = self.header_mut();
        h.cand_prev = prev;
        h.cand_next = next;
    }

    pub(crate) fn set_cand_prev(mut self, prev: Option<Region>) {
        self.header_mut().cand_prev = prev;
    }

    pub(crate) fn set_cand_next(mut self, next: Option<Region>) {
        self.header_mut().cand_next = next;
    }

    /// On its class's candidate list.
    #[must_use]
    pub fn is_listed(self) -> bool {
        self.header().listed
    }

    pub(crate) fn set_listed(mut self, listed: bool) {
        self.header_mut().listed = listed;
    }

    /// Runs `f` with exclusive access to the region's recycler.
    pub fn with_recycler<R>(self, f: impl FnOnce(&mut Recycler) -> R) -> R {
        // SAFETY: the recycler was written at RECYCLER_OFFSET by `reserve`
        // and the heap lock gives exclusive access.
        let recycler = unsafe { &mut *self.0.as_ptr().byte_add(RECYCLER_OFFSET).cast::<Recycler>() };
        f(recycler)
    }
}

/// Maps a fresh region for `slot_size`-byte slots of `class` and initializes
/// its header and recycler. The region starts unlisted with cookie 0.
pub fn reserve<M: PageMapper>(
    mapper: &M,
    class: usize,
    slot_size: usize,
) -> Result<Region, AllocError> {
    let geo = geometry(class, slot_size, mapper.page_size())?;
    let base = mapper
        .map(geo.map_len)
        .ok_or(AllocError::MapFailed { len: geo.map_len })?;

    // SAFETY: the mapping is `map_len` bytes, page aligned and exclusively ours.
    let payload = unsafe { base.byte_add(geo.payload_offset) };
    // SAFETY: [payload, payload + usable) lies inside the fresh mapping.
    let recycler = match unsafe { Recycler::initialize(slot_size, geo.usable, payload) } {
        Ok(r) => r,
        Err(e) => {
            // SAFETY: unmapping exactly what was just mapped.
            unsafe { mapper.unmap(base, geo.map_len) };
            return Err(e);
        }
    };

    let header = base.cast::<RegionHeader>();
    // SAFETY: header and recycler fit inside HEADER_SIZE <= payload_offset.
    unsafe {
        header.as_ptr().write(RegionHeader {
            base: base.as_ptr() as usize,
            cookie: 0,
            map_len: geo.map_len,
            class,
            payload_offset: geo.payload_offset,
            dir_prev: None,
            dir_next: None,
            cand_prev: None,
            cand_next: None,
            listed: false,
        });
        base.byte_add(RECYCLER_OFFSET)
            .cast::<Recycler>()
            .as_ptr()
            .write(recycler);
    }
    Ok(Region(header))
}

/// Unmaps a region with its original length.
///
/// # Safety
///
/// `region` must be unlinked from every list, and neither it nor any slot
/// inside it may be used afterwards.
pub unsafe fn release<M: PageMapper>(mapper: &M, region: Region) {
    let len = region.map_len();
    let base = region.0.cast::<u8>();
    // SAFETY: base/len are the values recorded by `reserve`.
    unsafe { mapper.unmap(base, len) };
}
