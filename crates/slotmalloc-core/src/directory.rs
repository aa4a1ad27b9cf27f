//! Region directory.
//!
//! Every mapped region of one heap sits on exactly one per-class list,
//! doubly linked through its header, so insert and remove are O(1). Regions
//! with at least one free slot are also on the class's candidate list.
//!
//! Lookup from a user pointer never walks these lists. The pointer is masked
//! to its page, the page is looked up in the directory's [`RegionIndex`], and
//! only a page found there has its header read and validated against this
//! directory's token. Pointers this heap never mapped, or whose region has
//! since been unmapped, are rejected without touching memory.

#![allow(unsafe_code)]

use std::iter;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::AllocError;
use crate::page_source::Region;
use crate::region_index::RegionIndex;
use crate::size_class::NUM_CLASSES;
use crate::util;

/// Mixed into every directory token so a zeroed page never validates.
const TOKEN_MAGIC: usize = 0x5a17_c0de_5a17_c0de_u64 as usize;

static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, Copy)]
struct ClassLists {
    all: Option<Region>,
    candidates: Option<Region>,
    count: usize,
    candidate_count: usize,
}

impl ClassLists {
    const EMPTY: Self = Self {
        all: None,
        candidates: None,
        count: 0,
        candidate_count: 0,
    };
}

/// Per-heap registry of mapped regions.
#[derive(Debug)]
pub struct RegionDirectory {
    classes: [ClassLists; NUM_CLASSES],
    /// Bases of every listed region.
    index: RegionIndex,
    /// 0 until the first insert.
    token: usize,
}

impl RegionDirectory {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            classes: [ClassLists::EMPTY; NUM_CLASSES],
            index: RegionIndex::new(),
            token: 0,
        }
    }

    /// Token stamped into every region of this directory; 0 before the first
    /// insert.
    #[must_use]
    pub fn token(&self) -> usize {
        self.token
    }

    fn assign_token(&mut self) -> usize {
        if self.token == 0 {
            let seq = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
            self.token = (seq.wrapping_mul(0x9E37_79B9) ^ TOKEN_MAGIC) | 1;
        }
        self.token
    }

    /// Adds a freshly reserved region to the index, its class list and, if it
    /// has a free slot, the candidate list.
    ///
    /// Fails, leaving the directory unchanged, when the index cannot grow.
    pub fn insert(&mut self, region: Region) -> Result<(), AllocError> {
        self.index.insert(region.base())?;
        let token = self.assign_token();
        region.set_cookie(token);
        let lists = &mut self.classes[region.class()];
        let old_head = lists.all;
        region.set_dir_links(None, old_head);
        if let Some(head) = old_head {
            head.set_dir_prev(Some(region));
        }
        lists.all = Some(region);
        lists.count += 1;
        region.set_listed(false);
        region.set_cand_links(None, None);
        if !region.with_recycler(|r| r.is_full()) {
            self.relist(region);
        }
        Ok(())
    }

    /// Unlinks a region from the index and both lists and clears its token.
    pub fn remove(&mut self, region: Region) {
        self.index.remove(region.base());
        self.delist(region);
        let lists = &mut self.classes[region.class()];
        let prev = region.dir_prev();
        let next = region.dir_next();
        match prev {
            Some(p) => p.set_dir_next(next),
            None => lists.all = next,
        }
        if let Some(n) = next {
            n.set_dir_prev(prev);
        }
        lists.count = lists.count.saturating_sub(1);
        region.set_dir_links(None, None);
        region.set_cookie(0);
    }

    /// Takes a region off its candidate list; no-op if it is not listed.
    pub fn delist(&mut self, region: Region) {
        if !region.is_listed() {
            return;
        }
        let lists = &mut self.classes[region.class()];
        let prev = region.cand_prev();
        let next = region.cand_next();
        match prev {
            Some(p) => p.set_cand_next(next),
            None => lists.candidates = next,
        }
        if let Some(n) = next {
            n.set_cand_prev(prev);
        }
        lists.candidate_count = lists.candidate_count.saturating_sub(1);
        region.set_cand_links(None, None);
        region.set_listed(false);
    }

    /// Puts a region back on its candidate list; no-op if already listed.
    pub fn relist(&mut self, region: Region) {
        if region.is_listed() {
            return;
        }
        let lists = &mut self.classes[region.class()];
        let old_head = lists.candidates;
        region.set_cand_links(None, old_head);
        if let Some(head) = old_head {
            head.set_cand_prev(Some(region));
        }
        lists.candidates = Some(region);
        lists.candidate_count += 1;
        region.set_listed(true);
    }

    /// First candidate of `class` whose slots hold at least `slot_size` bytes.
    #[must_use]
    pub fn first_candidate(&self, class: usize, slot_size: usize) -> Option<Region> {
        let head = self.classes.get(class)?.candidates;
        iter::successors(head, |r| r.cand_next())
            .find(|r| r.with_recycler(|rec| rec.slot_size() >= slot_size && !rec.is_full()))
    }

    /// Resolves a user pointer to its region by masking it to its page.
    ///
    /// Returns `None` for pointers whose page is not the base of one of this
    /// directory's regions, and for pointers outside that region's span. No
    /// memory is read before the index lookup succeeds, so any address is
    /// accepted.
    #[must_use]
    pub fn find_containing(&self, addr: usize, page_size: usize) -> Option<Region> {
        if self.token == 0 {
            return None;
        }
        let page = util::containing_page(addr, page_size)?;
        if !self.index.contains(page) {
            return None;
        }
        // SAFETY: `page` is the base of one of our mapped regions.
        let region = unsafe { Region::validate_at(page, self.token, page_size) }?;
        region.contains(addr).then_some(region)
    }

    /// True if a region based at `base` is listed here.
    #[must_use]
    pub fn is_member(&self, base: usize) -> bool {
        self.index.contains(base)
    }

    /// Regions of `class`, most recently inserted first.
    pub fn regions(&self, class: usize) -> impl Iterator<Item = Region> + '_ {
        let head = self.classes.get(class).and_then(|l| l.all);
        iter::successors(head, |r| r.dir_next())
    }

    /// Candidate regions of `class`.
    pub fn candidates(&self, class: usize) -> impl Iterator<Item = Region> + '_ {
        let head = self.classes.get(class).and_then(|l| l.candidates);
        iter::successors(head, |r| r.cand_next())
    }

    /// Any region, used to tear the directory down.
    #[must_use]
    pub fn any_region(&self) -> Option<Region> {
        self.classes.iter().find_map(|l| l.all)
    }

    #[must_use]
    pub fn region_count(&self) -> usize {
        self.classes.iter().map(|l| l.count).sum()
    }

    #[must_use]
    pub fn class_count(&self, class: usize) -> usize {
        self.classes.get(class).map_or(0, |l| l.count)
    }

    #[must_use]
    pub fn candidate_count(&self, class: usize) -> usize {
        self.classes.get(class).map_or(0, |l| l.candidate_count)
    }
}

impl Default for RegionDirectory {
    fn default() -> Self {
        Self::new()
    }
}
