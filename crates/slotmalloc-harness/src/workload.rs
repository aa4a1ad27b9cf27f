//! Trace replay against a [`Heap`] with per-operation verification.
//!
//! Every live allocation is filled with a per-id tag byte. Replay checks:
//! - returned pointers are 16-byte aligned;
//! - no two live allocations overlap;
//! - contents survive unrelated operations and resizes;
//! - zeroed allocations read back as zero;
//! - every free of a live id is accepted.

#![allow(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::ptr::{self, NonNull};
use std::time::Instant;

use serde::Serialize;
use slotmalloc_core::{FreeResult, Heap, MetricsSnapshot, Mode, PageMapper, SystemPages};
use thiserror::Error;

use crate::trace::{Op, Trace};

const ALIGNMENT: usize = 16;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("op {index}: id {id} is already live")]
    DuplicateId { index: usize, id: u32 },
    #[error("op {index}: id {id} is not live")]
    UnknownId { index: usize, id: u32 },
    #[error("op {index} ({symbol}): request for {size} bytes failed")]
    AllocationFailed {
        index: usize,
        symbol: &'static str,
        size: usize,
    },
    #[error("op {index}: address {addr:#x} is not 16-byte aligned")]
    Misaligned { index: usize, addr: usize },
    #[error("op {index}: [{addr:#x}, +{size}) overlaps live id {other}")]
    Overlap {
        index: usize,
        addr: usize,
        size: usize,
        other: u32,
    },
    #[error("op {index}: contents of id {id} changed at offset {offset}")]
    Corrupted { index: usize, id: u32, offset: usize },
    #[error("op {index}: zeroed allocation has byte {byte:#04x} at offset {offset}")]
    NotZeroed {
        index: usize,
        offset: usize,
        byte: u8,
    },
    #[error("op {index}: zeroed request with overflowing size succeeded")]
    OverflowAccepted { index: usize },
    #[error("op {index}: usable size {usable:?} is below the requested {size}")]
    Undersized {
        index: usize,
        size: usize,
        usable: Option<usize>,
    },
    #[error("op {index}: free of id {id} returned {outcome:?}")]
    FreeRejected {
        index: usize,
        id: u32,
        outcome: FreeResult,
    },
    #[error("{count} regions still mapped after every id was freed")]
    RegionsLeaked { count: usize },
}

/// Serializable copy of the heap's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapCounters {
    pub allocations: u64,
    pub deallocations: u64,
    pub fresh_region_allocations: u64,
    pub zeroed_allocations: u64,
    pub resizes_in_place: u64,
    pub resizes_moved: u64,
    pub invalid_requests: u64,
    pub exhaustion_failures: u64,
    pub misuse_ignored: u64,
    pub regions_released: u64,
}

impl From<MetricsSnapshot> for HeapCounters {
    fn from(s: MetricsSnapshot) -> Self {
        Self {
            allocations: s.allocations,
            deallocations: s.deallocations,
            fresh_region_allocations: s.fresh_region_allocations,
            zeroed_allocations: s.zeroed_allocations,
            resizes_in_place: s.resizes_in_place,
            resizes_moved: s.resizes_moved,
            invalid_requests: s.invalid_requests,
            exhaustion_failures: s.exhaustion_failures,
            misuse_ignored: s.misuse_ignored(),
            regions_released: s.regions_released,
        }
    }
}

/// Summary of one replay.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub mode: &'static str,
    pub trace_sha256: String,
    pub ops: usize,
    pub allocations: usize,
    pub zeroed: usize,
    pub resizes: usize,
    pub resizes_in_place: usize,
    pub frees: usize,
    /// Zero-size or overflowing requests that were refused as expected.
    pub rejected: usize,
    pub peak_live: usize,
    pub peak_live_bytes: usize,
    pub peak_regions: usize,
    pub regions_at_end: usize,
    pub elapsed_ms: u64,
    pub counters: HeapCounters,
}

#[derive(Debug, Clone, Copy)]
struct Live {
    addr: usize,
    size: usize,
    tag: u8,
}

impl Live {
    fn ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    fn fill(&self) {
        // SAFETY: the slot holds at least `size` bytes.
        unsafe { ptr::write_bytes(self.ptr(), self.tag, self.size) };
    }

    /// First offset in `..len` that no longer holds the tag.
    fn first_mismatch(&self, len: usize) -> Option<usize> {
        // SAFETY: the slot holds at least `size >= len` bytes.
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr(), len) };
        bytes.iter().position(|&b| b != self.tag)
    }
}

/// Replay state for one heap. Tracks live ids and their address ranges.
struct Replayer<'h, M: PageMapper> {
    heap: &'h Heap<M>,
    live: HashMap<u32, Live>,
    /// start address -> (end address, id)
    spans: BTreeMap<usize, (usize, u32)>,
    live_bytes: usize,
    report: ReplayReport,
}

impl<'h, M: PageMapper> Replayer<'h, M> {
    fn new(heap: &'h Heap<M>, trace: &Trace) -> Self {
        Self {
            heap,
            live: HashMap::new(),
            spans: BTreeMap::new(),
            live_bytes: 0,
            report: ReplayReport {
                mode: heap.mode().as_str(),
                trace_sha256: trace.sha256(),
                ops: trace.len(),
                allocations: 0,
                zeroed: 0,
                resizes: 0,
                resizes_in_place: 0,
                frees: 0,
                rejected: 0,
                peak_live: 0,
                peak_live_bytes: 0,
                peak_regions: 0,
                regions_at_end: 0,
                elapsed_ms: 0,
                counters: HeapCounters::default(),
            },
        }
    }

    fn tag_for(id: u32) -> u8 {
        // Never zero, so zero-fill checks cannot pass by accident.
        (id % 255) as u8 + 1
    }

    fn step(&mut self, index: usize, op: Op) -> Result<(), ReplayError> {
        match op {
            Op::Alloc { id, size } => {
                self.ensure_free_id(index, id)?;
                match self.heap.allocate(size) {
                    Some(p) => {
                        self.report.allocations += 1;
                        self.admit(index, id, p, size)?;
                    }
                    None if size == 0 => self.report.rejected += 1,
                    None => return Err(failed(index, op, size)),
                }
            }
            Op::Zeroed { id, count, size } => {
                self.ensure_free_id(index, id)?;
                let total = count.checked_mul(size);
                match (self.heap.allocate_zeroed(count, size), total) {
                    (Some(p), Some(total)) => {
                        // SAFETY: a live zeroed slot of at least `total` bytes.
                        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), total) };
                        if let Some(offset) = bytes.iter().position(|&b| b != 0) {
                            return Err(ReplayError::NotZeroed {
                                index,
                                offset,
                                byte: bytes[offset],
                            });
                        }
                        self.report.zeroed += 1;
                        self.admit(index, id, p, total)?;
                    }
                    (None, None | Some(0)) => self.report.rejected += 1,
                    (None, Some(total)) => return Err(failed(index, op, total)),
                    (Some(_), None) => return Err(ReplayError::OverflowAccepted { index }),
                }
            }
            Op::Resize { id, size } => {
                self.report.resizes += 1;
                let old = match self.live.get(&id).copied() {
                    Some(old) => {
                        self.check_contents(index, id, &old)?;
                        self.forget(id);
                        Some(old)
                    }
                    None => None,
                };
                let old_ptr = old.map_or(ptr::null_mut(), |l| l.ptr());
                // SAFETY: `old_ptr` is null or a live allocation of this heap.
                let result = unsafe { self.heap.resize(old_ptr, size) };
                match (result, old) {
                    (Some(p), old) => {
                        if let Some(old) = old {
                            if p.as_ptr() as usize == old.addr {
                                self.report.resizes_in_place += 1;
                            }
                            let kept = Live {
                                addr: p.as_ptr() as usize,
                                size: old.size.min(size),
                                tag: old.tag,
                            };
                            if let Some(offset) = kept.first_mismatch(kept.size) {
                                return Err(ReplayError::Corrupted { index, id, offset });
                            }
                        }
                        self.admit(index, id, p, size)?;
                    }
                    // Resize to zero frees.
                    (None, Some(_)) if size == 0 => self.report.frees += 1,
                    (None, None) if size == 0 => self.report.rejected += 1,
                    (None, Some(old)) => {
                        // Failure leaves the original allocation live.
                        self.insert(id, old);
                        return Err(failed(index, op, size));
                    }
                    (None, None) => return Err(failed(index, op, size)),
                }
            }
            Op::Free { id } => {
                let Some(old) = self.live.get(&id).copied() else {
                    return Err(ReplayError::UnknownId { index, id });
                };
                self.check_contents(index, id, &old)?;
                self.forget(id);
                // SAFETY: a live allocation of this heap, freed once.
                let outcome = unsafe { self.heap.deallocate(old.ptr()) };
                if !outcome.is_release() {
                    return Err(ReplayError::FreeRejected { index, id, outcome });
                }
                self.report.frees += 1;
            }
        }
        self.report.peak_regions = self.report.peak_regions.max(self.heap.region_count());
        Ok(())
    }

    fn ensure_free_id(&self, index: usize, id: u32) -> Result<(), ReplayError> {
        if self.live.contains_key(&id) {
            return Err(ReplayError::DuplicateId { index, id });
        }
        Ok(())
    }

    fn check_contents(&self, index: usize, id: u32, live: &Live) -> Result<(), ReplayError> {
        match live.first_mismatch(live.size) {
            Some(offset) => Err(ReplayError::Corrupted { index, id, offset }),
            None => Ok(()),
        }
    }

    /// Verify a freshly returned pointer, tag it, and start tracking it.
    fn admit(
        &mut self,
        index: usize,
        id: u32,
        p: NonNull<u8>,
        size: usize,
    ) -> Result<(), ReplayError> {
        let addr = p.as_ptr() as usize;
        if addr % ALIGNMENT != 0 {
            return Err(ReplayError::Misaligned { index, addr });
        }
        // SAFETY: `p` is a live allocation of this heap.
        let usable = unsafe { self.heap.usable_size(p.as_ptr()) };
        if usable.is_none_or(|u| u < size) {
            return Err(ReplayError::Undersized {
                index,
                size,
                usable,
            });
        }
        let end = addr + size.max(1);
        if let Some((_, &(prev_end, other))) = self.spans.range(..=addr).next_back()
            && prev_end > addr
        {
            return Err(ReplayError::Overlap {
                index,
                addr,
                size,
                other,
            });
        }
        if let Some((_, &(_, other))) = self.spans.range(addr..end).next() {
            return Err(ReplayError::Overlap {
                index,
                addr,
                size,
                other,
            });
        }
        let live = Live {
            addr,
            size,
            tag: Self::tag_for(id),
        };
        live.fill();
        self.insert(id, live);
        Ok(())
    }

    fn insert(&mut self, id: u32, live: Live) {
        self.spans
            .insert(live.addr, (live.addr + live.size.max(1), id));
        self.live.insert(id, live);
        self.live_bytes += live.size;
        self.report.peak_live = self.report.peak_live.max(self.live.len());
        self.report.peak_live_bytes = self.report.peak_live_bytes.max(self.live_bytes);
    }

    fn forget(&mut self, id: u32) {
        if let Some(live) = self.live.remove(&id) {
            self.spans.remove(&live.addr);
            self.live_bytes -= live.size;
        }
    }

    /// Free whatever the trace left live so the heap can be checked for leaks.
    fn drain(&mut self) {
        for (_, live) in self.live.drain() {
            // SAFETY: each remaining allocation is live and freed once.
            unsafe { self.heap.deallocate(live.ptr()) };
        }
        self.spans.clear();
        self.live_bytes = 0;
    }
}

fn failed(index: usize, op: Op, size: usize) -> ReplayError {
    ReplayError::AllocationFailed {
        index,
        symbol: op.symbol(),
        size,
    }
}

/// Replay `trace` against a shared heap. Allocations the trace leaves live
/// are freed before returning; region counts are reported but not checked,
/// since other users of `heap` may hold regions.
pub fn replay<M: PageMapper>(heap: &Heap<M>, trace: &Trace) -> Result<ReplayReport, ReplayError> {
    let started = Instant::now();
    let mut replayer = Replayer::new(heap, trace);
    let outcome = trace
        .ops
        .iter()
        .enumerate()
        .try_for_each(|(index, &op)| replayer.step(index, op));
    replayer.drain();
    outcome?;

    let mut report = replayer.report;
    report.regions_at_end = heap.region_count();
    report.elapsed_ms = started.elapsed().as_millis() as u64;
    report.counters = heap.stats().into();
    Ok(report)
}

/// Replay `trace` on a private heap and require every region to be returned.
pub fn replay_isolated(trace: &Trace, mode: Mode) -> Result<ReplayReport, ReplayError> {
    let heap: Heap<SystemPages> = Heap::new().with_mode(mode);
    let report = replay(&heap, trace)?;
    if report.regions_at_end != 0 {
        return Err(ReplayError::RegionsLeaked {
            count: report.regions_at_end,
        });
    }
    Ok(report)
}
