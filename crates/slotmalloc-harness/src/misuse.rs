//! Misuse oracle.
//!
//! Deliberately commits allocator misuse against a fresh heap and checks that
//! the heap ignores it, counts it, and leaves neighbouring allocations intact.
//! Each check keeps an anchor allocation alive and verifies its bytes after
//! the misuse.

#![allow(unsafe_code)]

use serde::Serialize;
use slotmalloc_core::{FreeResult, Heap, Mode};

/// Misuse the oracle can commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MisuseCondition {
    NullFree,
    DoubleFree,
    FreeAfterRegionRelease,
    InteriorFree,
    ForeignHeapFree,
    ResizeFreed,
    ZeroSize,
    OverflowZeroed,
}

impl MisuseCondition {
    pub const ALL: [Self; 8] = [
        Self::NullFree,
        Self::DoubleFree,
        Self::FreeAfterRegionRelease,
        Self::InteriorFree,
        Self::ForeignHeapFree,
        Self::ResizeFreed,
        Self::ZeroSize,
        Self::OverflowZeroed,
    ];

    /// Outcome the heap must produce in `mode`.
    #[must_use]
    pub const fn expected(self, mode: Mode) -> &'static str {
        match self {
            Self::NullFree => "null",
            Self::DoubleFree => "double_free",
            Self::FreeAfterRegionRelease | Self::InteriorFree | Self::ForeignHeapFree => {
                "foreign_pointer"
            }
            Self::ResizeFreed => match mode {
                Mode::Strict => "refused",
                Mode::Hardened => "fresh_allocation",
            },
            Self::ZeroSize | Self::OverflowZeroed => "refused",
        }
    }
}

/// Result of one misuse check.
#[derive(Debug, Clone, Serialize)]
pub struct MisuseOutcome {
    pub condition: MisuseCondition,
    pub mode: &'static str,
    pub expected: &'static str,
    pub observed: &'static str,
    /// The anchor allocation kept its contents.
    pub anchor_intact: bool,
    pub misuse_counted: bool,
    pub passed: bool,
}

fn free_label(outcome: FreeResult) -> &'static str {
    match outcome {
        FreeResult::Released => "released",
        FreeResult::RegionReleased => "region_released",
        FreeResult::Null => "null",
        FreeResult::DoubleFree => "double_free",
        FreeResult::ForeignPointer => "foreign_pointer",
        FreeResult::Underflow => "underflow",
    }
}

const ANCHOR_SIZE: usize = 256;
const ANCHOR_TAG: u8 = 0xA5;

/// Commits one misuse on a fresh heap.
#[must_use]
pub fn check(condition: MisuseCondition, mode: Mode) -> MisuseOutcome {
    let heap = Heap::new().with_mode(mode);
    let anchor = heap.allocate(ANCHOR_SIZE);
    if let Some(a) = anchor {
        // SAFETY: fresh slot of ANCHOR_SIZE bytes.
        unsafe { a.as_ptr().write_bytes(ANCHOR_TAG, ANCHOR_SIZE) };
    }
    let before = heap.stats();

    // SAFETY: no pointer the heap still hands out is used after being freed;
    // stale and foreign pointers are rejected without being read.
    let observed = unsafe {
        match condition {
            MisuseCondition::NullFree => free_label(heap.deallocate(std::ptr::null_mut())),
            // Same class as the anchor, so the slot is still on a free list.
            MisuseCondition::DoubleFree => match heap.allocate(ANCHOR_SIZE) {
                Some(p) => {
                    heap.deallocate(p.as_ptr());
                    free_label(heap.deallocate(p.as_ptr()))
                }
                None => "anchor_failed",
            },
            // Smallest class, alone in its region: the first free unmaps it.
            MisuseCondition::FreeAfterRegionRelease => match heap.allocate(1) {
                Some(p) => match heap.deallocate(p.as_ptr()) {
                    FreeResult::RegionReleased => free_label(heap.deallocate(p.as_ptr())),
                    other => free_label(other),
                },
                None => "anchor_failed",
            },
            MisuseCondition::InteriorFree => match anchor {
                Some(a) => free_label(heap.deallocate(a.as_ptr().add(48))),
                None => "anchor_failed",
            },
            MisuseCondition::ForeignHeapFree => {
                let other = Heap::new().with_mode(mode);
                match other.allocate(64) {
                    Some(p) => {
                        let label = free_label(heap.deallocate(p.as_ptr()));
                        other.deallocate(p.as_ptr());
                        label
                    }
                    None => "anchor_failed",
                }
            }
            MisuseCondition::ResizeFreed => match heap.allocate(ANCHOR_SIZE) {
                Some(p) => {
                    heap.deallocate(p.as_ptr());
                    match heap.resize(p.as_ptr(), 64) {
                        Some(q) => {
                            heap.deallocate(q.as_ptr());
                            "fresh_allocation"
                        }
                        None => "refused",
                    }
                }
                None => "anchor_failed",
            },
            MisuseCondition::ZeroSize => match heap.allocate(0) {
                Some(_) => "allocated",
                None => "refused",
            },
            MisuseCondition::OverflowZeroed => match heap.allocate_zeroed(usize::MAX, 2) {
                Some(_) => "allocated",
                None => "refused",
            },
        }
    };

    let after = heap.stats();
    let misuse_counted = match condition {
        MisuseCondition::NullFree => after.misuse_ignored() == before.misuse_ignored(),
        MisuseCondition::DoubleFree => after.double_frees_ignored == before.double_frees_ignored + 1,
        MisuseCondition::FreeAfterRegionRelease
        | MisuseCondition::InteriorFree
        | MisuseCondition::ForeignHeapFree => {
            after.foreign_frees_ignored == before.foreign_frees_ignored + 1
        }
        MisuseCondition::ResizeFreed => match mode {
            Mode::Strict => after.invalid_requests == before.invalid_requests + 1,
            Mode::Hardened => true,
        },
        MisuseCondition::ZeroSize | MisuseCondition::OverflowZeroed => {
            after.invalid_requests == before.invalid_requests + 1
        }
    };

    let anchor_intact = anchor.is_some_and(|a| {
        // SAFETY: the anchor is still live.
        let bytes = unsafe { std::slice::from_raw_parts(a.as_ptr(), ANCHOR_SIZE) };
        bytes.iter().all(|&b| b == ANCHOR_TAG)
    });
    if let Some(a) = anchor {
        // SAFETY: live anchor, freed once.
        unsafe { heap.deallocate(a.as_ptr()) };
    }

    let expected = condition.expected(mode);
    MisuseOutcome {
        condition,
        mode: mode.as_str(),
        expected,
        observed,
        anchor_intact,
        misuse_counted,
        passed: observed == expected && anchor_intact && misuse_counted,
    }
}

/// Every condition in both modes.
#[must_use]
pub fn run_all() -> Vec<MisuseOutcome> {
    [Mode::Strict, Mode::Hardened]
        .into_iter()
        .flat_map(|mode| MisuseCondition::ALL.into_iter().map(move |c| check(c, mode)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_condition_passes_in_both_modes() {
        for outcome in run_all() {
            assert!(outcome.passed, "{outcome:?}");
        }
    }

    #[test]
    fn resize_of_freed_pointer_depends_on_mode() {
        assert_eq!(check(MisuseCondition::ResizeFreed, Mode::Strict).observed, "refused");
        assert_eq!(
            check(MisuseCondition::ResizeFreed, Mode::Hardened).observed,
            "fresh_allocation"
        );
    }

    #[test]
    fn free_after_region_release_is_foreign_in_both_modes() {
        for mode in [Mode::Strict, Mode::Hardened] {
            let outcome = check(MisuseCondition::FreeAfterRegionRelease, mode);
            assert_eq!(outcome.observed, "foreign_pointer");
            assert!(outcome.passed, "{outcome:?}");
        }
    }
}
