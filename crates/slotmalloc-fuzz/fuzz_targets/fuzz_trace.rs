#![no_main]
use libfuzzer_sys::fuzz_target;
use slotmalloc_core::Mode;
use slotmalloc_harness::trace::{Op, Trace};

/// Keeps replay from filling gigabytes on a single op.
const MAX_BYTES: usize = 1 << 20;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    // Parsing must never panic; errors are fine.
    let Ok(trace) = Trace::parse(text) else {
        return;
    };
    let bounded = Trace {
        ops: trace
            .ops
            .into_iter()
            .filter(|op| match *op {
                Op::Alloc { size, .. } | Op::Resize { size, .. } => size <= MAX_BYTES,
                Op::Zeroed { count, size, .. } => {
                    count.checked_mul(size).is_none_or(|total| total <= MAX_BYTES)
                }
                Op::Free { .. } => true,
            })
            .collect(),
    };
    assert_eq!(Trace::parse(&bounded.to_text()).ok().as_ref(), Some(&bounded));
    // Inconsistent traces are reported as errors; a verification failure on
    // a consistent one is a bug.
    for mode in [Mode::Strict, Mode::Hardened] {
        if let Err(err) = slotmalloc_harness::replay_isolated(&bounded, mode) {
            use slotmalloc_harness::ReplayError::{DuplicateId, UnknownId};
            assert!(matches!(err, DuplicateId { .. } | UnknownId { .. }), "{err}");
        }
    }
});
