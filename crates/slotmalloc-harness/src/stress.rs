//! Multi-threaded replay: every thread runs its own generated trace against
//! one shared heap.

use std::sync::Barrier;
use std::time::Instant;

use serde::Serialize;
use slotmalloc_core::{Heap, Mode};
use thiserror::Error;

use crate::trace::{GenerateConfig, generate};
use crate::workload::{HeapCounters, ReplayError, replay};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StressConfig {
    pub threads: usize,
    pub ops_per_thread: usize,
    pub max_live: usize,
    pub seed: u64,
    pub mode: Mode,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            ops_per_thread: 5_000,
            max_live: 128,
            seed: 1,
            mode: Mode::Strict,
        }
    }
}

#[derive(Debug, Error)]
pub enum StressError {
    #[error("thread {thread}: {source}")]
    Replay {
        thread: usize,
        #[source]
        source: ReplayError,
    },
    #[error("thread {thread} panicked")]
    Panicked { thread: usize },
    #[error("{count} regions still mapped after all threads finished")]
    RegionsLeaked { count: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadSummary {
    pub thread: usize,
    pub seed: u64,
    pub trace_sha256: String,
    pub ops: usize,
    pub peak_live: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub mode: &'static str,
    pub threads: usize,
    pub ops_total: usize,
    pub elapsed_ms: u64,
    pub per_thread: Vec<ThreadSummary>,
    pub counters: HeapCounters,
}

/// Per-thread seed: distinct streams from one base seed.
fn thread_seed(base: u64, thread: usize) -> u64 {
    base.wrapping_add((thread as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Run the stress workload. Fails on the first thread error, on a panic, or
/// if any region outlives the run.
pub fn run(config: &StressConfig) -> Result<StressReport, StressError> {
    let heap = Heap::new().with_mode(config.mode);
    let threads = config.threads.max(1);
    let barrier = Barrier::new(threads);
    let started = Instant::now();

    let results: Vec<Result<ThreadSummary, StressError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|thread| {
                let heap = &heap;
                let barrier = &barrier;
                let seed = thread_seed(config.seed, thread);
                let trace = generate(&GenerateConfig {
                    seed,
                    ops: config.ops_per_thread,
                    max_live: config.max_live,
                    ..GenerateConfig::default()
                });
                scope.spawn(move || {
                    barrier.wait();
                    let report = replay(heap, &trace)
                        .map_err(|source| StressError::Replay { thread, source })?;
                    Ok(ThreadSummary {
                        thread,
                        seed,
                        trace_sha256: report.trace_sha256,
                        ops: report.ops,
                        peak_live: report.peak_live,
                    })
                })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(thread, h)| {
                h.join()
                    .unwrap_or_else(|_| Err(StressError::Panicked { thread }))
            })
            .collect()
    });

    let per_thread = results.into_iter().collect::<Result<Vec<_>, _>>()?;
    let leaked = heap.region_count();
    if leaked != 0 {
        return Err(StressError::RegionsLeaked { count: leaked });
    }
    Ok(StressReport {
        mode: heap.mode().as_str(),
        threads,
        ops_total: per_thread.iter().map(|t| t.ops).sum(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        per_thread,
        counters: heap.stats().into(),
    })
}
