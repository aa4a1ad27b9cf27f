//! Verification harness for the slotmalloc engine.
//!
//! This crate provides:
//! - Traces: a text format for allocation workloads plus a seeded generator
//! - Replay: runs a trace against a heap, checking alignment, overlap and contents
//! - Stress: many threads replaying their own traces against one heap
//! - Misuse oracle: deliberate double, interior and foreign frees in both modes
//! - Structured logging: JSONL run logs and their validation

#![deny(unsafe_code)]

pub mod misuse;
pub mod stress;
pub mod structured_log;
pub mod trace;
pub mod workload;

pub use stress::{StressConfig, StressReport};
pub use trace::{GenerateConfig, Op, Trace, TraceError};
pub use workload::{ReplayError, ReplayReport, replay, replay_isolated};
