//! CLI entrypoint for the slotmalloc harness.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};
use slotmalloc_core::Mode;
use slotmalloc_harness::structured_log::{
    LogEmitter, LogEntry, LogLevel, Outcome, StreamKind, validate_log_file,
};
use slotmalloc_harness::{GenerateConfig, StressConfig, Trace, misuse, stress, trace};

/// Workload tooling for slotmalloc.
#[derive(Debug, Parser)]
#[command(name = "slotmalloc-harness")]
#[command(about = "Trace replay and stress harness for slotmalloc")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a deterministic allocation trace.
    Generate {
        /// Output path (stdout when omitted).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "1")]
        seed: String,
        /// Number of operations before the closing frees.
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// Upper bound on simultaneously live allocations.
        #[arg(long, default_value_t = 256)]
        max_live: usize,
        /// Largest size drawn for large requests.
        #[arg(long, default_value_t = 65_536)]
        max_large: usize,
    },
    /// Replay a trace on a private heap and verify every operation.
    Replay {
        /// Trace file to replay.
        #[arg(long)]
        trace: PathBuf,
        /// Heap mode (`strict` or `hardened`).
        #[arg(long, default_value = "strict")]
        mode: String,
        /// JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// JSON report path.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Replay generated traces from many threads against one heap.
    Stress {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Operations per thread.
        #[arg(long, default_value_t = 5_000)]
        ops: usize,
        #[arg(long, default_value_t = 128)]
        max_live: usize,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "1")]
        seed: String,
        /// Heap mode (`strict` or `hardened`).
        #[arg(long, default_value = "strict")]
        mode: String,
        /// JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Commit deliberate misuse in both modes and check it is ignored.
    Misuse {
        /// JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Validate a JSONL log written by this tool.
    ValidateLog {
        #[arg(long)]
        input: PathBuf,
    },
}

type Emitter = LogEmitter<BufWriter<File>>;

fn parse_mode(raw: &str) -> Result<Mode, String> {
    match raw {
        "strict" => Ok(Mode::Strict),
        "hardened" => Ok(Mode::Hardened),
        other => Err(format!("Unsupported mode '{other}', expected strict|hardened")),
    }
}

fn parse_seed(raw: &str) -> Result<u64, String> {
    let cleaned = raw.replace('_', "");
    let parsed = match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse(),
    };
    parsed.map_err(|e| format!("invalid seed '{raw}': {e}"))
}

fn open_log(path: Option<&Path>, stream: StreamKind) -> std::io::Result<Option<Emitter>> {
    let run_id = format!("{}", std::process::id());
    path.map(|p| LogEmitter::to_file(p, &run_id, stream))
        .transpose()
}

fn log(emitter: &mut Option<Emitter>, entry: LogEntry) -> std::io::Result<()> {
    match emitter {
        Some(e) => e.emit_entry(entry),
        None => Ok(()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Generate {
            output,
            seed,
            ops,
            max_live,
            max_large,
        } => {
            let seed = parse_seed(&seed)?;
            let trace = trace::generate(&GenerateConfig {
                seed,
                ops,
                max_live,
                max_large,
            });
            let text = format!(
                "# slotmalloc trace seed={seed:#x} ops={}\n{}",
                trace.len(),
                trace.to_text()
            );
            match output {
                Some(path) => {
                    std::fs::write(&path, text)?;
                    eprintln!(
                        "Wrote {} ops to {} (sha256 {})",
                        trace.len(),
                        path.display(),
                        trace.sha256()
                    );
                }
                None => print!("{text}"),
            }
        }
        Command::Replay {
            trace,
            mode,
            log: log_path,
            report,
        } => {
            let mode = parse_mode(&mode)?;
            let mut emitter = open_log(log_path.as_deref(), StreamKind::Replay)?;
            let parsed = Trace::from_file(&trace)?;
            let digest = parsed.sha256();
            log(
                &mut emitter,
                LogEntry::new("", LogLevel::Info, "replay_start")
                    .with_mode(mode.as_str())
                    .with_trace_sha256(&digest)
                    .with_details(serde_json::json!({
                        "trace": trace.display().to_string(),
                        "ops": parsed.len(),
                    })),
            )?;

            let started = Instant::now();
            let result = slotmalloc_harness::replay_isolated(&parsed, mode);
            let elapsed = started.elapsed().as_millis() as u64;
            match result {
                Ok(summary) => {
                    log(
                        &mut emitter,
                        LogEntry::new("", LogLevel::Info, "replay_done")
                            .with_mode(mode.as_str())
                            .with_outcome(Outcome::Pass)
                            .with_duration_ms(elapsed)
                            .with_trace_sha256(&digest)
                            .with_details(serde_json::to_value(&summary)?),
                    )?;
                    let json = serde_json::to_string_pretty(&summary)?;
                    match report {
                        Some(path) => std::fs::write(&path, json)?,
                        None => println!("{json}"),
                    }
                    eprintln!(
                        "Replay passed: ops={}, peak_live={}, mode={}",
                        summary.ops,
                        summary.peak_live,
                        mode.as_str()
                    );
                }
                Err(err) => {
                    log(
                        &mut emitter,
                        LogEntry::new("", LogLevel::Error, "replay_failed")
                            .with_mode(mode.as_str())
                            .with_outcome(Outcome::Fail)
                            .with_duration_ms(elapsed)
                            .with_trace_sha256(&digest)
                            .with_details(serde_json::json!({ "error": err.to_string() })),
                    )?;
                    if let Some(e) = emitter.as_mut() {
                        e.flush()?;
                    }
                    return Err(err.into());
                }
            }
            if let Some(e) = emitter.as_mut() {
                e.flush()?;
            }
        }
        Command::Stress {
            threads,
            ops,
            max_live,
            seed,
            mode,
            log: log_path,
        } => {
            let config = StressConfig {
                threads,
                ops_per_thread: ops,
                max_live,
                seed: parse_seed(&seed)?,
                mode: parse_mode(&mode)?,
            };
            let mut emitter = open_log(log_path.as_deref(), StreamKind::Stress)?;
            log(
                &mut emitter,
                LogEntry::new("", LogLevel::Info, "stress_start")
                    .with_mode(config.mode.as_str())
                    .with_details(serde_json::json!({
                        "threads": config.threads,
                        "ops_per_thread": config.ops_per_thread,
                        "seed": config.seed,
                    })),
            )?;
            let outcome = stress::run(&config);
            let entry = match &outcome {
                Ok(report) => LogEntry::new("", LogLevel::Info, "stress_done")
                    .with_outcome(Outcome::Pass)
                    .with_duration_ms(report.elapsed_ms)
                    .with_details(serde_json::to_value(report)?),
                Err(err) => LogEntry::new("", LogLevel::Error, "stress_failed")
                    .with_outcome(Outcome::Fail)
                    .with_details(serde_json::json!({ "error": err.to_string() })),
            };
            log(&mut emitter, entry.with_mode(config.mode.as_str()))?;
            if let Some(e) = emitter.as_mut() {
                e.flush()?;
            }
            let report = outcome?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            eprintln!(
                "Stress passed: threads={}, ops_total={}, elapsed_ms={}",
                report.threads, report.ops_total, report.elapsed_ms
            );
        }
        Command::Misuse { log: log_path } => {
            let mut emitter = open_log(log_path.as_deref(), StreamKind::Misuse)?;
            let outcomes = misuse::run_all();
            let mut failed = 0usize;
            for outcome in &outcomes {
                let (level, verdict) = if outcome.passed {
                    (LogLevel::Info, Outcome::Pass)
                } else {
                    failed += 1;
                    (LogLevel::Error, Outcome::Fail)
                };
                log(
                    &mut emitter,
                    LogEntry::new("", level, "misuse_check")
                        .with_mode(outcome.mode)
                        .with_outcome(verdict)
                        .with_details(serde_json::to_value(outcome)?),
                )?;
            }
            if let Some(e) = emitter.as_mut() {
                e.flush()?;
            }
            println!("{}", serde_json::to_string_pretty(&outcomes)?);
            eprintln!(
                "Misuse checks: total={}, passed={}, failed={failed}",
                outcomes.len(),
                outcomes.len() - failed
            );
            if failed > 0 {
                return Err("Misuse oracle failed".into());
            }
        }
        Command::ValidateLog { input } => {
            let (lines, errors) = validate_log_file(&input)?;
            for err in &errors {
                eprintln!("{err}");
            }
            eprintln!("Validated {lines} lines, {} errors", errors.len());
            if !errors.is_empty() {
                return Err("Log validation failed".into());
            }
        }
    }

    Ok(())
}
