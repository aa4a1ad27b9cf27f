//! Allocation traces: a line-oriented text format, its parser, and a
//! seeded generator.
//!
//! One operation per line, `#` starts a comment:
//!
//! ```text
//! a <id> <size>          allocate
//! z <id> <count> <size>  allocate zeroed
//! r <id> <size>          resize (allocates when <id> is not live)
//! f <id>                 free
//! ```

use std::fmt;
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// One trace operation. Ids name allocations for the lifetime of the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Alloc { id: u32, size: usize },
    Zeroed { id: u32, count: usize, size: usize },
    Resize { id: u32, size: usize },
    Free { id: u32 },
}

impl Op {
    #[must_use]
    pub const fn id(&self) -> u32 {
        match *self {
            Self::Alloc { id, .. }
            | Self::Zeroed { id, .. }
            | Self::Resize { id, .. }
            | Self::Free { id } => id,
        }
    }

    /// Entry point the op exercises, as logged.
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match self {
            Self::Alloc { .. } => "allocate",
            Self::Zeroed { .. } => "allocate_zeroed",
            Self::Resize { .. } => "resize",
            Self::Free { .. } => "deallocate",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Alloc { id, size } => write!(f, "a {id} {size}"),
            Self::Zeroed { id, count, size } => write!(f, "z {id} {count} {size}"),
            Self::Resize { id, size } => write!(f, "r {id} {size}"),
            Self::Free { id } => write!(f, "f {id}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: unknown operation '{op}'")]
    UnknownOp { line: usize, op: String },
    #[error("line {line}: expected {expected} operands, found {found}")]
    Arity {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("line {line}: invalid number '{token}'")]
    Number { line: usize, token: String },
}

/// An ordered list of operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    pub ops: Vec<Op>,
}

impl Trace {
    /// Parse the text format.
    pub fn parse(text: &str) -> Result<Self, TraceError> {
        let mut ops = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let body = raw.split('#').next().unwrap_or_default().trim();
            if body.is_empty() {
                continue;
            }
            let mut tokens = body.split_whitespace();
            let Some(op) = tokens.next() else {
                continue;
            };
            let operands: Vec<&str> = tokens.collect();
            let arity = |expected: usize| {
                if operands.len() == expected {
                    Ok(())
                } else {
                    Err(TraceError::Arity {
                        line,
                        expected,
                        found: operands.len(),
                    })
                }
            };
            let op = match op {
                "a" => {
                    arity(2)?;
                    Op::Alloc {
                        id: number(operands[0], line)?,
                        size: number(operands[1], line)?,
                    }
                }
                "z" => {
                    arity(3)?;
                    Op::Zeroed {
                        id: number(operands[0], line)?,
                        count: number(operands[1], line)?,
                        size: number(operands[2], line)?,
                    }
                }
                "r" => {
                    arity(2)?;
                    Op::Resize {
                        id: number(operands[0], line)?,
                        size: number(operands[1], line)?,
                    }
                }
                "f" => {
                    arity(1)?;
                    Op::Free {
                        id: number(operands[0], line)?,
                    }
                }
                other => {
                    return Err(TraceError::UnknownOp {
                        line,
                        op: other.to_string(),
                    });
                }
            };
            ops.push(op);
        }
        Ok(Self { ops })
    }

    pub fn from_file(path: &Path) -> Result<Self, TraceError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Render back to the text format, one op per line.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = String::with_capacity(self.ops.len() * 12);
        for op in &self.ops {
            out.push_str(&op.to_string());
            out.push('\n');
        }
        out
    }

    /// Lowercase hex SHA-256 of [`Self::to_text`].
    #[must_use]
    pub fn sha256(&self) -> String {
        hex_lower(&Sha256::digest(self.to_text().as_bytes()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

fn number<T: std::str::FromStr>(token: &str, line: usize) -> Result<T, TraceError> {
    token.parse().map_err(|_| TraceError::Number {
        line,
        token: token.to_string(),
    })
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Deterministic PRNG (xorshift64*).
#[derive(Debug, Clone, Copy)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        // Zero is a fixed point.
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform in `low..=high`.
    pub fn range(&mut self, low: usize, high: usize) -> usize {
        debug_assert!(low <= high);
        let span = (high - low) as u64 + 1;
        low + (self.next_u64() % span) as usize
    }
}

/// Knobs for [`generate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerateConfig {
    pub seed: u64,
    pub ops: usize,
    /// Upper bound on simultaneously live ids.
    pub max_live: usize,
    /// Largest size drawn for the large class.
    pub max_large: usize,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            ops: 10_000,
            max_live: 256,
            max_large: 64 * 1024,
        }
    }
}

/// Size mix: mostly tiny and small-class requests, some large ones.
fn draw_size(rng: &mut XorShift64, max_large: usize) -> usize {
    match rng.range(0, 99) {
        0..=49 => rng.range(1, 64),
        50..=84 => rng.range(65, 1024),
        _ => rng.range(1025, max_large.max(1025)),
    }
}

/// Build a well-formed trace: frees and resizes only name live ids, and
/// every id still live at the end is freed.
#[must_use]
pub fn generate(config: &GenerateConfig) -> Trace {
    let mut rng = XorShift64::new(config.seed);
    let max_live = config.max_live.max(1);
    let mut live: Vec<u32> = Vec::with_capacity(max_live);
    let mut next_id = 0u32;
    let mut ops = Vec::with_capacity(config.ops + max_live);

    for _ in 0..config.ops {
        let roll = rng.range(0, 99);
        if live.is_empty() || (roll < 45 && live.len() < max_live) {
            let id = next_id;
            next_id = next_id.wrapping_add(1);
            let size = draw_size(&mut rng, config.max_large);
            if rng.range(0, 4) == 0 {
                let count = rng.range(1, 8);
                ops.push(Op::Zeroed {
                    id,
                    count,
                    size: size.div_ceil(count),
                });
            } else {
                ops.push(Op::Alloc { id, size });
            }
            live.push(id);
        } else if roll < 75 || live.len() >= max_live {
            let victim = rng.range(0, live.len() - 1);
            ops.push(Op::Free {
                id: live.swap_remove(victim),
            });
        } else {
            let target = live[rng.range(0, live.len() - 1)];
            ops.push(Op::Resize {
                id: target,
                size: draw_size(&mut rng, config.max_large),
            });
        }
    }

    ops.extend(live.into_iter().map(|id| Op::Free { id }));
    Trace { ops }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_operations_and_comments() {
        let trace = Trace::parse(
            "# header\n\
             a 1 10\n\
             \n\
             z 2 4 8   # zeroed\n\
             r 1 20\n\
             f 2\n",
        )
        .unwrap();
        assert_eq!(
            trace.ops,
            vec![
                Op::Alloc { id: 1, size: 10 },
                Op::Zeroed { id: 2, count: 4, size: 8 },
                Op::Resize { id: 1, size: 20 },
                Op::Free { id: 2 },
            ]
        );
    }

    #[test]
    fn parse_errors_carry_line_numbers() {
        match Trace::parse("a 1 1\nq 3\n") {
            Err(TraceError::UnknownOp { line: 2, op }) => assert_eq!(op, "q"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            Trace::parse("f\n"),
            Err(TraceError::Arity { line: 1, expected: 1, found: 0 })
        ));
        assert!(matches!(
            Trace::parse("a 1 -5"),
            Err(TraceError::Number { line: 1, .. })
        ));
    }

    #[test]
    fn text_form_reparses() {
        let trace = generate(&GenerateConfig {
            ops: 500,
            ..GenerateConfig::default()
        });
        assert_eq!(Trace::parse(&trace.to_text()).unwrap(), trace);
    }

    #[test]
    fn generation_is_deterministic_per_seed() {
        let cfg = GenerateConfig {
            seed: 42,
            ops: 1_000,
            ..GenerateConfig::default()
        };
        assert_eq!(generate(&cfg).sha256(), generate(&cfg).sha256());
        let other = GenerateConfig { seed: 43, ..cfg };
        assert_ne!(generate(&cfg).sha256(), generate(&other).sha256());
    }

    #[test]
    fn generated_traces_are_well_formed() {
        let trace = generate(&GenerateConfig {
            seed: 7,
            ops: 3_000,
            max_live: 16,
            max_large: 10_000,
        });
        let mut live = std::collections::HashSet::new();
        let mut peak = 0;
        for op in &trace.ops {
            match *op {
                Op::Alloc { id, size } => {
                    assert!(size >= 1 && size <= 10_000);
                    assert!(live.insert(id));
                }
                Op::Zeroed { id, count, size } => {
                    assert!(count >= 1 && size >= 1);
                    assert!(live.insert(id));
                }
                Op::Resize { id, .. } => assert!(live.contains(&id)),
                Op::Free { id } => assert!(live.remove(&id)),
            }
            peak = peak.max(live.len());
        }
        assert!(live.is_empty());
        assert!(peak <= 16);
    }

    #[test]
    fn digest_is_hex_sha256() {
        let empty = Trace::default();
        assert_eq!(
            empty.sha256(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
