//! Runtime mode configuration.
//!
//! The mode is read from the `SLOTMALLOC_MODE` environment variable:
//! - `strict` (default): misuse (double free, foreign free) is rejected
//!   silently and `resize` of an unknown pointer fails.
//! - `hardened`: additionally poisons freed slots and treats `resize` of an
//!   unknown pointer as a fresh allocation.
//!
//! Both modes check region membership before reading a masked header.
//!
//! The variable is read with `libc::getenv` so that resolving the mode never
//! allocates; the engine may be running underneath the process allocator.

#![allow(unsafe_code)]

use std::ffi::CStr;
use std::sync::atomic::{AtomicU8, Ordering};

/// Environment variable holding the mode.
pub const MODE_ENV: &CStr = c"SLOTMALLOC_MODE";

/// Byte written over freed slot storage in hardened mode.
pub const POISON_BYTE: u8 = 0xFE;

/// Operating mode of a heap.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    #[default]
    Strict,
    Hardened,
}

impl Mode {
    /// Parse from string (case-insensitive). Unknown values fall back to strict.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        Self::from_bytes_loose(s.as_bytes())
    }

    /// Byte-level parse used on raw environment values.
    #[must_use]
    pub fn from_bytes_loose(raw: &[u8]) -> Self {
        const HARDENED: [&[u8]; 4] = [b"hardened", b"harden", b"paranoid", b"full"];
        if HARDENED.iter().any(|name| raw.eq_ignore_ascii_case(name)) {
            Self::Hardened
        } else {
            Self::Strict
        }
    }

    /// Freed slots get their storage overwritten with [`POISON_BYTE`].
    #[must_use]
    pub const fn poisons_freed_slots(self) -> bool {
        matches!(self, Self::Hardened)
    }

    /// `resize` of an unresolvable pointer falls back to `allocate`.
    #[must_use]
    pub const fn resize_unknown_as_allocate(self) -> bool {
        matches!(self, Self::Hardened)
    }

    /// Lower-case name, matching what `from_str_loose` accepts.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Hardened => "hardened",
        }
    }

    const fn to_tag(self) -> u8 {
        match self {
            Self::Strict => 1,
            Self::Hardened => 2,
        }
    }

    const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Strict),
            2 => Some(Self::Hardened),
            _ => None,
        }
    }
}

/// 0 = not yet read.
static GLOBAL_MODE: AtomicU8 = AtomicU8::new(0);

/// Get the configured mode (reads the environment on first call, caches thereafter).
#[must_use]
pub fn mode() -> Mode {
    if let Some(mode) = Mode::from_tag(GLOBAL_MODE.load(Ordering::Acquire)) {
        return mode;
    }
    let mode = read_env_mode();
    GLOBAL_MODE.store(mode.to_tag(), Ordering::Release);
    mode
}

fn read_env_mode() -> Mode {
    // SAFETY: MODE_ENV is NUL-terminated; getenv returns null or a pointer to a
    // NUL-terminated string owned by the environment.
    let raw = unsafe { libc::getenv(MODE_ENV.as_ptr()) };
    if raw.is_null() {
        return Mode::Strict;
    }
    // SAFETY: non-null getenv results are valid C strings.
    let value = unsafe { CStr::from_ptr(raw) };
    Mode::from_bytes_loose(value.to_bytes())
}
