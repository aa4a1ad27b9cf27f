//! # slotmalloc-abi
//!
//! C allocator boundary for slotmalloc.
//!
//! This crate produces a `cdylib` exposing `malloc`, `free`, `calloc`,
//! `realloc` and `malloc_usable_size` over one process-wide [`Heap`]. The
//! symbols are only exported unmangled with the `interpose` feature; without
//! it they are ordinary Rust functions, which keeps test binaries on the
//! system allocator.
//!
//! ```text
//! C caller -> ABI entry (this crate) -> HEAP lock -> router -> recycler
//! ```
//!
//! Rust programs can instead install [`SlotMalloc`] as `#[global_allocator]`.

use slotmalloc_core::Heap;

pub mod global_alloc;
pub mod malloc_abi;

pub use global_alloc::SlotMalloc;

/// The process-wide heap behind every ABI entry point.
pub static HEAP: Heap = Heap::new();
