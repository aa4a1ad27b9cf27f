//! Page-backed fixed-slot allocation engine.
//!
//! Memory comes straight from anonymous page mappings and is carved into
//! fixed-size slots; nothing is delegated to another allocator.
//!
//! # Architecture
//!
//! - **Utilities** (`util`): overflow-checked arithmetic, 16-byte alignment, cached page size
//! - **Page source** (`page_source`): maps and unmaps regions, owns the region header layout
//! - **Slot recycler** (`recycler`): intrusive free list over one region's slots
//! - **Region directory** (`directory`): per-class region and candidate lists, pointer lookup by masking
//! - **Region index** (`region_index`): mmap-backed hash set of region bases, checked before any header read
//! - **Size classes** (`size_class`): 16..=1024 power-of-two classes plus the large class
//! - **Router** (`router`): picks or maps a region and drives the region lifecycle
//! - **Heap lock** (`guard`): non-allocating re-entrant lock
//! - **Heap** (`heap`): allocate / deallocate / resize / allocate_zeroed
//! - **Configuration** (`config`): strict or hardened mode from `SLOTMALLOC_MODE`
//! - **Metrics** (`metrics`): atomic counters for observability

#![deny(unsafe_code)]

pub mod config;
pub mod directory;
pub mod error;
pub mod guard;
pub mod heap;
pub mod metrics;
pub mod page_source;
pub mod recycler;
pub mod region_index;
pub mod router;
pub mod size_class;
pub mod util;

pub use config::Mode;
pub use error::AllocError;
pub use heap::{Heap, ModeSource};
pub use metrics::{AllocatorMetrics, MetricsSnapshot};
pub use page_source::{PageMapper, SystemPages};
pub use recycler::FreeResult;
pub use router::Audit;
