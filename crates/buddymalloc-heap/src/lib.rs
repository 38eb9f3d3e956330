//! # buddymalloc-heap
//!
//! Multithreaded buddy heap built on `buddymalloc-core`.
//!
//! # Architecture
//!
//! - **Page provider** (`pages`): anonymous mappings, never returned
//! - **Process registry** (`registry`): append-only, lock-free readable table of
//!   thread arenas, one lock per arena
//! - **Thread arenas** (`arena`): chained metadata pages of bin records and a
//!   metadata pool; first-fit bin search
//! - **Heap** (`heap`): explicit-context allocate / release / reallocate and
//!   the cross-arena release scan
//! - **Global entry points** (`global`): thread-local arena lookup over a
//!   process-wide heap, plus a `GlobalAlloc` adapter
//! - **Configuration** (`config`), **metrics** (`metrics`) and the bounded
//!   **lifecycle log** (`lifecycle`)

#![deny(unsafe_code)]

mod arena;
pub mod config;
pub mod global;
mod heap;
pub mod lifecycle;
pub mod metrics;
mod pages;
mod registry;

pub use buddymalloc_core::{AllocError, AllocatorLogLevel, AllocatorLogRecord, ArenaStats, BinStats};
pub use config::{ConfigError, HeapConfig, HeapConfigBuilder};
pub use global::{BuddyMalloc, global_heap};
pub use heap::{ArenaHandle, FreeResult, Heap};
pub use metrics::{HeapMetrics, MetricsSnapshot};
