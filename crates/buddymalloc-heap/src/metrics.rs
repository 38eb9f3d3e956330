//! Atomic counters for heap observability.
//!
//! All counters use relaxed ordering: they are diagnostic, not
//! synchronization primitives.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-heap operation counters.
#[derive(Debug)]
pub struct HeapMetrics {
    /// Successful allocations (all entry points).
    pub allocations: AtomicU64,
    /// Releases satisfied by the caller's own arena.
    pub releases: AtomicU64,
    /// Releases satisfied by another thread's arena.
    pub foreign_releases: AtomicU64,
    /// Releases of unknown or already-released addresses, ignored.
    pub ignored_releases: AtomicU64,
    /// Reallocations that moved a block.
    pub reallocations: AtomicU64,
    /// Bins created.
    pub bins_created: AtomicU64,
    /// Thread arenas registered.
    pub arenas_registered: AtomicU64,
    /// Allocations refused because pages could not be mapped.
    pub out_of_memory: AtomicU64,
    /// Allocations refused for a bad alignment.
    pub invalid_alignment: AtomicU64,
    /// Allocations refused because the size overflowed.
    pub size_overflow: AtomicU64,
    /// Calls made with an arena handle from another heap.
    pub foreign_handles: AtomicU64,
}

impl HeapMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            foreign_releases: AtomicU64::new(0),
            ignored_releases: AtomicU64::new(0),
            reallocations: AtomicU64::new(0),
            bins_created: AtomicU64::new(0),
            arenas_registered: AtomicU64::new(0),
            out_of_memory: AtomicU64::new(0),
            invalid_alignment: AtomicU64::new(0),
            size_overflow: AtomicU64::new(0),
            foreign_handles: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters. Page counters come from the page provider.
    #[must_use]
    pub fn snapshot(&self, map_calls: u64, mapped_bytes: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations: Self::get(&self.allocations),
            releases: Self::get(&self.releases),
            foreign_releases: Self::get(&self.foreign_releases),
            ignored_releases: Self::get(&self.ignored_releases),
            reallocations: Self::get(&self.reallocations),
            bins_created: Self::get(&self.bins_created),
            arenas_registered: Self::get(&self.arenas_registered),
            out_of_memory: Self::get(&self.out_of_memory),
            invalid_alignment: Self::get(&self.invalid_alignment),
            size_overflow: Self::get(&self.size_overflow),
            foreign_handles: Self::get(&self.foreign_handles),
            map_calls,
            mapped_bytes,
        }
    }
}

impl Default for HeapMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of [`HeapMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allocations: u64,
    pub releases: u64,
    pub foreign_releases: u64,
    pub ignored_releases: u64,
    pub reallocations: u64,
    pub bins_created: u64,
    pub arenas_registered: u64,
    pub out_of_memory: u64,
    pub invalid_alignment: u64,
    pub size_overflow: u64,
    pub foreign_handles: u64,
    pub map_calls: u64,
    pub mapped_bytes: usize,
}
