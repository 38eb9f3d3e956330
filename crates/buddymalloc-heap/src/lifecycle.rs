//! Bounded lifecycle log.
//!
//! The heap cannot allocate while it records its own events, so records go
//! into a fixed ring that overwrites the oldest entry when full.

use std::sync::atomic::{AtomicU64, Ordering};

use buddymalloc_core::{AllocatorLogLevel, AllocatorLogRecord};
use parking_lot::Mutex;

/// Records kept before the oldest is overwritten.
pub const LIFECYCLE_LOG_CAPACITY: usize = 256;

struct Ring {
    records: [Option<AllocatorLogRecord>; LIFECYCLE_LOG_CAPACITY],
    start: usize,
    len: usize,
}

/// Level-filtered ring of [`AllocatorLogRecord`]s.
pub struct LifecycleLog {
    min_level: AllocatorLogLevel,
    next_decision_id: AtomicU64,
    overwritten: AtomicU64,
    ring: Mutex<Ring>,
}

impl LifecycleLog {
    #[must_use]
    pub const fn new(min_level: AllocatorLogLevel) -> Self {
        Self {
            min_level,
            next_decision_id: AtomicU64::new(1),
            overwritten: AtomicU64::new(0),
            ring: Mutex::new(Ring {
                records: [None; LIFECYCLE_LOG_CAPACITY],
                start: 0,
                len: 0,
            }),
        }
    }

    #[must_use]
    pub fn enabled(&self, level: AllocatorLogLevel) -> bool {
        level >= self.min_level
    }

    /// Store `record` if its level passes the filter, stamping its decision id.
    pub fn record(&self, mut record: AllocatorLogRecord) {
        if !self.enabled(record.level) {
            return;
        }
        record.decision_id = self.next_decision_id.fetch_add(1, Ordering::Relaxed);
        let mut ring = self.ring.lock();
        let slot = (ring.start + ring.len) % LIFECYCLE_LOG_CAPACITY;
        ring.records[slot] = Some(record);
        if ring.len == LIFECYCLE_LOG_CAPACITY {
            ring.start = (ring.start + 1) % LIFECYCLE_LOG_CAPACITY;
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        } else {
            ring.len += 1;
        }
    }

    /// Take every stored record, oldest first.
    pub fn drain(&self) -> Vec<AllocatorLogRecord> {
        // Reserve before locking: the heap may be this process's allocator.
        let mut out = Vec::with_capacity(LIFECYCLE_LOG_CAPACITY);
        let mut ring = self.ring.lock();
        for i in 0..ring.len {
            let slot = (ring.start + i) % LIFECYCLE_LOG_CAPACITY;
            if let Some(record) = ring.records[slot].take() {
                out.push(record);
            }
        }
        ring.start = 0;
        ring.len = 0;
        out
    }

    /// Records lost to overwriting since the heap was created.
    #[must_use]
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}
