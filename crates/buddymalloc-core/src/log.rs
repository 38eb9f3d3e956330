//! Allocator lifecycle records.
//!
//! Records are plain `Copy` values so the heap can store them in a fixed ring
//! without calling back into an allocator.

use serde::Serialize;

/// Allocator lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl AllocatorLogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Parse a level name (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocatorLogRecord {
    /// Monotonic decision/event id, assigned when the record is stored.
    pub decision_id: u64,
    /// Severity level.
    pub level: AllocatorLogLevel,
    /// API symbol (`malloc`, `free`, `memalign`, `realloc`, `calloc`, ...).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `free`, `bin_created`, ...).
    pub event: &'static str,
    /// Thread tag of the arena the event happened in (0 when none).
    pub thread: u64,
    /// Address involved in the event.
    pub ptr: Option<usize>,
    /// Size value involved in the event.
    pub size: Option<usize>,
    /// Bin ordinal within the arena.
    pub bin: Option<usize>,
    /// Registry index of the arena.
    pub arena: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
}

impl AllocatorLogRecord {
    #[must_use]
    pub const fn new(
        level: AllocatorLogLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
    ) -> Self {
        Self {
            decision_id: 0,
            level,
            symbol,
            event,
            thread: 0,
            ptr: None,
            size: None,
            bin: None,
            arena: None,
            outcome,
        }
    }

    #[must_use]
    pub const fn thread(mut self, thread: u64) -> Self {
        self.thread = thread;
        self
    }

    #[must_use]
    pub const fn ptr(mut self, ptr: usize) -> Self {
        self.ptr = Some(ptr);
        self
    }

    #[must_use]
    pub const fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub const fn bin(mut self, bin: usize) -> Self {
        self.bin = Some(bin);
        self
    }

    #[must_use]
    pub const fn arena(mut self, arena: usize) -> Self {
        self.arena = Some(arena);
        self
    }

    /// Correlation id for this record.
    #[must_use]
    pub fn trace_id(&self) -> String {
        format!("heap::malloc::{}::{:016x}", self.symbol, self.decision_id)
    }
}
