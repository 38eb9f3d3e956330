//! Heap statistics: per-bin counters, arena summaries and the text report.
//!
//! The heap walks its registry and feeds a [`StatsVisitor`]. Two visitors
//! ship here: [`ReportWriter`] renders the human-readable report without
//! allocating, and [`StatsCollector`] gathers serializable snapshots.

use std::fmt;

use serde::Serialize;

const ARENA_RULE: &str = "===========================================";
const BIN_RULE: &str = "-------------------------------------------";

/// Counters for one bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BinStats {
    /// Ordinal of the bin within its arena (creation order).
    pub index: usize,
    /// Start address of the bin.
    pub base: usize,
    pub total_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub alloc_requests: u64,
    pub free_requests: u64,
}

/// Snapshot of one thread arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArenaStats {
    /// Registry index (registration order).
    pub index: usize,
    /// Thread tag of the owner.
    pub thread: u64,
    /// Sum of bin sizes.
    pub arena_size: usize,
    pub bins: Vec<BinStats>,
}

impl ArenaStats {
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.bins.iter().map(|b| b.used_bytes).sum()
    }

    #[must_use]
    pub fn alloc_requests(&self) -> u64 {
        self.bins.iter().map(|b| b.alloc_requests).sum()
    }

    #[must_use]
    pub fn free_requests(&self) -> u64 {
        self.bins.iter().map(|b| b.free_requests).sum()
    }
}

/// Receives the heap's stats traversal, arena by arena.
pub trait StatsVisitor {
    /// Called once per published arena, before its bins.
    fn arena(&mut self, index: usize, thread: u64, arena_size: usize, bin_count: usize);
    /// Called once per bin of the most recent arena.
    fn bin(&mut self, stats: &BinStats);
    /// Called after the last arena.
    fn finish(&mut self) {}
}

/// Renders the text report into any [`fmt::Write`] sink.
///
/// The first write error is kept and later writes are skipped.
pub struct ReportWriter<W> {
    out: W,
    result: fmt::Result,
}

impl<W: fmt::Write> ReportWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            result: Ok(()),
        }
    }

    /// Returns the sink and the first write error, if any.
    pub fn into_inner(self) -> (W, fmt::Result) {
        (self.out, self.result)
    }

    fn emit(&mut self, args: fmt::Arguments<'_>) {
        if self.result.is_ok() {
            self.result = self.out.write_fmt(args);
        }
    }
}

impl<W: fmt::Write> StatsVisitor for ReportWriter<W> {
    fn arena(&mut self, index: usize, _thread: u64, arena_size: usize, bin_count: usize) {
        self.emit(format_args!("{ARENA_RULE}\n"));
        self.emit(format_args!("Arena {index} Info\n"));
        self.emit(format_args!("Total Size : {arena_size}\n"));
        self.emit(format_args!("Number of Bins : {bin_count}\n"));
    }

    fn bin(&mut self, stats: &BinStats) {
        self.emit(format_args!("{BIN_RULE}\n"));
        self.emit(format_args!("Bin {} Info\n", stats.index));
        self.emit(format_args!("Total Size : {}\n", stats.total_bytes));
        self.emit(format_args!("Used Space : {}\n", stats.used_bytes));
        self.emit(format_args!("Free Space : {}\n", stats.free_bytes));
        self.emit(format_args!(
            "Total Allocation Requests : {}\n",
            stats.alloc_requests
        ));
        self.emit(format_args!("Total Free Requests : {}\n", stats.free_requests));
    }

    fn finish(&mut self) {
        self.emit(format_args!("{ARENA_RULE}\n"));
    }
}

/// Collects arena snapshots.
#[derive(Debug, Default)]
pub struct StatsCollector {
    arenas: Vec<ArenaStats>,
}

impl StatsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn into_arenas(self) -> Vec<ArenaStats> {
        self.arenas
    }
}

impl StatsVisitor for StatsCollector {
    fn arena(&mut self, index: usize, thread: u64, arena_size: usize, bin_count: usize) {
        self.arenas.push(ArenaStats {
            index,
            thread,
            arena_size,
            bins: Vec::with_capacity(bin_count),
        });
    }

    fn bin(&mut self, stats: &BinStats) {
        if let Some(arena) = self.arenas.last_mut() {
            arena.bins.push(*stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bin(index: usize, used: usize) -> BinStats {
        BinStats {
            index,
            base: 0x4000_0000 + index * 0x8_0000,
            total_bytes: 0x8_0000,
            used_bytes: used,
            free_bytes: 0x8_0000 - used,
            alloc_requests: 3,
            free_requests: 1,
        }
    }

    fn visit(visitor: &mut impl StatsVisitor) {
        visitor.arena(0, 1, 0x10_0000, 2);
        visitor.bin(&bin(0, 64));
        visitor.bin(&bin(1, 0));
        visitor.arena(1, 2, 0, 0);
        visitor.finish();
    }

    #[test]
    fn test_report_layout() {
        let mut writer = ReportWriter::new(String::new());
        visit(&mut writer);
        let (text, result) = writer.into_inner();
        assert!(result.is_ok());
        assert!(text.contains("Arena 0 Info\nTotal Size : 1048576\nNumber of Bins : 2\n"));
        assert!(text.contains("Bin 1 Info\nTotal Size : 524288\nUsed Space : 0\n"));
        assert!(text.contains("Free Space : 524224\n"));
        assert!(text.contains("Total Allocation Requests : 3\nTotal Free Requests : 1\n"));
        assert!(text.contains("Arena 1 Info"));
        assert!(text.ends_with(&format!("{ARENA_RULE}\n")));
        assert_eq!(text.matches("Bin ").count(), 2);
    }

    struct FailingSink {
        writes: usize,
    }

    impl fmt::Write for FailingSink {
        fn write_str(&mut self, _s: &str) -> fmt::Result {
            self.writes += 1;
            Err(fmt::Error)
        }
    }

    #[test]
    fn test_report_stops_after_first_error() {
        let mut writer = ReportWriter::new(FailingSink { writes: 0 });
        visit(&mut writer);
        let (sink, result) = writer.into_inner();
        assert!(result.is_err());
        assert_eq!(sink.writes, 1);
    }

    #[test]
    fn test_collector_groups_bins_by_arena() {
        let mut collector = StatsCollector::new();
        visit(&mut collector);
        let arenas = collector.into_arenas();
        assert_eq!(arenas.len(), 2);
        assert_eq!(arenas[0].bins.len(), 2);
        assert_eq!(arenas[0].used_bytes(), 64);
        assert_eq!(arenas[0].alloc_requests(), 6);
        assert_eq!(arenas[0].free_requests(), 2);
        assert!(arenas[1].bins.is_empty());
    }

    #[test]
    fn test_arena_stats_serialize() {
        let mut collector = StatsCollector::new();
        visit(&mut collector);
        let json = serde_json::to_value(collector.into_arenas()).expect("stats serialize");
        assert_eq!(json[0]["thread"], 1);
        assert_eq!(json[0]["bins"][0]["used_bytes"], 64);
        assert_eq!(json[1]["arena_size"], 0);
    }
}
