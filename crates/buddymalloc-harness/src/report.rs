//! Rendering of a stress run.

use std::fmt::Write as _;

use buddymalloc_core::{AllocatorLogRecord, ArenaStats};
use buddymalloc_heap::{Heap, MetricsSnapshot};
use serde::Serialize;

use crate::error::HarnessError;
use crate::stress::{StressConfig, StressOutcome};

/// A lifecycle record with its trace id spelled out.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEntry {
    pub trace_id: String,
    #[serde(flatten)]
    pub record: AllocatorLogRecord,
}

/// Everything a run produced, ready for serialization.
#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub config: StressConfig,
    pub outcome: StressOutcome,
    pub metrics: MetricsSnapshot,
    pub arenas: Vec<ArenaStats>,
    pub lifecycle: Vec<LifecycleEntry>,
    pub lifecycle_overwritten: u64,
}

impl StressReport {
    /// Snapshot `heap` after a run. Drains its lifecycle log.
    #[must_use]
    pub fn capture(heap: &Heap, config: StressConfig, outcome: StressOutcome) -> Self {
        let lifecycle = heap
            .drain_lifecycle_logs()
            .into_iter()
            .map(|record| LifecycleEntry {
                trace_id: record.trace_id(),
                record,
            })
            .collect();
        Self {
            config,
            outcome,
            metrics: heap.metrics(),
            arenas: heap.stats(),
            lifecycle,
            lifecycle_overwritten: heap.lifecycle_overwritten(),
        }
    }

    pub fn to_json(&self) -> Result<String, HarnessError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Run summary followed by the heap's own per-arena report.
    pub fn to_text(&self, heap: &Heap) -> Result<String, HarnessError> {
        let mut out = String::new();
        let c = &self.config;
        writeln!(
            out,
            "stress: {} threads x {} ops, max {} bytes, seed {:#x}",
            c.threads, c.ops, c.max_size, c.seed
        )?;
        for w in &self.outcome.workers {
            writeln!(
                out,
                "  worker {:>2} (arena {:>2}): {} allocs ({} aligned, {} zeroed), {} frees, {} foreign frees, {} handoffs, peak {} live",
                w.worker,
                w.arena,
                w.allocations,
                w.aligned_allocations,
                w.zeroed_allocations,
                w.releases,
                w.foreign_releases,
                w.handoffs,
                w.peak_live
            )?;
        }
        writeln!(
            out,
            "survivors: {} blocks, {} bytes; violations: {}",
            self.outcome.survivors,
            self.outcome.survivor_bytes,
            self.outcome.violations.len()
        )?;
        for v in &self.outcome.violations {
            writeln!(out, "  ! {v}")?;
        }
        let m = &self.metrics;
        writeln!(
            out,
            "metrics: {} allocations, {} releases ({} foreign, {} ignored), {} bins, {} arenas, {} maps / {} bytes",
            m.allocations,
            m.releases,
            m.foreign_releases,
            m.ignored_releases,
            m.bins_created,
            m.arenas_registered,
            m.map_calls,
            m.mapped_bytes
        )?;
        for entry in &self.lifecycle {
            writeln!(
                out,
                "  [{}] {} {} {}",
                entry.record.level.as_str(),
                entry.trace_id,
                entry.record.event,
                entry.record.outcome
            )?;
        }
        out.push('\n');
        heap.write_report(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stress::run_stress;

    fn run() -> (Heap, StressReport) {
        let heap = Heap::default();
        let config = StressConfig {
            threads: 2,
            ops: 400,
            max_size: 512,
            seed: 0x5EED,
        };
        let outcome = run_stress(&heap, &config).expect("run");
        let report = StressReport::capture(&heap, config, outcome);
        (heap, report)
    }

    #[test]
    fn json_report_carries_metrics_and_arenas() {
        let (_heap, report) = run();
        let json: serde_json::Value = serde_json::from_str(&report.to_json().expect("json")).expect("parse");
        assert_eq!(json["config"]["threads"], 2);
        assert_eq!(json["arenas"].as_array().map(Vec::len), Some(3));
        assert!(json["metrics"]["allocations"].as_u64().unwrap_or(0) > 0);
        assert!(json["outcome"]["violations"].as_array().is_some_and(Vec::is_empty));
    }

    #[test]
    fn text_report_ends_with_heap_report() {
        let (heap, report) = run();
        let text = report.to_text(&heap).expect("text");
        assert!(text.starts_with("stress: 2 threads x 400 ops"));
        assert!(text.contains("Arena 0 Info"));
        assert!(text.contains("Total Allocation Requests"));
    }
}
