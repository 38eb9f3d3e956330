//! Stress and inspection tooling for the buddymalloc heap.
//!
//! This crate provides:
//! - [`stress`]: a seeded multithreaded workload with cross-thread hand-offs
//!   and end-of-run invariant checks
//! - [`plan`]: how a single request would be served (block and bin size)
//! - [`report`]: text and JSON rendering of a run

#![forbid(unsafe_code)]

pub mod error;
pub mod plan;
pub mod report;
pub mod stress;

pub use error::HarnessError;
pub use plan::{RequestPlan, plan_request};
pub use report::StressReport;
pub use stress::{StressConfig, StressOutcome, ThreadSummary, run_stress};
