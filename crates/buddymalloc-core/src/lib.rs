//! # buddymalloc-core
//!
//! Safe allocation policy for the buddymalloc heap.
//!
//! This crate owns everything that can be expressed without touching raw
//! memory: the buddy-tree node state machine, the packed 4-bit node store,
//! bin sizing rules, stats rendering and lifecycle log records. The
//! `buddymalloc-heap` crate maps pages and drives these types over them.

#![deny(unsafe_code)]

pub mod buddy;
pub mod errno;
pub mod error;
pub mod log;
pub mod sizing;
pub mod stats;

pub use buddy::{BuddyTree, Grant, NodeState, NodeStates, Occupancy, ReleaseResult, Side};
pub use error::AllocError;
pub use log::{AllocatorLogLevel, AllocatorLogRecord};
pub use stats::{ArenaStats, BinStats, ReportWriter, StatsCollector, StatsVisitor};
