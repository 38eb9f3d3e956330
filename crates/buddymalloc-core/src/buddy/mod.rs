//! Buddy-tree allocation inside a single bin.
//!
//! A bin is a power-of-two region split recursively into halves down to the
//! minimum block size. Each node of the implicit complete binary tree (root 0,
//! children `2i+1` and `2i+2`) stores one of ten states summarising its two
//! halves, packed two nodes per byte.

pub mod nodes;
pub mod state;
pub mod tree;

pub use nodes::NodeStates;
pub use state::{NodeState, Occupancy, Side};
pub use tree::{BuddyTree, Grant, ReleaseResult};
