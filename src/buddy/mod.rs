//! Buddy engine module
//!
//! This module provides the per-heap buddy machinery:
//! - Pure index arithmetic over an implicit binary tree
//! - Flat node state tree with a largest-free cache
//! - Split, coalesce and search-by-size
//! - Statistics and debugging

pub mod engine;
pub mod node;
pub mod stats;
pub mod tree;

pub use engine::{Child, DescentPolicy};
pub use node::NodeState;
#[cfg(feature = "tracking")]
pub use stats::HeapCounters;
pub use stats::{HeapStats, MemoryStatsReporter};
pub use tree::{InconsistentNode, NodeStateTree, MAX_TREE_ORDER, ORDER_SLOTS};
