//! hpcsched-state: in-memory scheduler state.
//!
//! Owns the node, job, partition and VM records the placement engine works
//! on, plus the [`SchedulerContext`] that carries policy and per-iteration
//! counters between scheduling passes.
//!
//! # Architecture
//!
//! ```text
//! SchedulerContext
//!   ├── NodeRegistry       (index order = selection order)
//!   ├── JobRegistry        (table order = tie-break order)
//!   ├── PartitionRegistry  (partition 0 spans every node)
//!   ├── VmRegistry
//!   ├── IterationCounters  (reset by begin_iteration)
//!   └── feasible node list cache
//! ```
//!
//! Node claims go through [`Node::claim`] / [`Node::release`], which keep
//! `dedicated + available == configured` for every node.

pub mod context;
pub mod error;
pub mod registry;
pub mod types;

pub use context::{IterationCounters, SchedulerContext};
pub use error::{StateError, StateResult};
pub use registry::{JobRegistry, NodeRegistry, PartitionRegistry, VmRegistry};
pub use types::*;
