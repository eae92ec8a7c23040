//! Error types for the scheduler state.

use thiserror::Error;

/// Result type alias for state operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("partition not found: {0}")]
    PartitionNotFound(String),

    #[error("node {node}: requested {requested} exceeds available {available}")]
    OverCommit {
        node: String,
        requested: String,
        available: String,
    },

    #[error("invalid allocation: {0}")]
    InvalidAllocation(String),
}
