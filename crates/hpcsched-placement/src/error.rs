//! Placement error types.
//!
//! Every failure carries a human-readable message bounded to
//! [`hpc_core::MAX_MESSAGE_LEN`] bytes. [`PlacementError::kind`] gives the
//! machine-checkable category.

use hpc_core::{RejectionCounts, bounded_message};
use thiserror::Error;

pub type PlacementResult<T> = Result<T, PlacementError>;

/// Failure category, independent of the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No node satisfies the static constraints.
    Infeasible,
    /// Feasible, but not enough idle or preemptible resources right now.
    InsufficientNow,
    /// Preemption not authorized or a per-iteration cap was hit.
    PolicyBlocked,
    AccountingFailure,
    PartialPreemption,
    Distribution,
    InvalidRequest,
    State,
}

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("infeasible: {0}")]
    Infeasible(String),

    #[error("insufficient resources: {0}")]
    InsufficientNow(String),

    #[error("policy blocked: {0}")]
    PolicyBlocked(String),

    #[error("accounting failure: {0}")]
    AccountingFailure(String),

    #[error("preemption of {victim} failed: {message}")]
    PartialPreemption { victim: String, message: String },

    #[error("distribution failed: {message}")]
    DistributionFailed {
        message: String,
        /// Rejection histogram per req, in req order.
        rejections: Vec<RejectionCounts>,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("state error: {0}")]
    State(#[from] hpcsched_state::StateError),
}

impl PlacementError {
    pub fn infeasible(msg: impl Into<String>) -> Self {
        Self::Infeasible(bounded_message(msg))
    }

    pub fn insufficient(msg: impl Into<String>) -> Self {
        Self::InsufficientNow(bounded_message(msg))
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        Self::PolicyBlocked(bounded_message(msg))
    }

    pub fn accounting(msg: impl Into<String>) -> Self {
        Self::AccountingFailure(bounded_message(msg))
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(bounded_message(msg))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Infeasible(_) => FailureKind::Infeasible,
            Self::InsufficientNow(_) => FailureKind::InsufficientNow,
            Self::PolicyBlocked(_) => FailureKind::PolicyBlocked,
            Self::AccountingFailure(_) => FailureKind::AccountingFailure,
            Self::PartialPreemption { .. } => FailureKind::PartialPreemption,
            Self::DistributionFailed { .. } => FailureKind::Distribution,
            Self::InvalidRequest(_) => FailureKind::InvalidRequest,
            Self::State(_) => FailureKind::State,
        }
    }

    /// The bounded human-readable message.
    pub fn message(&self) -> String {
        bounded_message(self.to_string())
    }
}
