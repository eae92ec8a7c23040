//! Error types for the Wiki protocol layer.
//!
//! Transport failures (`Connect`, `Timeout`, `Io`) are distinct from
//! protocol-level failures (`Status`), which carry the RM's own message.

use hpc_core::bounded_message;
use hpcsched_state::StateError;
use thiserror::Error;

pub type WikiResult<T> = Result<T, WikiError>;

#[derive(Debug, Error)]
pub enum WikiError {
    #[error("cannot connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("timed out talking to {0}")]
    Timeout(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rm returned status {code}: {message}")]
    Status { code: i32, message: String },

    #[error("malformed wiki data: {0}")]
    Malformed(String),

    #[error("unknown attribute {0}")]
    UnknownAttribute(String),

    #[error("invalid value '{value}' for {attribute}")]
    InvalidValue { attribute: String, value: String },

    #[error("rm {0} already failed this iteration")]
    FailedThisIteration(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl WikiError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(bounded_message(msg))
    }

    pub fn invalid(attribute: &str, value: &str) -> Self {
        Self::InvalidValue {
            attribute: attribute.to_string(),
            value: bounded_message(value),
        }
    }

    /// Transport-level failure, as opposed to an RM-reported one.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Timeout(_) | Self::Io(_))
    }
}
