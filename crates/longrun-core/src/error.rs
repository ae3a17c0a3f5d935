//! Error taxonomy for the workflow substrate

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for workflow operations
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Errors surfaced by the workflow substrate
///
/// The taxonomy is deliberately small. `Cancelled` is cooperative cancellation
/// and is always a distinguished kind so callers can tell it apart from real
/// faults. `Fault` wraps any error escaping user-supplied code; a fault that
/// reaches the workflow body moves the workflow to the `Faulted` status.
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    /// Cooperative cancellation
    #[error("operation was cancelled")]
    Cancelled,

    /// Caller violated a precondition (duplicate action, off-thread mutation,
    /// stop after terminal status, ...)
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    /// Unknown action, state, or data field
    #[error("not found: {0}")]
    NotFound(String),

    /// A bounded wait expired
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// An error escaped user-supplied code
    #[error("{0}")]
    Fault(Arc<anyhow::Error>),
}

impl WorkflowError {
    /// Create an `InvalidUsage` error
    pub fn invalid_usage(msg: impl Into<String>) -> Self {
        WorkflowError::InvalidUsage(msg.into())
    }

    /// Create a `NotFound` error
    pub fn not_found(msg: impl Into<String>) -> Self {
        WorkflowError::NotFound(msg.into())
    }

    /// Wrap a user error as a fault
    pub fn fault(err: impl Into<anyhow::Error>) -> Self {
        WorkflowError::Fault(Arc::new(err.into()))
    }

    /// True for cooperative cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkflowError::Cancelled)
    }
}

impl From<anyhow::Error> for WorkflowError {
    fn from(err: anyhow::Error) -> Self {
        WorkflowError::Fault(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = WorkflowError::invalid_usage("stop after terminal status");
        assert_eq!(err.to_string(), "invalid usage: stop after terminal status");
    }

    #[test]
    fn test_fault_wraps_source_message() {
        let err = WorkflowError::fault(anyhow::anyhow!("handler exploded"));
        assert_eq!(err.to_string(), "handler exploded");
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_cancelled_is_distinguished() {
        assert!(WorkflowError::Cancelled.is_cancelled());
        assert!(!WorkflowError::not_found("x").is_cancelled());
    }
}
