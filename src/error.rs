//! Error types for the acquisition client.
//!
//! `ScopeError` is the single error type surfaced by every layer of the crate.
//! Socket-level failures are converted at the device boundary, so callers above
//! [`crate::device`] only ever see the categories below:
//!
//! - **Connectivity** (`Connection`, `Timeout`, `ReconnectExhausted`, `Closed`,
//!   `MalformedResponse`): the link to the hardware server is unusable. The
//!   connection recovers from these by reconnecting in the background.
//! - **Hardware fault** (`HardwareFault`): the server answered, but the instrument
//!   behind it is not operable. The link stays up and nothing is retried.
//! - **Acquisition** (`AcquisitionFailed`): the server reported a failed job, with
//!   its diagnostic text preserved verbatim.
//! - **Configuration** (`Configuration`, `Validation`, `Config`): a profile could
//!   not be resolved or the inputs are inconsistent.
//! - **Stitching** (`Stitching`): composition of one job failed.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ScopeResult<T> = std::result::Result<T, ScopeError>;

/// Coarse classification used for notification and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// TCP connect/read/write failure or protocol desynchronization.
    Connectivity,
    /// Server-reported instrument fault.
    HardwareFault,
    /// Server-reported acquisition failure.
    Acquisition,
    /// Unresolvable profile or invalid inputs.
    Configuration,
    /// Composition failure for one stitch job.
    Stitching,
    /// Local I/O or programming errors.
    Internal,
}

/// Errors produced by the device client, acquisition session and pipeline.
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum ScopeError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out after {after:?} waiting for {operation}")]
    Timeout { operation: String, after: Duration },

    #[error("Connection unavailable: reconnection gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Connection has been closed")]
    Closed,

    #[error("Hardware fault: {0}")]
    HardwareFault(String),

    #[error("Malformed response to '{command}': expected {expected} bytes, got {actual}")]
    MalformedResponse {
        command: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid command word {0:?}: must be exactly 8 ASCII bytes")]
    InvalidCommandWord(String),

    #[error("Acquisition failed: {0}")]
    AcquisitionFailed(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Stitching error: {0}")]
    Stitching(String),

    #[error("Configuration file error: {0}")]
    Config(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScopeError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_)
            | Self::Timeout { .. }
            | Self::ReconnectExhausted { .. }
            | Self::Closed
            | Self::MalformedResponse { .. } => ErrorKind::Connectivity,
            Self::HardwareFault(_) => ErrorKind::HardwareFault,
            Self::AcquisitionFailed(_) => ErrorKind::Acquisition,
            Self::Configuration(_) | Self::Validation(_) | Self::Config(_) => {
                ErrorKind::Configuration
            }
            Self::Stitching(_) => ErrorKind::Stitching,
            Self::InvalidCommandWord(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether the connection should try to recover from this error by
    /// reconnecting.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout { .. } | Self::MalformedResponse { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_fault_is_not_retriable() {
        let err = ScopeError::HardwareFault("stage not loaded".into());
        assert_eq!(err.kind(), ErrorKind::HardwareFault);
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_connectivity_errors_are_retriable() {
        let timeout = ScopeError::Timeout {
            operation: "getxy___".into(),
            after: Duration::from_secs(5),
        };
        assert_eq!(timeout.kind(), ErrorKind::Connectivity);
        assert!(timeout.is_retriable());

        let exhausted = ScopeError::ReconnectExhausted { attempts: 3 };
        assert_eq!(exhausted.kind(), ErrorKind::Connectivity);
        assert!(!exhausted.is_retriable());
    }

    #[test]
    fn test_malformed_response_message_names_command_and_sizes() {
        let err = ScopeError::MalformedResponse {
            command: "getxy___".into(),
            expected: 8,
            actual: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("getxy___"));
        assert!(msg.contains("expected 8"));
        assert!(msg.contains("got 3"));
    }
}
