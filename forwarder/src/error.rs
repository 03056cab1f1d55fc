//! Error types for SIIRTO
//!
//! Each stage of a forwarding cycle has its own error enum. A cycle that hits
//! one of them aborts and the next tick retries; only a transaction driven out
//! of order stops the run loop.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::transport::TransactionState;

/// Result type alias for SIIRTO operations
pub type Result<T> = std::result::Result<T, SiirtoError>;

/// Main error type for SIIRTO
#[derive(Error, Debug)]
pub enum SiirtoError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Offset persistence failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Source could not deliver the next batch
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Downstream delivery failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Intake queue refused an item
    #[error(transparent)]
    Intake(#[from] IntakeError),

    /// Wire encoding error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl SiirtoError {
    /// Whether the error must stop the run loop instead of being retried on the next tick
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SiirtoError::Transport(TransportError::OutOfOrder { .. })
        )
    }

    /// Short label used for log fields and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            SiirtoError::Config(_) => "config",
            SiirtoError::Storage(_) => "storage",
            SiirtoError::Fetch(_) => "fetch",
            SiirtoError::Transport(_) => "transport",
            SiirtoError::Intake(_) => "intake",
            SiirtoError::Serialization(_) => "serialization",
            SiirtoError::Metrics(_) => "metrics",
        }
    }
}

/// Offset file errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Reading or writing the offset file failed
    #[error("offset file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The offset file does not hold a decimal sequence id
    #[error("offset file {path} is corrupt: {value:?}")]
    Corrupt { path: PathBuf, value: String },
}

/// Errors from a record source
#[derive(Error, Debug)]
pub enum FetchError {
    /// IO error reading the source
    #[error("source IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A journal line could not be decoded
    #[error("malformed record on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Records are not strictly increasing
    #[error("records out of order: {found} follows {previous}")]
    OutOfOrder { previous: u64, found: u64 },

    /// A record precedes the requested position
    #[error("record {found} precedes requested offset {after}")]
    BeforeOffset { after: u64, found: u64 },

    /// Source returned more records than were asked for
    #[error("batch of {found} records exceeds limit {limit}")]
    BatchTooLarge { limit: usize, found: usize },

    /// Source is not reachable
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the downstream transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// Could not build or reach the client
    #[error("connection error: {0}")]
    Connection(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote answered with an unexpected status
    #[error("remote rejected {operation} with {status}: {message}")]
    Rejected {
        operation: &'static str,
        status: u16,
        message: String,
    },

    /// Step did not finish within the communications timeout
    #[error("transaction timed out after {0:?}")]
    Timeout(Duration),

    /// Transaction steps called in the wrong order
    #[error("transaction cannot move from {from:?} to {to:?}")]
    OutOfOrder {
        from: TransactionState,
        to: TransactionState,
    },

    /// Attributes could not be carried in the request
    #[error("invalid transaction attributes: {0}")]
    InvalidAttributes(String),

    /// Direction not offered by this transport
    #[error("unsupported transfer direction: {0}")]
    Unsupported(String),

    /// Local IO error, e.g. compressing the payload
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the intake queue
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntakeError {
    /// Queue at capacity under the reject policy
    #[error("intake queue full (capacity {capacity})")]
    Full { capacity: usize },

    /// Queue was closed for shutdown
    #[error("intake queue closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_to_siirto_error() {
        let err = StorageError::Corrupt {
            path: PathBuf::from("/tmp/state"),
            value: "abc".to_string(),
        };
        let err: SiirtoError = err.into();
        assert!(matches!(err, SiirtoError::Storage(_)));
        assert_eq!(err.kind(), "storage");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_out_of_order_transaction_is_fatal() {
        let err: SiirtoError = TransportError::OutOfOrder {
            from: TransactionState::Created,
            to: TransactionState::Completed,
        }
        .into();
        assert!(err.is_fatal());
        assert_eq!(err.kind(), "transport");
    }

    #[test]
    fn test_rejected_message() {
        let err = TransportError::Rejected {
            operation: "confirm",
            status: 409,
            message: "checksum mismatch".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "remote rejected confirm with 409: checksum mismatch"
        );
    }
}
