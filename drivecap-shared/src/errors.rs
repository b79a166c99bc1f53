//! Error types shared by every DriveCap crate.
//!
//! Errors are categorized by how the caller is expected to react:
//! - [`DrivecapError::InvalidRequest`]: rejected synchronously, never retried
//! - [`DrivecapError::Retryable`]: transient; the next scheduling cycle retries the same range
//! - [`DrivecapError::Uncorrectable`]: a chunk record could not be read back
//! - [`DrivecapError::MediaError`]: the device reported a defective lba
//!
//! Permission denial from the upstream consumer or the admission controller
//! is deliberately not represented here; it is a normal scheduling outcome.

use std::io;
use thiserror::Error;

/// Result alias used across DriveCap.
pub type DrivecapResult<T> = Result<T, DrivecapError>;

/// Errors that can occur while managing drive capacity.
#[derive(Debug, Error)]
pub enum DrivecapError {
    /// Request is malformed (e.g. unaligned user zero). Surfaced to the caller.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Transient device or metadata failure. The checkpoint was not advanced.
    #[error("retryable i/o failure: {0}")]
    Retryable(String),

    /// Chunk record could not be read.
    #[error("uncorrectable metadata: {0}")]
    Uncorrectable(String),

    /// Device reported a media defect at `lba`.
    #[error("media error at lba {lba:#x}")]
    MediaError { lba: u64 },

    /// Backing store failure (file I/O, serialization).
    #[error("storage: {0}")]
    Storage(String),

    /// Invalid drive configuration.
    #[error("config: {0}")]
    Config(String),

    /// Operation not allowed in the drive's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Internal invariant broken.
    #[error("internal: {0}")]
    Internal(String),
}

impl DrivecapError {
    /// Whether the failed operation may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DrivecapError::Retryable(_)
                | DrivecapError::Uncorrectable(_)
                | DrivecapError::MediaError { .. }
        )
    }

    /// Whether the error was caused by the request itself.
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, DrivecapError::InvalidRequest(_))
    }
}

impl From<io::Error> for DrivecapError {
    fn from(err: io::Error) -> Self {
        DrivecapError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for DrivecapError {
    fn from(err: serde_json::Error) -> Self {
        DrivecapError::Storage(format!("serialization: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DrivecapError::Retryable("busy".into()).is_retryable());
        assert!(DrivecapError::Uncorrectable("page 3".into()).is_retryable());
        assert!(DrivecapError::MediaError { lba: 7 }.is_retryable());
        assert!(!DrivecapError::InvalidRequest("unaligned".into()).is_retryable());
        assert!(!DrivecapError::Config("chunk size".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = DrivecapError::MediaError { lba: 0x800 };
        assert_eq!(err.to_string(), "media error at lba 0x800");

        let err = DrivecapError::InvalidRequest("lba 5 not aligned".into());
        assert_eq!(err.to_string(), "invalid request: lba 5 not aligned");
    }

    #[test]
    fn test_io_error_conversion() {
        let err: DrivecapError = io::Error::other("disk gone").into();
        assert!(matches!(err, DrivecapError::Storage(_)));
        assert!(err.to_string().contains("disk gone"));
    }
}
