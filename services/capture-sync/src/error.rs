use std::time::Duration;
use thiserror::Error;

/// Errors produced by the document store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backing storage could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// SQLite I/O error.
    #[error("Store I/O error: {0}")]
    Io(#[from] sqlx::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored document could not be encoded or decoded.
    #[error("Document serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Namespace names must be non-empty and must not contain the key separator.
    #[error("Invalid namespace {0:?}")]
    InvalidNamespace(String),
}

/// Reasons a record fails integrity validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("content hash is not 64 lowercase hex characters")]
    MalformedHash,

    #[error("proof-of-work not met: hash does not start with {prefix:?}")]
    ProofOfWorkUnmet { prefix: String },

    #[error("integrity signature mismatch")]
    SignatureMismatch,
}

/// Errors from a single delivery attempt. All of them are retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}")]
    Http { status: u16 },

    #[error("remote identifier missing from response")]
    RemoteIdentifierMissing,

    #[error("invalid response body: {0}")]
    InvalidResponse(String),
}

/// Errors raised while assembling a record.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Location or camera access was refused; only degrades a capture.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("location lookup failed: {0}")]
    Location(String),

    #[error("media capture failed: {0}")]
    Media(String),

    #[error("no nonce met difficulty {prefix:?} within {iterations} iterations")]
    ProofOfWork { prefix: String, iterations: u64 },

    #[error("content hash mining aborted: {0}")]
    Mining(String),
}

/// Convenience alias used by the store layer.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_failure_messages() {
        let missing = ValidationFailure::MissingFields(vec!["subject_label", "content_hash"]);
        assert_eq!(
            missing.to_string(),
            "missing required fields: subject_label, content_hash"
        );

        let pow = ValidationFailure::ProofOfWorkUnmet {
            prefix: "00".to_string(),
        };
        assert!(pow.to_string().contains("\"00\""));
    }

    #[test]
    fn test_delivery_error_messages() {
        assert_eq!(DeliveryError::Http { status: 503 }.to_string(), "HTTP 503");
        assert_eq!(
            DeliveryError::RemoteIdentifierMissing.to_string(),
            "remote identifier missing from response"
        );
    }
}
