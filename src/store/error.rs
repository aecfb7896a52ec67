//! Error types for file store operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while mutating or reading the shared store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The declared content type is not on the upload allow-list.
    #[error("file type not allowed: {content_type}")]
    UnsupportedType { content_type: String },

    /// No stored file has the given storage name.
    #[error("file not found: {storage_name}")]
    NotFound { storage_name: String },

    /// The upload exceeded the configured per-file ceiling.
    #[error("file exceeds the {limit} byte upload limit")]
    PayloadTooLarge { limit: u64 },

    /// The underlying filesystem failed.
    #[error("{action} failed for {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Create an unsupported type error.
    pub fn unsupported_type(content_type: impl Into<String>) -> Self {
        Self::UnsupportedType {
            content_type: content_type.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(storage_name: impl Into<String>) -> Self {
        Self::NotFound {
            storage_name: storage_name.into(),
        }
    }

    /// Create a payload too large error.
    pub fn payload_too_large(limit: u64) -> Self {
        Self::PayloadTooLarge { limit }
    }

    /// Create an IO error.
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }

    /// Stable machine-readable tag for the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedType { .. } => "unsupported_type",
            Self::NotFound { .. } => "not_found",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Io { .. } => "io_failure",
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
