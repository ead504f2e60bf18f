//! Error types for the transformation cache engine
//!
//! Every cache-layer failure is classified so callers know whether to fail
//! open (recompute from source), skip the current item of a batch, or abort
//! the current request.

use thiserror::Error;

/// Unified error type for the cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Cache Key Errors
    // =========================================================================
    #[error("Invalid cache duration: {value}")]
    InvalidDuration { value: String },

    #[error("Malformed cache key: {key}")]
    MalformedCacheKey { key: String },

    // =========================================================================
    // Metadata Store Errors
    // =========================================================================
    #[error("Metadata store unavailable: {0}")]
    MetadataStoreUnavailable(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    #[error("Storage I/O failed for {path}: {reason}")]
    StorageIo { path: String, reason: String },

    #[error("Source not found: {locator}")]
    SourceNotFound { locator: String },

    // =========================================================================
    // Transformation Errors
    // =========================================================================
    #[error("Transformation failed: {0}")]
    TransformationFailure(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a failure propagates through the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Degrade to a cache miss and recompute from source
    FailOpen,
    /// Log, skip the current file/row/entry, continue the batch
    SkipItem,
    /// Abort the current request and surface the error
    AbortRequest,
}

impl Error {
    /// Build a storage I/O error for a path
    pub fn storage_io(path: impl Into<String>, reason: impl ToString) -> Self {
        Error::StorageIo {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Determine how this error propagates
    pub fn disposition(&self) -> FailureDisposition {
        match self {
            // Cache-layer degradation - recompute
            Error::InvalidDuration { .. }
            | Error::MalformedCacheKey { .. }
            | Error::MetadataStoreUnavailable(_) => FailureDisposition::FailOpen,

            // Per-item failures inside batch operations
            Error::StorageIo { .. }
            | Error::Io(_)
            | Error::JsonParse(_) => FailureDisposition::SkipItem,

            // Current request cannot produce a result
            Error::TransformationFailure(_)
            | Error::SourceNotFound { .. }
            | Error::Configuration(_)
            | Error::YamlParse(_)
            | Error::Internal(_) => FailureDisposition::AbortRequest,
        }
    }

    /// Check if this error degrades to a cache miss
    pub fn is_fail_open(&self) -> bool {
        matches!(self.disposition(), FailureDisposition::FailOpen)
    }

    /// Check if this error must be surfaced to the caller
    pub fn is_fatal(&self) -> bool {
        matches!(self.disposition(), FailureDisposition::AbortRequest)
    }
}

/// Result type alias for the cache engine
pub type Result<T> = std::result::Result<T, Error>;
