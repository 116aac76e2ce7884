//! Error types for Gapwatch.

use rusqlite::ErrorCode;

/// Main error type for Gapwatch.
///
/// All core operations return `Result<T> = std::result::Result<T, GapError>`.
#[derive(thiserror::Error, Debug)]
pub enum GapError {
    /// Request payload or parameters failed validation. Nothing was written.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The collection has no registry entry.
    #[error("Collection {0} has not been initialized for gap detection")]
    NotRegistered(String),

    /// A looked-up record or object does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another writer committed to the same collection first.
    #[error("Concurrent update conflict on {0}")]
    ConcurrencyConflict(String),

    /// The store, object storage or a queue could not be reached.
    #[error("Downstream unavailable: {0}")]
    DownstreamUnavailable(String),

    /// Synchronous backfill refused; the collection must go through the
    /// asynchronous path.
    #[error("Backfill of {collection} exceeds interactive ceiling: {units} units > {ceiling}")]
    BackfillTooLarge {
        /// Collection key
        collection: String,
        /// Estimated data-unit count
        units: u64,
        /// Configured ceiling
        ceiling: u64,
    },

    /// Some records of a batch could not be applied.
    #[error("{failed} of {total} records could not be applied")]
    PartialBatch {
        /// Number of failed records
        failed: usize,
        /// Number of records in the batch
        total: usize,
    },

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl GapError {
    /// Shorthand for a [`GapError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        GapError::Validation(message.into())
    }

    /// Returns true if repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GapError::ConcurrencyConflict(_) | GapError::DownstreamUnavailable(_)
        )
    }
}

impl From<rusqlite::Error> for GapError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    GapError::ConcurrencyConflict(err.to_string())
                }
                ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase
                | ErrorCode::PermissionDenied => GapError::DownstreamUnavailable(err.to_string()),
                ErrorCode::ConstraintViolation => GapError::Validation(err.to_string()),
                _ => GapError::Database(err.to_string()),
            },
            _ => GapError::Database(err.to_string()),
        }
    }
}

/// Type alias for Result with GapError.
pub type Result<T> = std::result::Result<T, GapError>;
