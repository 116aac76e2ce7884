//! Error types for the runtime layer.

use gapwatch_core::GapError;

/// Errors raised by queues, workers and background jobs.
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    /// Error from the core layer.
    #[error(transparent)]
    Core(#[from] GapError),

    /// The queue no longer accepts messages.
    #[error("Queue {0} is closed")]
    QueueClosed(String),

    /// Too many asynchronous backfills are already in flight.
    #[error("Backfill capacity exhausted: {0} jobs pending")]
    JobCapacity(usize),

    /// A background task panicked or was aborted.
    #[error("Task failed: {0}")]
    Task(String),
}

impl RuntimeError {
    /// Converts into the core error type for seams defined by the core crate.
    pub fn into_core(self) -> GapError {
        match self {
            RuntimeError::Core(err) => err,
            other => GapError::DownstreamUnavailable(other.to_string()),
        }
    }
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_passes_through() {
        let err = RuntimeError::from(GapError::NotFound("x".into()));
        assert_eq!(err.to_string(), "Not found: x");
        assert!(matches!(err.into_core(), GapError::NotFound(_)));
    }

    #[test]
    fn test_runtime_errors_become_downstream() {
        let err = RuntimeError::QueueClosed("ingest".into()).into_core();
        assert!(matches!(err, GapError::DownstreamUnavailable(_)));
        assert!(err.is_retryable());
    }
}
