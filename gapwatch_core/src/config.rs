//! Configuration for a Gapwatch deployment.
//!
//! Every section has defaults, so an empty YAML document is a valid
//! configuration. A handful of environment variables override file values:
//!
//! - `GAPWATCH_DATABASE_PATH`
//! - `GAPWATCH_OBJECT_ROOT`
//! - `GAPWATCH_MAX_CONNECTIONS`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GapError, Result};
use crate::retry::RetryConfig;

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GapwatchConfig {
    /// Relational store settings
    pub database: DatabaseConfig,
    /// Durable object storage settings
    pub objects: ObjectConfig,
    /// Tolerance defaults
    pub tolerance: ToleranceDefaults,
    /// Gap query limits
    pub query: QueryConfig,
    /// Backfill routing and streaming
    pub backfill: BackfillConfig,
    /// Transaction retry policy
    pub retry: RetryConfig,
    /// Event queue delivery settings
    pub queue: QueueConfig,
    /// Periodic reporter settings
    pub reporter: ReporterConfig,
}

/// Relational store settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: PathBuf,
    /// Ceiling on simultaneously open connections
    pub max_connections: usize,
    /// How long a connection waits on a locked database, in milliseconds
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("gapwatch.db"),
            max_connections: 16,
            busy_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    /// Busy timeout as a duration.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Durable object storage settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectConfig {
    /// Root directory for stored objects
    pub root: PathBuf,
}

impl Default for ObjectConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("gapwatch-objects"),
        }
    }
}

/// Tolerance used when a collection has no configured entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToleranceDefaults {
    /// Default tolerance in seconds
    pub default_secs: u64,
}

/// Gap query limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Largest serialized result returned inline, in bytes
    pub max_response_bytes: usize,
    /// Largest number of gaps returned inline
    pub max_rows: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_response_bytes: 6 * 1024 * 1024,
            max_rows: 100_000,
        }
    }
}

/// Backfill routing and streaming settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Largest data-unit count processed synchronously
    pub interactive_ceiling: u64,
    /// Upper bound on concurrent catalog producers per job
    pub max_producers: usize,
    /// Consumers spawned per producer
    pub consumer_ratio: f64,
    /// Catalog page size
    pub page_size: usize,
    /// Pages a single producer is expected to fetch
    pub pages_per_producer: usize,
    /// Upper bound on in-flight units between producers and consumers
    pub max_queue_depth: usize,
    /// Jobs accepted before submission blocks
    pub max_pending_jobs: usize,
    /// Finished jobs kept for status lookups
    pub finished_job_retention: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            interactive_ceiling: 50_000,
            max_producers: 8,
            consumer_ratio: 1.5,
            page_size: 2_000,
            pages_per_producer: 10,
            max_queue_depth: 32_000,
            max_pending_jobs: 16,
            finished_job_retention: 256,
        }
    }
}

/// Event queue delivery settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Largest batch handed to a worker
    pub batch_size: usize,
    /// How long a receive waits to fill a batch, in milliseconds
    pub max_wait_ms: u64,
    /// Deliveries before a record is dead-lettered
    pub max_receives: u32,
    /// How long a received record stays hidden before it is redelivered, in
    /// milliseconds
    pub visibility_timeout_ms: u64,
    /// Messages a queue holds before senders wait
    pub capacity: usize,
    /// Workers per ingest queue
    pub workers: usize,
    /// Workers on the backfill queue
    pub backfill_workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_wait_ms: 500,
            max_receives: 3,
            visibility_timeout_ms: 30_000,
            capacity: 10_000,
            workers: 4,
            backfill_workers: 2,
        }
    }
}

impl QueueConfig {
    /// Batch window as a duration.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Visibility timeout as a duration.
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }
}

/// Periodic reporter settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// Seconds between report runs
    pub interval_secs: u64,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            interval_secs: 24 * 60 * 60,
        }
    }
}

impl ReporterConfig {
    /// Report interval as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl GapwatchConfig {
    /// Parses a YAML document, applies environment overrides and validates.
    pub fn from_yaml(source: &str) -> Result<Self> {
        let mut config: GapwatchConfig = if source.trim().is_empty() {
            GapwatchConfig::default()
        } else {
            serde_yaml::from_str(source)?
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&source)
    }

    /// Configuration rooted in `dir`: database and objects live inside it.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let mut config = GapwatchConfig::default();
        config.database.path = dir.join("gapwatch.db");
        config.objects.root = dir.join("objects");
        config
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("GAPWATCH_DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Ok(root) = std::env::var("GAPWATCH_OBJECT_ROOT") {
            self.objects.root = PathBuf::from(root);
        }
        if let Some(max) = std::env::var("GAPWATCH_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            self.database.max_connections = max;
        }
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.database.max_connections == 0 {
            return Err(GapError::validation("database.max_connections must be at least 1"));
        }
        if self.queue.batch_size == 0 {
            return Err(GapError::validation("queue.batch_size must be at least 1"));
        }
        if self.queue.max_receives == 0 {
            return Err(GapError::validation("queue.max_receives must be at least 1"));
        }
        if self.backfill.page_size == 0 || self.backfill.max_producers == 0 {
            return Err(GapError::validation(
                "backfill.page_size and backfill.max_producers must be at least 1",
            ));
        }
        if self.backfill.consumer_ratio <= 0.0 {
            return Err(GapError::validation("backfill.consumer_ratio must be positive"));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(GapError::validation("retry.backoff_factor must be at least 1.0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GapwatchConfig::default();
        assert_eq!(config.database.max_connections, 16);
        assert_eq!(config.query.max_response_bytes, 6 * 1024 * 1024);
        assert_eq!(config.tolerance.default_secs, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let config = GapwatchConfig::from_yaml(
            "tolerance:\n  default_secs: 3600\nbackfill:\n  interactive_ceiling: 10\n",
        )
        .unwrap();
        assert_eq!(config.tolerance.default_secs, 3600);
        assert_eq!(config.backfill.interactive_ceiling, 10);
        assert_eq!(config.backfill.page_size, 2_000);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = GapwatchConfig::from_yaml("queue:\n  batch_size: 0\n").unwrap_err();
        assert!(matches!(err, GapError::Validation(_)));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = GapwatchConfig::from_yaml("database: [").unwrap_err();
        assert!(matches!(err, GapError::Yaml(_)));
    }

    #[test]
    fn test_in_dir() {
        let config = GapwatchConfig::in_dir("/tmp/gw");
        assert_eq!(config.database.path, PathBuf::from("/tmp/gw/gapwatch.db"));
        assert_eq!(config.objects.root, PathBuf::from("/tmp/gw/objects"));
    }
}
