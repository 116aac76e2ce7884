//! Per-collection tolerance configuration.

use chrono::Duration;

use crate::error::Result;
use crate::storage::GapStore;
use crate::types::CollectionId;

/// Tolerance lookup keyed by (short name, version).
#[derive(Clone, Debug)]
pub struct ToleranceStore {
    store: GapStore,
    default_secs: u64,
}

impl ToleranceStore {
    /// Creates a tolerance store falling back to `default_secs`.
    pub fn new(store: GapStore, default_secs: u64) -> Self {
        Self {
            store,
            default_secs,
        }
    }

    /// Returns the configured tolerance, if any.
    pub async fn get(&self, id: &CollectionId) -> Result<Option<u64>> {
        self.store.get_tolerance(id).await
    }

    /// Sets the tolerance for a collection.
    pub async fn set(&self, id: &CollectionId, secs: u64) -> Result<()> {
        self.store.put_tolerance(id, secs).await?;
        tracing::info!(collection = %id.key(), tolerance_secs = secs, "tolerance set");
        Ok(())
    }

    /// Returns the configured tolerance or the system default, in seconds.
    pub async fn effective_secs(&self, id: &CollectionId) -> Result<u64> {
        Ok(self.get(id).await?.unwrap_or(self.default_secs))
    }

    /// Like [`effective_secs`](Self::effective_secs) as a duration.
    pub async fn effective(&self, id: &CollectionId) -> Result<Duration> {
        Ok(secs_to_duration(self.effective_secs(id).await?))
    }

    /// System default in seconds.
    pub fn default_secs(&self) -> u64 {
        self.default_secs
    }
}

/// Converts whole seconds to a duration, saturating at `i64::MAX` seconds.
pub fn secs_to_duration(secs: u64) -> Duration {
    Duration::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX)).unwrap_or(Duration::MAX)
}
