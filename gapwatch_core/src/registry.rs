//! Collection registry and backfill initializer.
//!
//! `configure` registers collections, records their tolerance and seeds gap
//! state from the catalog. Small collections are backfilled synchronously
//! through the update engine. Collections whose unit count exceeds the
//! interactive ceiling are handed to a [`JobSink`] as a [`BackfillJob`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::config::BackfillConfig;
use crate::engine::UpdateEngine;
use crate::error::{GapError, Result};
use crate::ranges::{is_open_end, TimeRange};
use crate::storage::GapStore;
use crate::tolerance::ToleranceStore;
use crate::types::{Collection, CollectionId};

/// A collection named in a configure request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    /// Collection identity
    pub id: CollectionId,
    /// Tolerance to record, in seconds
    pub tolerance_secs: Option<u64>,
}

/// Backfill behavior for a configure request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackfillMode {
    /// Backfill newly registered collections only.
    #[default]
    Default,
    /// Reset and backfill existing collections too.
    Force,
    /// Register without backfilling.
    Skip,
}

/// A configure request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigureRequest {
    /// Collections to configure
    pub collections: Vec<CollectionSpec>,
    /// Backfill behavior
    pub backfill: BackfillMode,
}

/// What happened to a collection's backfill.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackfillStatus {
    /// Applied synchronously.
    Completed {
        /// Units applied
        units: u64,
    },
    /// Queued for asynchronous streaming.
    Deferred {
        /// Job handle
        job_id: Uuid,
        /// Units to stream
        units: u64,
    },
    /// The collection already existed and no force flag was given.
    Skipped,
    /// The request asked for no backfill.
    NotRequested,
}

/// Per-collection result of `configure`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureOutcome {
    /// Collection key
    pub collection: String,
    /// Whether the collection was newly registered
    pub registered: bool,
    /// Tolerance recorded, if any
    pub tolerance_secs: Option<u64>,
    /// Backfill result
    pub backfill: BackfillStatus,
}

/// Resource plan for an asynchronous backfill.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillPlan {
    /// Estimated unit count
    pub units: u64,
    /// Concurrent catalog readers, one per window
    pub producers: usize,
    /// Concurrent batch senders
    pub consumers: usize,
    /// Bound on in-flight units
    pub queue_depth: usize,
    /// Catalog page size
    pub page_size: usize,
    /// Equal sub-ranges of the extent, one per producer
    pub windows: Vec<TimeRange>,
}

impl BackfillPlan {
    /// Sizes a backfill for `units` data units over `extent`.
    ///
    /// One producer per `page_size × pages_per_producer` units, clamped to
    /// `[1, max_producers]`; `consumer_ratio` consumers per producer; two
    /// pages of buffer per producer, capped at `max_queue_depth`.
    pub fn compute(units: u64, extent: &TimeRange, config: &BackfillConfig) -> Self {
        let per_producer = (config.page_size.max(1) * config.pages_per_producer.max(1)) as f64;
        let max_producers = config.max_producers.max(1) as f64;
        let producers = (units as f64 / per_producer).min(max_producers).max(1.0).round() as usize;
        let consumers = ((producers as f64 * config.consumer_ratio).round() as usize).max(1);
        let queue_depth = (producers * 2 * config.page_size)
            .min(config.max_queue_depth)
            .max(1);

        let window = if is_open_end(extent.end) {
            let now = Utc::now();
            TimeRange {
                start: extent.start,
                end: if now > extent.start { now } else { extent.end },
            }
        } else {
            *extent
        };

        Self {
            units,
            producers,
            consumers,
            queue_depth,
            page_size: config.page_size,
            windows: split_windows(&window, producers),
        }
    }
}

/// Splits `range` into `parts` contiguous sub-ranges of equal length.
///
/// The last sub-range ends exactly at `range.end`.
pub fn split_windows(range: &TimeRange, parts: usize) -> Vec<TimeRange> {
    let parts = parts.max(1);
    let total = range.duration();
    let step = total / i32::try_from(parts).unwrap_or(i32::MAX);

    let mut windows = Vec::with_capacity(parts);
    let mut start = range.start;
    for i in 0..parts {
        let end = if i + 1 == parts {
            range.end
        } else {
            start + step
        };
        if start < end {
            windows.push(TimeRange { start, end });
        }
        start = end;
    }
    windows
}

/// An asynchronous backfill job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillJob {
    /// Job handle
    pub job_id: Uuid,
    /// Collection to backfill
    pub collection: CollectionId,
    /// Resource plan
    pub plan: BackfillPlan,
}

/// Destination for asynchronous backfill jobs.
#[async_trait]
pub trait JobSink: Send + Sync {
    /// Accepts a job for background execution.
    async fn submit(&self, job: BackfillJob) -> Result<()>;
}

/// Collection registry.
#[derive(Clone)]
pub struct Registry {
    store: GapStore,
    engine: UpdateEngine,
    tolerances: ToleranceStore,
    catalog: Arc<dyn Catalog>,
    jobs: Option<Arc<dyn JobSink>>,
    config: BackfillConfig,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("async_backfill", &self.jobs.is_some())
            .finish()
    }
}

impl Registry {
    /// Creates a registry without an asynchronous backfill path.
    pub fn new(
        store: GapStore,
        engine: UpdateEngine,
        tolerances: ToleranceStore,
        catalog: Arc<dyn Catalog>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            store,
            engine,
            tolerances,
            catalog,
            jobs: None,
            config,
        }
    }

    /// Routes oversized backfills to `jobs`.
    pub fn with_job_sink(mut self, jobs: Arc<dyn JobSink>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Registers collections, records tolerances and runs backfills.
    ///
    /// Tolerances are written even for collections that already exist.
    /// Processing stops at the first failing collection.
    pub async fn configure(&self, request: &ConfigureRequest) -> Result<Vec<ConfigureOutcome>> {
        let mut outcomes = Vec::with_capacity(request.collections.len());
        for spec in &request.collections {
            outcomes.push(self.configure_one(spec, request.backfill).await?);
        }
        Ok(outcomes)
    }

    async fn configure_one(&self, spec: &CollectionSpec, mode: BackfillMode) -> Result<ConfigureOutcome> {
        let id = &spec.id;
        if let Some(secs) = spec.tolerance_secs {
            self.tolerances.set(id, secs).await?;
        }

        let existing = self.store.load_collection(id).await?;
        let (registered, backfill) = match (existing, mode) {
            (None, _) => {
                let collection = self.catalog_collection(id).await?;
                let created = self.store.register(&collection).await?;
                tracing::info!(collection = %id.key(), extent = %collection.extent(), "collection registered");
                let backfill = if mode == BackfillMode::Skip {
                    BackfillStatus::NotRequested
                } else {
                    self.backfill(&collection).await?
                };
                (created, backfill)
            }
            (Some(_), BackfillMode::Force) => {
                let collection = self.catalog_collection(id).await?;
                tracing::info!(collection = %id.key(), "force backfill of existing collection");
                self.store.reseed(&collection).await?;
                (false, self.backfill(&collection).await?)
            }
            (Some(_), _) => {
                tracing::info!(collection = %id.key(), "collection already registered, skipping backfill");
                (false, BackfillStatus::Skipped)
            }
        };

        Ok(ConfigureOutcome {
            collection: id.key(),
            registered,
            tolerance_secs: spec.tolerance_secs,
            backfill,
        })
    }

    async fn catalog_collection(&self, id: &CollectionId) -> Result<Collection> {
        self.catalog
            .collection(id)
            .await?
            .ok_or_else(|| GapError::NotFound(format!("{} not found in catalog", id.key())))
    }

    /// Backfills synchronously when small enough, else submits a job.
    async fn backfill(&self, collection: &Collection) -> Result<BackfillStatus> {
        let units = self.catalog.unit_count(&collection.id).await?;
        if units <= self.config.interactive_ceiling {
            let applied = self.backfill_sync(collection).await?;
            return Ok(BackfillStatus::Completed { units: applied });
        }

        let jobs = self.jobs.as_ref().ok_or_else(|| GapError::BackfillTooLarge {
            collection: collection.id.key(),
            units,
            ceiling: self.config.interactive_ceiling,
        })?;
        let job = BackfillJob {
            job_id: Uuid::new_v4(),
            collection: collection.id.clone(),
            plan: BackfillPlan::compute(units, &collection.extent(), &self.config),
        };
        let job_id = job.job_id;
        tracing::info!(
            collection = %collection.id.key(),
            %job_id,
            units,
            producers = job.plan.producers,
            consumers = job.plan.consumers,
            "backfill deferred"
        );
        jobs.submit(job).await?;
        Ok(BackfillStatus::Deferred { job_id, units })
    }

    /// Applies every catalog unit of `collection` through the update engine.
    ///
    /// # Errors
    ///
    /// - [`GapError::BackfillTooLarge`] if the unit count exceeds the
    ///   interactive ceiling
    /// - [`GapError::PartialBatch`] if some units could not be applied
    pub async fn backfill_sync(&self, collection: &Collection) -> Result<u64> {
        let id = &collection.id;
        let units = self.catalog.unit_count(id).await?;
        if units > self.config.interactive_ceiling {
            return Err(GapError::BackfillTooLarge {
                collection: id.key(),
                units,
                ceiling: self.config.interactive_ceiling,
            });
        }

        let window = collection.extent();
        let mut cursor = None;
        let mut applied = 0u64;
        loop {
            let page = self
                .catalog
                .units_page(id, &window, cursor, self.config.page_size)
                .await?;
            if page.units.is_empty() {
                break;
            }

            let records = page.units.iter().map(|u| u.to_record(id)).collect::<Vec<_>>();
            let outcome = self.engine.apply_batch(records).await?;
            if !outcome.is_complete() {
                return Err(GapError::PartialBatch {
                    failed: outcome.failures.len(),
                    total: outcome.total,
                });
            }
            applied += outcome.applied as u64;

            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        tracing::info!(collection = %id.key(), units = applied, "backfill completed");
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranges::parse_timestamp;

    fn r(a: &str, b: &str) -> TimeRange {
        TimeRange::new(parse_timestamp(a).unwrap(), parse_timestamp(b).unwrap()).unwrap()
    }

    #[test]
    fn test_plan_small_collection_gets_one_producer() {
        let plan = BackfillPlan::compute(500, &r("2020-01-01", "2021-01-01"), &BackfillConfig::default());
        assert_eq!(plan.producers, 1);
        assert_eq!(plan.consumers, 2);
        assert_eq!(plan.queue_depth, 4_000);
        assert_eq!(plan.windows, vec![r("2020-01-01", "2021-01-01")]);
    }

    #[test]
    fn test_plan_scales_and_caps_producers() {
        let config = BackfillConfig::default();
        let plan = BackfillPlan::compute(100_000, &r("2020-01-01", "2020-01-06"), &config);
        assert_eq!(plan.producers, 5);
        assert_eq!(plan.consumers, 8);
        assert_eq!(plan.windows.len(), 5);
        assert_eq!(plan.windows[1], r("2020-01-02", "2020-01-03"));

        let huge = BackfillPlan::compute(10_000_000, &r("2020-01-01", "2020-01-09"), &config);
        assert_eq!(huge.producers, 8);
        assert_eq!(huge.consumers, 12);
        assert_eq!(huge.queue_depth, 32_000);
    }

    #[test]
    fn test_split_windows_cover_range() {
        let range = r("2020-01-01T00:00:00Z", "2020-01-01T00:00:10Z");
        let windows = split_windows(&range, 3);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].start, range.start);
        assert_eq!(windows[2].end, range.end);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_backfill_status_wire_format() {
        let json = serde_json::to_value(BackfillStatus::Completed { units: 3 }).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["units"], 3);
    }
}
