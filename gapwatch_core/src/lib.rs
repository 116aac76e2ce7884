//! Gapwatch - incremental time-gap tracking for versioned data collections
//!
//! This crate maintains, per registered collection, the set of time ranges
//! inside the collection's temporal extent for which no data exists.
//!
//! # Overview
//!
//! - **Registry**: registers collections, seeds a full-span gap and runs
//!   the initial backfill from the catalog
//! - **Update engine**: applies data-added and data-removed events as
//!   interval subtraction and insertion under concurrency
//! - **Known gaps**: operator annotations explaining expected gaps
//! - **Queries**: tolerance-merged gap listings with annotation handling
//! - **Reporter**: periodic per-collection completeness reports
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gapwatch_core::{Gapwatch, GapwatchConfig, GapQuery, CollectionId};
//! use gapwatch_core::catalog::StaticCatalog;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GapwatchConfig::in_dir("./gapwatch-data");
//!     let gapwatch = Gapwatch::open(config, Arc::new(StaticCatalog::new())).await?;
//!
//!     let id = CollectionId::new("ATL03", "006")?;
//!     let result = gapwatch.queries().query(&GapQuery::new(id)).await?;
//!     println!("{:?}", result);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`types`]: collection ids, event records, gap rows
//! - [`ranges`]: half-open time ranges and range sets
//! - [`error`]: error type for all operations
//! - [`config`]: YAML configuration with environment overrides
//! - [`pool`]: bounded SQLite connection pool
//! - [`storage`]: relational store for collections, gaps, reasons, tolerances
//! - [`engine`]: concurrent gap update engine
//! - [`registry`]: collection registration and backfill planning
//! - [`known_gap`]: known-gap annotation store
//! - [`tolerance`]: per-collection tolerance lookup
//! - [`query`]: gap query service
//! - [`report`]: completeness reporter
//! - [`objects`]: object storage for oversized payloads
//! - [`catalog`]: collection catalog seam
//! - [`retry`]: retry with exponential backoff

pub mod error;
pub mod types;
pub mod ranges;
pub mod config;
pub mod retry;

pub mod pool;
pub mod storage;
pub mod objects;
pub mod catalog;

pub mod engine;
pub mod registry;
pub mod known_gap;
pub mod tolerance;
pub mod query;
pub mod report;

pub use config::GapwatchConfig;
pub use engine::{BatchOutcome, UpdateEngine};
pub use error::{GapError, Result};
pub use query::{GapQuery, GapQueryService, KnownGapMode, QueryResult, ToleranceMode};
pub use ranges::{RangeSet, TimeRange};
pub use registry::{BackfillJob, ConfigureRequest, JobSink, Registry};
pub use report::{LatestReport, Reporter};
pub use storage::{BootstrapOutcome, GapStore};
pub use types::{Collection, CollectionId, EventKind, EventRecord};

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;

use catalog::Catalog;
use known_gap::KnownGapStore;
use objects::{FsObjectStore, ObjectStore};
use pool::ConnectionPool;
use tolerance::ToleranceStore;

/// Main entry point: every service wired over one store.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use gapwatch_core::{Gapwatch, GapwatchConfig};
/// use gapwatch_core::catalog::StaticCatalog;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let gapwatch = Gapwatch::open(
///         GapwatchConfig::load("gapwatch.yaml")?,
///         Arc::new(StaticCatalog::new()),
///     )
///     .await?;
///
///     let _engine = gapwatch.engine();
///     let _reporter = gapwatch.reporter();
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Gapwatch {
    config: GapwatchConfig,
    store: GapStore,
    objects: Arc<dyn ObjectStore>,
    catalog: Arc<dyn Catalog>,
    jobs: Option<Arc<dyn JobSink>>,
}

impl std::fmt::Debug for Gapwatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gapwatch")
            .field("database", &self.config.database.path)
            .field("async_backfill", &self.jobs.is_some())
            .finish()
    }
}

impl Gapwatch {
    /// Opens the store described by `config` and bootstraps its schema.
    ///
    /// # Arguments
    ///
    /// * `config` - Service configuration
    /// * `catalog` - Source of collection extents and data units
    ///
    /// # Returns
    ///
    /// A `Gapwatch` instance with objects stored under `config.objects.root`.
    pub async fn open(config: GapwatchConfig, catalog: Arc<dyn Catalog>) -> anyhow::Result<Self> {
        GapwatchBuilder::new().config(config).catalog(catalog).build().await
    }

    /// Returns the configuration.
    pub fn config(&self) -> &GapwatchConfig {
        &self.config
    }

    /// Returns the relational store.
    pub fn store(&self) -> &GapStore {
        &self.store
    }

    /// Returns the object store.
    pub fn objects(&self) -> Arc<dyn ObjectStore> {
        self.objects.clone()
    }

    /// Returns the catalog.
    pub fn catalog(&self) -> Arc<dyn Catalog> {
        self.catalog.clone()
    }

    /// Returns the gap update engine.
    pub fn engine(&self) -> UpdateEngine {
        UpdateEngine::new(self.store.clone(), self.config.retry.clone())
    }

    /// Returns the tolerance store.
    pub fn tolerances(&self) -> ToleranceStore {
        ToleranceStore::new(self.store.clone(), self.config.tolerance.default_secs)
    }

    /// Returns the known-gap annotation store.
    pub fn known_gaps(&self) -> KnownGapStore {
        KnownGapStore::new(self.store.clone())
    }

    /// Returns the gap query service.
    pub fn queries(&self) -> GapQueryService {
        GapQueryService::new(
            self.store.clone(),
            self.tolerances(),
            self.objects.clone(),
            self.config.query.clone(),
        )
    }

    /// Returns the completeness reporter.
    pub fn reporter(&self) -> Reporter {
        Reporter::new(
            self.store.clone(),
            self.tolerances(),
            self.objects.clone(),
            self.config.query.max_response_bytes,
        )
    }

    /// Returns the collection registry.
    ///
    /// Oversized backfills are deferred to the job sink when one is set.
    pub fn registry(&self) -> Registry {
        let registry = Registry::new(
            self.store.clone(),
            self.engine(),
            self.tolerances(),
            self.catalog.clone(),
            self.config.backfill.clone(),
        );
        match &self.jobs {
            Some(jobs) => registry.with_job_sink(jobs.clone()),
            None => registry,
        }
    }

    /// Returns a copy that defers oversized backfills to `jobs`.
    pub fn with_job_sink(&self, jobs: Arc<dyn JobSink>) -> Self {
        let mut gapwatch = self.clone();
        gapwatch.jobs = Some(jobs);
        gapwatch
    }
}

/// Builder for configuring and creating a Gapwatch instance.
#[derive(Clone, Default)]
pub struct GapwatchBuilder {
    config: Option<GapwatchConfig>,
    database_path: Option<PathBuf>,
    catalog: Option<Arc<dyn Catalog>>,
    objects: Option<Arc<dyn ObjectStore>>,
    jobs: Option<Arc<dyn JobSink>>,
}

impl GapwatchBuilder {
    /// Creates a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration.
    pub fn config(mut self, config: GapwatchConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Overrides the database path from the configuration.
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the collection catalog.
    pub fn catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Uses `objects` instead of a filesystem store.
    pub fn objects(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    /// Defers oversized backfills to `jobs`.
    pub fn job_sink(mut self, jobs: Arc<dyn JobSink>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Builds the instance, bootstrapping the schema.
    pub async fn build(self) -> anyhow::Result<Gapwatch> {
        let catalog = self.catalog.ok_or_else(|| anyhow!("catalog is required"))?;
        let mut config = self.config.unwrap_or_default();
        if let Some(path) = self.database_path {
            config.database.path = path;
        }
        config.validate()?;

        let pool = ConnectionPool::new(&config.database.path, config.database.max_connections)
            .with_busy_timeout(config.database.busy_timeout());
        let store = GapStore::new(pool);
        store.bootstrap().await?;

        let objects: Arc<dyn ObjectStore> = match self.objects {
            Some(objects) => objects,
            None => Arc::new(FsObjectStore::new(&config.objects.root)),
        };

        tracing::info!(
            database = %config.database.path.display(),
            max_connections = config.database.max_connections,
            "gapwatch opened"
        );
        Ok(Gapwatch {
            config,
            store,
            objects,
            catalog,
            jobs: self.jobs,
        })
    }
}
