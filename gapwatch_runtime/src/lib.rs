//! Gapwatch runtime layer - event queues, ingest workers, scheduled reports
//! and backfill streaming.
//!
//! This crate runs the core services continuously:
//!
//! - At-least-once event queues with redelivery and dead-lettering
//! - Worker pools applying data-added and data-removed batches
//! - An interval timer driving the completeness reporter
//! - Asynchronous backfill jobs for collections too large to backfill inline
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gapwatch_core::{Gapwatch, GapwatchConfig};
//! use gapwatch_core::catalog::StaticCatalog;
//! use gapwatch_runtime::GapRuntime;
//! use gapwatch_runtime::queue::EventSink;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let gapwatch = Gapwatch::open(GapwatchConfig::load("gapwatch.yaml")?, Arc::new(StaticCatalog::new())).await?;
//! let runtime = GapRuntime::start(gapwatch);
//!
//! runtime.data_added().send(vec![]).await?;
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backfill;
pub mod cancel;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use error::{Result, RuntimeError};

use std::sync::Arc;

use gapwatch_core::{Gapwatch, Registry};
use tokio::task::JoinHandle;

use backfill::BackfillStreamer;
use cancel::CancellationTokenSource;
use metrics::{MetricsSummary, RuntimeMetrics};
use queue::{DeadLetter, MemoryQueue};
use scheduler::ReportScheduler;
use worker::{WorkerPool, WorkerSettings};

/// Queue carrying data-added events.
pub const DATA_ADDED_QUEUE: &str = "data-added";
/// Queue carrying data-removed events.
pub const DATA_REMOVED_QUEUE: &str = "data-removed";
/// Queue carrying backfill records.
pub const BACKFILL_QUEUE: &str = "backfill";

/// Running gap-tracking service.
pub struct GapRuntime {
    gapwatch: Gapwatch,
    data_added: Arc<MemoryQueue>,
    data_removed: Arc<MemoryQueue>,
    backfill: Arc<MemoryQueue>,
    streamer: BackfillStreamer,
    metrics: RuntimeMetrics,
    shutdown: CancellationTokenSource,
    pools: Vec<WorkerPool>,
    scheduler: JoinHandle<()>,
}

impl std::fmt::Debug for GapRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GapRuntime")
            .field("gapwatch", &self.gapwatch)
            .field("pools", &self.pools.len())
            .finish()
    }
}

impl GapRuntime {
    /// Starts queues, worker pools, the report scheduler and the backfill
    /// streamer for `gapwatch`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(gapwatch: Gapwatch) -> Self {
        let config = gapwatch.config().clone();
        let metrics = RuntimeMetrics::new();
        let shutdown = CancellationTokenSource::new();

        let data_added = Arc::new(MemoryQueue::new(DATA_ADDED_QUEUE, &config.queue));
        let data_removed = Arc::new(MemoryQueue::new(DATA_REMOVED_QUEUE, &config.queue));
        let backfill = Arc::new(MemoryQueue::new(BACKFILL_QUEUE, &config.queue));

        let streamer = BackfillStreamer::new(
            gapwatch.catalog(),
            backfill.clone(),
            config.queue.batch_size,
            config.backfill.max_pending_jobs,
            metrics.clone(),
            shutdown.token(),
        )
        .with_retention(config.backfill.finished_job_retention);
        let gapwatch = gapwatch.with_job_sink(Arc::new(streamer.clone()));

        let ingest = WorkerSettings {
            workers: config.queue.workers,
            batch_size: config.queue.batch_size,
            max_wait: config.queue.max_wait(),
        };
        let backfill_settings = WorkerSettings {
            workers: config.queue.backfill_workers,
            ..ingest.clone()
        };

        let pools = vec![
            WorkerPool::spawn(
                data_added.clone(),
                gapwatch.engine(),
                ingest.clone(),
                metrics.clone(),
                shutdown.token(),
            ),
            WorkerPool::spawn(
                data_removed.clone(),
                gapwatch.engine(),
                ingest,
                metrics.clone(),
                shutdown.token(),
            ),
            WorkerPool::spawn(
                backfill.clone(),
                gapwatch.engine(),
                backfill_settings,
                metrics.clone(),
                shutdown.token(),
            ),
        ];

        let scheduler = ReportScheduler::new(
            gapwatch.reporter(),
            config.reporter.interval(),
            metrics.clone(),
        )
        .spawn(shutdown.token());

        tracing::info!(
            workers = config.queue.workers,
            backfill_workers = config.queue.backfill_workers,
            "gap runtime started"
        );
        Self {
            gapwatch,
            data_added,
            data_removed,
            backfill,
            streamer,
            metrics,
            shutdown,
            pools,
            scheduler,
        }
    }

    /// Returns the services, with oversized backfills routed to the streamer.
    pub fn gapwatch(&self) -> &Gapwatch {
        &self.gapwatch
    }

    /// Returns the registry wired to the backfill streamer.
    pub fn registry(&self) -> Registry {
        self.gapwatch.registry()
    }

    /// Queue for data-added events.
    pub fn data_added(&self) -> Arc<MemoryQueue> {
        self.data_added.clone()
    }

    /// Queue for data-removed events.
    pub fn data_removed(&self) -> Arc<MemoryQueue> {
        self.data_removed.clone()
    }

    /// Queue fed by backfill jobs.
    pub fn backfill_queue(&self) -> Arc<MemoryQueue> {
        self.backfill.clone()
    }

    /// Returns the backfill streamer.
    pub fn streamer(&self) -> &BackfillStreamer {
        &self.streamer
    }

    /// Current metric values.
    pub fn metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    /// Dead letters from every queue.
    pub async fn dead_letters(&self) -> Vec<(String, DeadLetter)> {
        let mut all = Vec::new();
        for (name, queue) in [
            (DATA_ADDED_QUEUE, &self.data_added),
            (DATA_REMOVED_QUEUE, &self.data_removed),
            (BACKFILL_QUEUE, &self.backfill),
        ] {
            all.extend(
                queue
                    .dead_letters()
                    .await
                    .into_iter()
                    .map(|d| (name.to_string(), d)),
            );
        }
        all
    }

    /// Stops every background task.
    ///
    /// Batches being applied finish first. Records still queued are dropped
    /// with the in-process queues.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for queue in [&self.data_added, &self.data_removed, &self.backfill] {
            queue.close().await;
        }
        for pool in self.pools {
            pool.join().await;
        }
        if let Err(err) = self.scheduler.await {
            tracing::error!(error = %err, "report scheduler task failed");
        }
        tracing::info!("gap runtime stopped");
    }
}
