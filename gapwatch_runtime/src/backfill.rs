//! Asynchronous backfill streaming.
//!
//! A job reads a collection's historical data units from the catalog and
//! feeds them into the backfill queue as data-added records. Producers page
//! the catalog, one per extent window; consumers drain a bounded channel
//! and send fixed-size batches. The channel bound caps in-flight units.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gapwatch_core::catalog::Catalog;
use gapwatch_core::registry::{BackfillJob, JobSink};
use gapwatch_core::{CollectionId, EventRecord, GapError, TimeRange};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::error::{Result, RuntimeError};
use crate::metrics::{MetricKind, RuntimeMetrics};
use crate::queue::EventSink;

/// Finished jobs kept for status lookups before the oldest are evicted.
pub const DEFAULT_FINISHED_RETENTION: usize = 256;

/// Lifecycle of a backfill job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, waiting to start.
    Queued,
    /// Streaming units.
    Running,
    /// Every unit was sent.
    Completed,
    /// Streaming stopped on an error.
    Failed {
        /// First error encountered
        error: String,
    },
    /// Stopped by shutdown.
    Cancelled,
}

impl JobState {
    /// Returns true once the job will make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed { .. } | JobState::Cancelled
        )
    }
}

/// Progress of a backfill job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    /// Job handle
    pub job_id: Uuid,
    /// Collection key
    pub collection: String,
    /// Estimated unit count
    pub units_expected: u64,
    /// Units sent to the backfill queue
    pub units_sent: u64,
    /// Current state
    pub state: JobState,
    /// When the job was accepted
    pub submitted_at: DateTime<Utc>,
    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

/// Streams catalog units into an event sink.
#[derive(Clone)]
pub struct BackfillStreamer {
    catalog: Arc<dyn Catalog>,
    sink: Arc<dyn EventSink>,
    batch_size: usize,
    slots: Arc<Semaphore>,
    max_pending: usize,
    retention: usize,
    jobs: Arc<RwLock<HashMap<Uuid, JobStatus>>>,
    finished: Arc<Notify>,
    metrics: RuntimeMetrics,
    cancel: CancellationToken,
}

impl std::fmt::Debug for BackfillStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackfillStreamer")
            .field("batch_size", &self.batch_size)
            .field("max_pending", &self.max_pending)
            .field("retention", &self.retention)
            .finish()
    }
}

impl BackfillStreamer {
    /// Creates a streamer.
    ///
    /// # Arguments
    ///
    /// * `catalog` - Source of historical units
    /// * `sink` - Backfill queue receiving data-added records
    /// * `batch_size` - Records per send
    /// * `max_pending` - Jobs allowed to run or wait at once
    pub fn new(
        catalog: Arc<dyn Catalog>,
        sink: Arc<dyn EventSink>,
        batch_size: usize,
        max_pending: usize,
        metrics: RuntimeMetrics,
        cancel: CancellationToken,
    ) -> Self {
        let max_pending = max_pending.max(1);
        Self {
            catalog,
            sink,
            batch_size: batch_size.max(1),
            slots: Arc::new(Semaphore::new(max_pending)),
            max_pending,
            retention: DEFAULT_FINISHED_RETENTION,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            finished: Arc::new(Notify::new()),
            metrics,
            cancel,
        }
    }

    /// Keeps at most `retention` finished jobs; older ones are forgotten.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    /// Accepts a job and starts streaming it in the background.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::JobCapacity`] if `max_pending` jobs are
    /// already in flight.
    pub async fn start(&self, job: BackfillJob) -> Result<Uuid> {
        let permit = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| RuntimeError::JobCapacity(self.max_pending))?;

        let job_id = job.job_id;
        self.jobs.write().await.insert(
            job_id,
            JobStatus {
                job_id,
                collection: job.collection.key(),
                units_expected: job.plan.units,
                units_sent: 0,
                state: JobState::Queued,
                submitted_at: Utc::now(),
                finished_at: None,
            },
        );

        let streamer = self.clone();
        tokio::spawn(async move { streamer.run(job, permit).await });
        Ok(job_id)
    }

    /// Returns a job's progress.
    pub async fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    /// Returns every known job.
    pub async fn jobs(&self) -> Vec<JobStatus> {
        let mut jobs: Vec<JobStatus> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.submitted_at);
        jobs
    }

    /// Waits until the job reaches a terminal state.
    ///
    /// Returns `None` for unknown jobs, including finished jobs already
    /// evicted by the retention limit.
    pub async fn wait(&self, job_id: Uuid) -> Option<JobStatus> {
        loop {
            let notified = self.finished.notified();
            let status = self.status(job_id).await?;
            if status.state.is_terminal() {
                return Some(status);
            }
            notified.await;
        }
    }

    async fn set_state(&self, job_id: Uuid, state: JobState, units_sent: u64) {
        let terminal = state.is_terminal();
        {
            let mut jobs = self.jobs.write().await;
            if let Some(status) = jobs.get_mut(&job_id) {
                status.state = state;
                status.units_sent = units_sent;
                if terminal {
                    status.finished_at = Some(Utc::now());
                }
            }
            if terminal {
                evict_finished(&mut jobs, self.retention);
            }
        }
        if terminal {
            self.metrics.record(MetricKind::BackfillJobFinished);
            self.finished.notify_waiters();
        }
    }

    async fn run(self, job: BackfillJob, _permit: OwnedSemaphorePermit) {
        let job_id = job.job_id;
        let collection = job.collection.key();
        self.set_state(job_id, JobState::Running, 0).await;
        tracing::info!(
            collection = %collection,
            %job_id,
            producers = job.plan.producers,
            consumers = job.plan.consumers,
            queue_depth = job.plan.queue_depth,
            "backfill job started"
        );

        let sent = Arc::new(AtomicU64::new(0));
        let result = tokio::select! {
            _ = self.cancel.wait_cancelled() => None,
            result = self.stream(&job, sent.clone()) => Some(result),
        };
        let units_sent = sent.load(Ordering::Relaxed);

        let state = match result {
            Some(Ok(())) => {
                tracing::info!(collection = %collection, %job_id, units_sent, "backfill job completed");
                JobState::Completed
            }
            Some(Err(err)) => {
                tracing::error!(collection = %collection, %job_id, units_sent, error = %err, "backfill job failed");
                JobState::Failed {
                    error: err.to_string(),
                }
            }
            None => {
                tracing::warn!(collection = %collection, %job_id, units_sent, "backfill job cancelled");
                JobState::Cancelled
            }
        };
        self.set_state(job_id, state, units_sent).await;
    }

    async fn stream(&self, job: &BackfillJob, sent: Arc<AtomicU64>) -> Result<()> {
        let plan = &job.plan;
        let (tx, rx) = mpsc::channel::<EventRecord>(plan.queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        for window in &plan.windows {
            tasks.spawn(produce(
                self.catalog.clone(),
                job.collection.clone(),
                *window,
                plan.page_size,
                tx.clone(),
            ));
        }
        drop(tx);

        for _ in 0..plan.consumers.max(1) {
            tasks.spawn(consume(
                rx.clone(),
                self.sink.clone(),
                self.batch_size,
                sent.clone(),
                self.metrics.clone(),
            ));
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| RuntimeError::Task(e.to_string()))
                .and_then(|r| r);
            if let Err(err) = outcome {
                if first_error.is_none() {
                    // Stop the remaining producers and consumers.
                    tasks.abort_all();
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Drops the oldest finished jobs beyond `keep`. Running jobs stay.
fn evict_finished(jobs: &mut HashMap<Uuid, JobStatus>, keep: usize) {
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = jobs
        .values()
        .filter_map(|job| job.finished_at.map(|at| (at, job.job_id)))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, job_id) in finished.into_iter().take(excess) {
        jobs.remove(&job_id);
    }
    tracing::debug!(evicted = excess, "evicted finished backfill jobs");
}

/// Pages one window of the catalog into the channel.
async fn produce(
    catalog: Arc<dyn Catalog>,
    collection: CollectionId,
    window: TimeRange,
    page_size: usize,
    tx: mpsc::Sender<EventRecord>,
) -> Result<()> {
    let mut cursor = None;
    loop {
        let page = catalog
            .units_page(&collection, &window, cursor, page_size)
            .await?;
        for unit in &page.units {
            if tx.send(unit.to_record(&collection)).await.is_err() {
                // Consumers are gone; the job is being torn down.
                return Ok(());
            }
        }
        match page.next {
            Some(next) if !page.units.is_empty() => cursor = Some(next),
            _ => return Ok(()),
        }
    }
}

/// Drains the channel in batches of `batch_size` into the sink.
async fn consume(
    rx: Arc<Mutex<mpsc::Receiver<EventRecord>>>,
    sink: Arc<dyn EventSink>,
    batch_size: usize,
    sent: Arc<AtomicU64>,
    metrics: RuntimeMetrics,
) -> Result<()> {
    loop {
        let batch = {
            let mut rx = rx.lock().await;
            let Some(first) = rx.recv().await else {
                return Ok(());
            };
            let mut batch = Vec::with_capacity(batch_size);
            batch.push(first);
            while batch.len() < batch_size {
                match rx.try_recv() {
                    Ok(record) => batch.push(record),
                    Err(_) => break,
                }
            }
            batch
        };

        let count = batch.len() as u64;
        sink.send(batch).await?;
        sent.fetch_add(count, Ordering::Relaxed);
        metrics.add(MetricKind::BackfillUnitSent, count);
    }
}

#[async_trait]
impl JobSink for BackfillStreamer {
    async fn submit(&self, job: BackfillJob) -> gapwatch_core::Result<()> {
        self.start(job).await.map(|_| ()).map_err(|err| match err {
            RuntimeError::Core(core) => core,
            other => GapError::DownstreamUnavailable(other.to_string()),
        })
    }
}
