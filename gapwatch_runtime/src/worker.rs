//! Ingest worker pool.
//!
//! Each worker pulls a batch from its queue, hands it to the update engine
//! and reports per-record outcomes back to the queue: applied records are
//! acknowledged, failed records are released for redelivery. If the engine
//! reports the store unreachable the whole batch is released.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gapwatch_core::UpdateEngine;
use tokio::task::JoinHandle;

use crate::cancel::CancellationToken;
use crate::metrics::{MetricKind, RuntimeMetrics};
use crate::queue::{Delivery, EventSource};

/// Pause after a queue error before receiving again.
const RECEIVE_BACKOFF: Duration = Duration::from_millis(100);

/// Settings for one pool.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    /// Number of concurrent workers
    pub workers: usize,
    /// Largest batch per receive
    pub batch_size: usize,
    /// Batch window
    pub max_wait: Duration,
}

/// A fixed set of workers draining one queue.
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `settings.workers` workers on `source`.
    ///
    /// Workers stop when `cancel` fires or the queue is closed and drained.
    pub fn spawn(
        source: Arc<dyn EventSource>,
        engine: UpdateEngine,
        settings: WorkerSettings,
        metrics: RuntimeMetrics,
        cancel: CancellationToken,
    ) -> Self {
        let name = source.name().to_string();
        let handles = (0..settings.workers.max(1))
            .map(|index| {
                let worker = Worker {
                    index,
                    source: source.clone(),
                    engine: engine.clone(),
                    settings: settings.clone(),
                    metrics: metrics.clone(),
                };
                let cancel = cancel.clone();
                tokio::spawn(async move { worker.run(cancel).await })
            })
            .collect::<Vec<_>>();

        tracing::info!(queue = %name, workers = handles.len(), "worker pool started");
        Self { name, handles }
    }

    /// Number of workers in the pool.
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Waits for every worker to stop.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!(queue = %self.name, error = %err, "worker task failed");
            }
        }
        tracing::info!(queue = %self.name, "worker pool stopped");
    }
}

struct Worker {
    index: usize,
    source: Arc<dyn EventSource>,
    engine: UpdateEngine,
    settings: WorkerSettings,
    metrics: RuntimeMetrics,
}

impl Worker {
    async fn run(self, cancel: CancellationToken) {
        let queue = self.source.name().to_string();
        loop {
            let received = tokio::select! {
                _ = cancel.wait_cancelled() => break,
                received = self.source.receive(self.settings.batch_size, self.settings.max_wait) => received,
            };
            match received {
                Ok(Some(batch)) => self.process(batch).await,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(queue = %queue, worker = self.index, error = %err, "receive failed");
                    tokio::time::sleep(RECEIVE_BACKOFF).await;
                }
            }
        }
        tracing::debug!(queue = %queue, worker = self.index, "worker stopped");
    }

    async fn process(&self, batch: Vec<Delivery>) {
        self.metrics.record(MetricKind::BatchReceived);
        let receipts: Vec<u64> = batch.iter().map(|d| d.receipt).collect();
        let records = batch.iter().map(|d| d.record.clone()).collect();

        let started = Instant::now();
        let result = self.engine.apply_batch(records).await;
        self.metrics.record_apply_time(started.elapsed());

        match result {
            Ok(outcome) => {
                self.metrics.add(MetricKind::RecordApplied, outcome.applied as u64);
                self.metrics.add(MetricKind::ConflictRetried, u64::from(outcome.retries));

                let errors: HashMap<&str, &str> = outcome
                    .failures
                    .iter()
                    .map(|f| (f.message_id.as_str(), f.error.as_str()))
                    .collect();
                let (failed, succeeded): (Vec<&Delivery>, Vec<&Delivery>) = batch
                    .iter()
                    .partition(|d| errors.contains_key(d.record.message_id.as_str()));

                let acked: Vec<u64> = succeeded.iter().map(|d| d.receipt).collect();
                self.ack(&acked).await;

                // Release grouped by error so each dead letter keeps its cause.
                let mut by_error: HashMap<&str, Vec<u64>> = HashMap::new();
                for delivery in &failed {
                    let error = errors
                        .get(delivery.record.message_id.as_str())
                        .copied()
                        .unwrap_or("record failed");
                    by_error.entry(error).or_default().push(delivery.receipt);
                }
                for (error, receipts) in by_error {
                    self.release(&receipts, error).await;
                }

                if !failed.is_empty() {
                    let ids: HashSet<&str> = failed.iter().map(|d| d.record.message_id.as_str()).collect();
                    tracing::warn!(
                        queue = %self.source.name(),
                        failed = failed.len(),
                        total = batch.len(),
                        message_ids = ?ids,
                        "partial batch failure"
                    );
                }
            }
            Err(err) => {
                tracing::error!(
                    queue = %self.source.name(),
                    records = batch.len(),
                    error = %err,
                    "batch failed, releasing for redelivery"
                );
                self.release(&receipts, &err.to_string()).await;
            }
        }
    }

    async fn ack(&self, receipts: &[u64]) {
        if receipts.is_empty() {
            return;
        }
        if let Err(err) = self.source.ack(receipts).await {
            tracing::warn!(queue = %self.source.name(), error = %err, "ack failed");
        }
    }

    async fn release(&self, receipts: &[u64], error: &str) {
        self.metrics.add(MetricKind::RecordFailed, receipts.len() as u64);
        if let Err(err) = self.source.release(receipts, error).await {
            tracing::warn!(queue = %self.source.name(), error = %err, "release failed");
        }
    }
}
