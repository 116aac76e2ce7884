//! At-least-once event queues.
//!
//! A received record stays in flight until it is acknowledged or released.
//! Released records and records whose visibility timeout lapses are
//! redelivered; after `max_receives` deliveries they move to the dead-letter
//! list instead.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gapwatch_core::config::QueueConfig;
use gapwatch_core::EventRecord;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::{Result, RuntimeError};

/// A record handed to a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Handle used to acknowledge or release this delivery
    pub receipt: u64,
    /// The event record
    pub record: EventRecord,
    /// How many times the record has been delivered, including this one
    pub receive_count: u32,
}

/// A record that exhausted its deliveries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    /// The event record
    pub record: EventRecord,
    /// Deliveries attempted
    pub receive_count: u32,
    /// Error reported on the final release
    pub last_error: String,
    /// When the record was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
}

/// Queue depth snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Records waiting for delivery
    pub ready: usize,
    /// Records delivered but not yet acknowledged
    pub in_flight: usize,
    /// Records dead-lettered
    pub dead: usize,
}

/// Consumer side of a queue.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Queue name for logs.
    fn name(&self) -> &str;

    /// Receives up to `max` records, waiting up to `wait` to fill the batch
    /// once at least one record is available.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Option<Vec<Delivery>>>;

    /// Acknowledges processed deliveries.
    async fn ack(&self, receipts: &[u64]) -> Result<()>;

    /// Returns deliveries for redelivery, or dead-letters them.
    async fn release(&self, receipts: &[u64], error: &str) -> Result<()>;
}

/// Producer side of a queue.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Enqueues records, waiting while the queue is at capacity.
    async fn send(&self, records: Vec<EventRecord>) -> Result<()>;
}

#[derive(Debug)]
struct Pending {
    record: EventRecord,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlight {
    pending: Pending,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Pending>,
    in_flight: HashMap<u64, InFlight>,
    dead: Vec<DeadLetter>,
    next_receipt: u64,
    closed: bool,
}

impl State {
    fn occupied(&self) -> usize {
        self.ready.len() + self.in_flight.len()
    }
}

/// In-process bounded queue.
#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    max_receives: u32,
    capacity: usize,
    visibility_timeout: Duration,
    state: Mutex<State>,
    available: Notify,
    space: Notify,
}

impl MemoryQueue {
    /// Creates a queue using the delivery settings in `config`.
    pub fn new(name: impl Into<String>, config: &QueueConfig) -> Self {
        Self {
            name: name.into(),
            max_receives: config.max_receives.max(1),
            capacity: config.capacity.max(1),
            visibility_timeout: config.visibility_timeout(),
            state: Mutex::new(State::default()),
            available: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Stops accepting records. Consumers drain what remains.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.available.notify_waiters();
        self.space.notify_waiters();
    }

    /// Current queue depth.
    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            ready: state.ready.len(),
            in_flight: state.in_flight.len(),
            dead: state.dead.len(),
        }
    }

    /// Records that exhausted their deliveries, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }

    /// Moves every dead letter back to the queue with a fresh delivery count.
    pub async fn redrive_dead_letters(&self) -> usize {
        let mut state = self.state.lock().await;
        let dead = std::mem::take(&mut state.dead);
        let count = dead.len();
        state.ready.extend(dead.into_iter().map(|d| Pending {
            record: d.record,
            receive_count: 0,
        }));
        drop(state);

        if count > 0 {
            tracing::info!(queue = %self.name, count, "dead letters redriven");
            self.available.notify_waiters();
        }
        count
    }

    /// Handles a failed delivery: redeliver, or dead-letter if exhausted.
    fn requeue(&self, state: &mut State, pending: Pending, error: &str) {
        if pending.receive_count >= self.max_receives {
            tracing::error!(
                queue = %self.name,
                message_id = %pending.record.message_id,
                receive_count = pending.receive_count,
                error,
                "record dead-lettered"
            );
            state.dead.push(DeadLetter {
                record: pending.record,
                receive_count: pending.receive_count,
                last_error: error.to_string(),
                dead_lettered_at: Utc::now(),
            });
        } else {
            state.ready.push_front(pending);
        }
    }

    /// Returns in-flight records whose visibility timeout lapsed.
    fn reclaim_expired(&self, state: &mut State) {
        let now = Instant::now();
        let expired: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some(flight) = state.in_flight.remove(&receipt) {
                tracing::warn!(
                    queue = %self.name,
                    message_id = %flight.pending.record.message_id,
                    "visibility timeout lapsed"
                );
                self.requeue(state, flight.pending, "visibility timeout lapsed");
            }
        }
    }

    fn take(&self, state: &mut State, max: usize) -> Vec<Delivery> {
        let visible_at = Instant::now() + self.visibility_timeout;
        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(mut pending) = state.ready.pop_front() else {
                break;
            };
            pending.receive_count += 1;
            state.next_receipt += 1;
            let receipt = state.next_receipt;
            batch.push(Delivery {
                receipt,
                record: pending.record.clone(),
                receive_count: pending.receive_count,
            });
            state.in_flight.insert(receipt, InFlight { pending, visible_at });
        }
        batch
    }

    /// Earliest in-flight visibility deadline, if any.
    fn next_expiry(state: &State) -> Option<Instant> {
        state.in_flight.values().map(|f| f.visible_at).min()
    }
}

#[async_trait]
impl EventSource for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Option<Vec<Delivery>>> {
        let max = max.max(1);

        loop {
            // Wait for the first record.
            loop {
                let notified = self.available.notified();
                let expiry = {
                    let mut state = self.state.lock().await;
                    self.reclaim_expired(&mut state);
                    if !state.ready.is_empty() {
                        break;
                    }
                    if state.closed && state.in_flight.is_empty() {
                        return Ok(None);
                    }
                    Self::next_expiry(&state)
                };
                match expiry {
                    Some(at) => {
                        let _ = tokio::time::timeout_at(at, notified).await;
                    }
                    None => notified.await,
                }
            }

            // Fill the batch until it is full or the window closes.
            let deadline = Instant::now() + wait;
            let batch = loop {
                let notified = self.available.notified();
                {
                    let mut state = self.state.lock().await;
                    if state.ready.len() >= max || state.closed || Instant::now() >= deadline {
                        break self.take(&mut state, max);
                    }
                }
                let _ = tokio::time::timeout_at(deadline, notified).await;
            };

            // Empty if another consumer drained the queue meanwhile.
            if !batch.is_empty() {
                return Ok(Some(batch));
            }
        }
    }

    async fn ack(&self, receipts: &[u64]) -> Result<()> {
        let mut state = self.state.lock().await;
        for receipt in receipts {
            state.in_flight.remove(receipt);
        }
        drop(state);
        self.space.notify_waiters();
        self.available.notify_waiters();
        Ok(())
    }

    async fn release(&self, receipts: &[u64], error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        // Reverse so that push_front restores the original order.
        for receipt in receipts.iter().rev() {
            if let Some(flight) = state.in_flight.remove(receipt) {
                self.requeue(&mut state, flight.pending, error);
            }
        }
        drop(state);
        self.available.notify_waiters();
        self.space.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl EventSink for MemoryQueue {
    async fn send(&self, records: Vec<EventRecord>) -> Result<()> {
        let count = records.len();
        for record in records {
            let mut record = Some(record);
            while let Some(next) = record.take() {
                let notified = self.space.notified();
                {
                    let mut state = self.state.lock().await;
                    if state.closed {
                        return Err(RuntimeError::QueueClosed(self.name.clone()));
                    }
                    if state.occupied() < self.capacity {
                        state.ready.push_back(Pending {
                            record: next,
                            receive_count: 0,
                        });
                        drop(state);
                        self.available.notify_waiters();
                        continue;
                    }
                }
                record = Some(next);
                notified.await;
            }
        }
        tracing::debug!(queue = %self.name, count, "records enqueued");
        Ok(())
    }
}
