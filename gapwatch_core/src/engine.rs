//! Interval update engine.
//!
//! Consumes batches of data-unit events and recomputes the gap set of every
//! affected collection. Each collection is updated in its own store
//! transaction; collections in one batch are processed concurrently.
//!
//! Two operations exist, one per event kind:
//!
//! - **data-added**: gaps overlapping the batch's covering set are replaced
//!   by `gaps - covering`.
//! - **data-removed**: gaps overlapping or adjacent to the covering set are
//!   replaced by `gaps ∪ covering`, clipped to the collection extent.
//!
//! Both are idempotent: replaying an applied batch plans no change.

use indexmap::IndexMap;
use tokio::task::JoinSet;

use crate::error::{GapError, Result};
use crate::ranges::{RangeSet, TimeRange};
use crate::retry::{execute_with_retry, RetryConfig};
use crate::storage::{GapReplacement, GapStore};
use crate::types::{CollectionId, EventKind, EventRecord, GapRecord, IntervalEvent};

/// A record that could not be applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordFailure {
    /// Message id of the failed record
    pub message_id: String,
    /// Error description
    pub error: String,
    /// Whether redelivery may succeed
    pub retryable: bool,
}

/// Result of applying one batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Records in the batch
    pub total: usize,
    /// Records whose collection update committed (including no-op replays)
    pub applied: usize,
    /// Collections whose gap rows changed
    pub collections_changed: usize,
    /// Transactions retried after a conflict
    pub retries: u32,
    /// Records to redeliver
    pub failures: Vec<RecordFailure>,
}

impl BatchOutcome {
    /// Returns true if no record failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Message ids of failed records.
    pub fn failed_ids(&self) -> Vec<String> {
        self.failures.iter().map(|f| f.message_id.clone()).collect()
    }
}

/// Plans a data-added update.
///
/// Returns `None` if no stored gap overlaps the covering set.
pub fn plan_added(existing: &[GapRecord], covering: &RangeSet) -> Option<GapReplacement> {
    let hit: Vec<&GapRecord> = existing
        .iter()
        .filter(|gap| covering.overlaps(&gap.range))
        .collect();
    if hit.is_empty() {
        return None;
    }

    let old: RangeSet = hit.iter().map(|gap| gap.range).collect();
    Some(GapReplacement {
        delete: hit.iter().map(|gap| gap.gap_id).collect(),
        insert: old.difference(covering).into_vec(),
    })
}

/// Plans a data-removed update.
///
/// The covering set is clipped to `extent`. Returns `None` if the clipped
/// set is already entirely gapped.
pub fn plan_removed(
    existing: &[GapRecord],
    covering: &RangeSet,
    extent: &TimeRange,
) -> Option<GapReplacement> {
    let clipped = covering.clip(extent);
    if clipped.is_empty() {
        return None;
    }

    let hit: Vec<&GapRecord> = existing
        .iter()
        .filter(|gap| clipped.touches(&gap.range))
        .collect();
    let old: RangeSet = hit.iter().map(|gap| gap.range).collect();
    let merged = old.union(&clipped);
    if merged == old {
        return None;
    }

    Some(GapReplacement {
        delete: hit.iter().map(|gap| gap.gap_id).collect(),
        insert: merged.into_vec(),
    })
}

/// Gap rows overlapping a removal: data reported deleted where none existed.
fn removal_overlaps(existing: &[GapRecord], covering: &RangeSet) -> Vec<(TimeRange, TimeRange)> {
    covering
        .ranges()
        .iter()
        .flat_map(|unit| {
            existing
                .iter()
                .filter(move |gap| gap.range.overlaps(unit))
                .map(move |gap| (*unit, gap.range))
        })
        .collect()
}

/// Applies event batches to the gap store.
#[derive(Clone, Debug)]
pub struct UpdateEngine {
    store: GapStore,
    retry: RetryConfig,
}

/// Consecutive same-kind events for one collection.
struct Run {
    kind: EventKind,
    events: Vec<IntervalEvent>,
}

struct CollectionResult {
    applied: usize,
    changed: bool,
    retries: u32,
    failures: Vec<RecordFailure>,
    downstream: bool,
}

impl UpdateEngine {
    /// Creates an engine over `store`.
    pub fn new(store: GapStore, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &GapStore {
        &self.store
    }

    /// Applies a batch of event records.
    ///
    /// Malformed records and records for unregistered collections fail
    /// individually; every other record of the batch is still applied.
    /// Events of one collection are split into consecutive same-kind runs,
    /// each committed in one transaction. Once a run fails, later runs of
    /// that collection fail with it so that ordering is preserved on
    /// redelivery.
    ///
    /// # Errors
    ///
    /// Returns [`GapError::DownstreamUnavailable`] if the store could not be
    /// reached for any collection; the whole batch should be redelivered.
    pub async fn apply_batch(&self, records: Vec<EventRecord>) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome {
            total: records.len(),
            ..BatchOutcome::default()
        };

        let mut by_collection: IndexMap<CollectionId, Vec<Run>> = IndexMap::new();
        for record in &records {
            match record.parse() {
                Ok(event) => {
                    let runs = by_collection.entry(event.collection.clone()).or_default();
                    match runs.last_mut() {
                        Some(run) if run.kind == event.kind => run.events.push(event),
                        _ => runs.push(Run {
                            kind: event.kind,
                            events: vec![event],
                        }),
                    }
                }
                Err(err) => {
                    tracing::warn!(message_id = %record.message_id, error = %err, "rejecting malformed record");
                    outcome.failures.push(RecordFailure {
                        message_id: record.message_id.clone(),
                        error: err.to_string(),
                        retryable: false,
                    });
                }
            }
        }

        tracing::debug!(
            records = records.len(),
            collections = by_collection.len(),
            "grouped batch"
        );

        let mut tasks = JoinSet::new();
        for (id, runs) in by_collection {
            let engine = self.clone();
            tasks.spawn(async move { engine.apply_collection(id, runs).await });
        }

        let mut downstream = false;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| GapError::DownstreamUnavailable(format!("update task failed: {}", e)))?;
            outcome.applied += result.applied;
            outcome.retries += result.retries;
            outcome.collections_changed += usize::from(result.changed);
            outcome.failures.extend(result.failures);
            downstream |= result.downstream;
        }

        if downstream {
            return Err(GapError::DownstreamUnavailable(format!(
                "{} of {} records could not reach the store",
                outcome.failures.len(),
                outcome.total
            )));
        }
        Ok(outcome)
    }

    async fn apply_collection(&self, id: CollectionId, runs: Vec<Run>) -> CollectionResult {
        let mut result = CollectionResult {
            applied: 0,
            changed: false,
            retries: 0,
            failures: Vec::new(),
            downstream: false,
        };

        let mut runs = runs.into_iter();
        while let Some(run) = runs.next() {
            match self.apply_run(&id, &run).await {
                Ok((changed, retries)) => {
                    result.applied += run.events.len();
                    result.changed |= changed;
                    result.retries += retries;
                }
                Err(err) => {
                    tracing::error!(collection = %id.key(), kind = %run.kind, error = %err, "collection update failed");
                    result.downstream |= matches!(err, GapError::DownstreamUnavailable(_));
                    let message = err.to_string();
                    let retryable = err.is_retryable();
                    let mut failed = run.events;
                    failed.extend(runs.by_ref().flat_map(|r| r.events));
                    result.failures.extend(failed.into_iter().map(|event| RecordFailure {
                        message_id: event.message_id,
                        error: message.clone(),
                        retryable,
                    }));
                    break;
                }
            }
        }
        result
    }

    /// Commits one run; returns whether rows changed and how many retries
    /// it took.
    async fn apply_run(&self, id: &CollectionId, run: &Run) -> Result<(bool, u32)> {
        let covering: RangeSet = run.events.iter().map(|e| e.range).collect();
        let kind = run.kind;
        let mut attempts: u32 = 0;

        let replacement = execute_with_retry(
            || {
                attempts += 1;
                let covering = covering.clone();
                let planned_for = id.key();
                self.store.update_gaps(id, covering.clone(), move |collection, existing| {
                    Ok(match kind {
                        EventKind::DataAdded => plan_added(existing, &covering),
                        EventKind::DataRemoved => {
                            let overlaps = removal_overlaps(existing, &covering);
                            if !overlaps.is_empty() {
                                let details: Vec<String> = overlaps
                                    .iter()
                                    .map(|(unit, gap)| format!("unit{} overlaps gap{}", unit, gap))
                                    .collect();
                                tracing::warn!(
                                    collection = %planned_for,
                                    overlaps = overlaps.len(),
                                    details = %details.join(", "),
                                    "deleting nonexistent data"
                                );
                            }
                            plan_removed(existing, &covering, &collection.extent())
                        }
                    })
                })
            },
            &self.retry,
        )
        .await?;

        let retries = attempts.saturating_sub(1);
        match &replacement {
            Some(r) => tracing::info!(
                collection = %id.key(),
                kind = %kind,
                units = run.events.len(),
                deleted = r.delete.len(),
                inserted = r.insert.len(),
                retries,
                "gaps updated"
            ),
            None => tracing::debug!(collection = %id.key(), kind = %kind, "no gap change"),
        }
        Ok((replacement.is_some(), retries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranges::parse_timestamp;

    fn r(a: &str, b: &str) -> TimeRange {
        TimeRange::new(parse_timestamp(a).unwrap(), parse_timestamp(b).unwrap()).unwrap()
    }

    fn gap(id: i64, a: &str, b: &str) -> GapRecord {
        GapRecord {
            gap_id: id,
            range: r(a, b),
        }
    }

    #[test]
    fn test_plan_added_splits_gap() {
        let existing = vec![gap(1, "2020-01-01", "2020-02-01")];
        let covering = RangeSet::from_ranges([r("2020-01-10", "2020-01-15")]);

        let plan = plan_added(&existing, &covering).unwrap();
        assert_eq!(plan.delete, vec![1]);
        assert_eq!(
            plan.insert,
            vec![r("2020-01-01", "2020-01-10"), r("2020-01-15", "2020-02-01")]
        );
    }

    #[test]
    fn test_plan_added_replay_is_noop() {
        let existing = vec![
            gap(2, "2020-01-01", "2020-01-10"),
            gap(3, "2020-01-15", "2020-02-01"),
        ];
        let covering = RangeSet::from_ranges([r("2020-01-10", "2020-01-15")]);
        assert!(plan_added(&existing, &covering).is_none());
    }

    #[test]
    fn test_plan_added_full_cover_removes_gap() {
        let existing = vec![gap(1, "2020-01-01", "2020-02-01")];
        let covering = RangeSet::from_ranges([r("2019-12-01", "2020-03-01")]);

        let plan = plan_added(&existing, &covering).unwrap();
        assert_eq!(plan.delete, vec![1]);
        assert!(plan.insert.is_empty());
    }

    #[test]
    fn test_plan_removed_merges_adjacent() {
        let existing = vec![
            gap(2, "2020-01-01", "2020-01-10"),
            gap(3, "2020-01-15", "2020-02-01"),
        ];
        let covering = RangeSet::from_ranges([r("2020-01-10", "2020-01-15")]);
        let extent = r("2020-01-01", "2020-02-01");

        let plan = plan_removed(&existing, &covering, &extent).unwrap();
        assert_eq!(plan.delete, vec![2, 3]);
        assert_eq!(plan.insert, vec![extent]);
    }

    #[test]
    fn test_plan_removed_clips_to_extent() {
        let existing = vec![];
        let covering = RangeSet::from_ranges([r("2019-12-25", "2020-01-05")]);
        let extent = r("2020-01-01", "2020-02-01");

        let plan = plan_removed(&existing, &covering, &extent).unwrap();
        assert_eq!(plan.insert, vec![r("2020-01-01", "2020-01-05")]);
    }

    #[test]
    fn test_plan_removed_inside_existing_gap_is_noop() {
        let existing = vec![gap(1, "2020-01-01", "2020-02-01")];
        let covering = RangeSet::from_ranges([r("2020-01-10", "2020-01-11")]);
        let extent = r("2020-01-01", "2020-02-01");

        assert!(plan_removed(&existing, &covering, &extent).is_none());
        assert_eq!(removal_overlaps(&existing, &covering).len(), 1);
    }

    #[test]
    fn test_outcome_failed_ids() {
        let outcome = BatchOutcome {
            failures: vec![RecordFailure {
                message_id: "m-1".into(),
                error: "bad".into(),
                retryable: false,
            }],
            ..BatchOutcome::default()
        };
        assert!(!outcome.is_complete());
        assert_eq!(outcome.failed_ids(), vec!["m-1".to_string()]);
    }
}
