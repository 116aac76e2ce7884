//! Gap query service.
//!
//! Answers range queries over a collection's gap rows:
//!
//! 1. fetch gap rows overlapping the requested window
//! 2. merge gaps separated by at most the tolerance
//! 3. annotate or exclude known gaps
//! 4. offload the result to object storage if it is too large to return
//!    inline

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QueryConfig;
use crate::error::{GapError, Result};
use crate::objects::{query_result_key, ObjectRef, ObjectStore};
use crate::ranges::{is_open_end, merge_within_tolerance, open_end, RangeSet, TimeRange};
use crate::storage::GapStore;
use crate::tolerance::{secs_to_duration, ToleranceStore};
use crate::types::{CollectionId, Reason};

/// How the tolerance is chosen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ToleranceMode {
    /// No merging.
    #[default]
    Off,
    /// The collection's configured tolerance, or the system default.
    Configured,
    /// An explicit tolerance in seconds.
    Override(u64),
}

/// How known-gap annotations affect the result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KnownGapMode {
    /// Annotations are not consulted.
    #[default]
    Ignore,
    /// Each gap lists the reasons intersecting it.
    Annotate,
    /// Portions covered by a reason are removed.
    Exclude,
}

/// A gap query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GapQuery {
    /// Collection to query
    pub collection: CollectionId,
    /// Inclusive lower bound; unbounded if `None`
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound; unbounded if `None`
    pub end: Option<DateTime<Utc>>,
    /// Tolerance selection
    pub tolerance: ToleranceMode,
    /// Known-gap handling
    pub known_gaps: KnownGapMode,
}

impl GapQuery {
    /// Query over the whole extent with no tolerance and no annotations.
    pub fn new(collection: CollectionId) -> Self {
        Self {
            collection,
            start: None,
            end: None,
            tolerance: ToleranceMode::Off,
            known_gaps: KnownGapMode::Ignore,
        }
    }

    /// Restricts the query window.
    pub fn between(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Sets the tolerance mode.
    pub fn with_tolerance(mut self, tolerance: ToleranceMode) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Sets the known-gap mode.
    pub fn with_known_gaps(mut self, known_gaps: KnownGapMode) -> Self {
        self.known_gaps = known_gaps;
        self
    }
}

/// One reported gap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapEntry {
    /// Gap start
    pub start: DateTime<Utc>,
    /// Gap end; the current time for an ongoing trailing gap
    pub end: DateTime<Utc>,
    /// Known-gap reasons intersecting this gap
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

/// Inline query result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GapQueryBody {
    /// Collection key
    pub collection: String,
    /// Gaps in ascending order
    pub time_gaps: Vec<GapEntry>,
    /// Tolerance applied, in seconds
    pub gap_tolerance: u64,
}

/// Query outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryResult {
    /// Result small enough to return directly.
    Inline(GapQueryBody),
    /// Result written to object storage.
    Offloaded {
        /// Where the result was written
        reference: ObjectRef,
        /// Number of gaps in the stored result
        gap_count: usize,
    },
}

/// Gap query service.
#[derive(Clone)]
pub struct GapQueryService {
    store: GapStore,
    tolerances: ToleranceStore,
    objects: Arc<dyn ObjectStore>,
    limits: QueryConfig,
}

impl std::fmt::Debug for GapQueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GapQueryService")
            .field("limits", &self.limits)
            .finish()
    }
}

impl GapQueryService {
    /// Creates a query service.
    pub fn new(
        store: GapStore,
        tolerances: ToleranceStore,
        objects: Arc<dyn ObjectStore>,
        limits: QueryConfig,
    ) -> Self {
        Self {
            store,
            tolerances,
            objects,
            limits,
        }
    }

    /// Runs a gap query.
    ///
    /// # Errors
    ///
    /// - [`GapError::NotRegistered`] for unknown collections
    /// - [`GapError::Validation`] if `start > end`
    pub async fn query(&self, query: &GapQuery) -> Result<QueryResult> {
        if let (Some(start), Some(end)) = (query.start, query.end) {
            if start > end {
                return Err(GapError::validation("Start date is greater than end date"));
            }
        }

        let id = &query.collection;
        self.store.require_collection(id).await?;

        let tolerance_secs = match query.tolerance {
            ToleranceMode::Off => 0,
            ToleranceMode::Configured => self.tolerances.effective_secs(id).await?,
            ToleranceMode::Override(secs) => secs,
        };

        let window = TimeRange {
            start: query.start.unwrap_or(DateTime::<Utc>::MIN_UTC),
            end: query.end.unwrap_or_else(open_end),
        };

        let ranges: Vec<TimeRange> = if window.start < window.end {
            self.store
                .gaps_in_range(id, &window)
                .await?
                .into_iter()
                .map(|g| g.range)
                .collect()
        } else {
            Vec::new()
        };
        let merged = merge_within_tolerance(&ranges, secs_to_duration(tolerance_secs));

        let entries = match query.known_gaps {
            KnownGapMode::Ignore => merged.iter().map(|r| entry(r, Vec::new())).collect(),
            KnownGapMode::Annotate | KnownGapMode::Exclude => {
                let reasons = match RangeSet::from_ranges(merged.iter().copied()).hull() {
                    Some(hull) => self.store.reasons_intersecting(id, &hull).await?,
                    None => Vec::new(),
                };
                apply_known_gaps(&merged, &reasons, query.known_gaps)
            }
        };

        let body = GapQueryBody {
            collection: id.key(),
            time_gaps: entries.into_iter().map(clamp_open_end).collect(),
            gap_tolerance: tolerance_secs,
        };

        tracing::info!(
            collection = %id.key(),
            gaps = body.time_gaps.len(),
            tolerance_secs,
            "gap query"
        );
        self.deliver(body).await
    }

    async fn deliver(&self, body: GapQueryBody) -> Result<QueryResult> {
        let gap_count = body.time_gaps.len();
        let bytes = serde_json::to_vec(&body)?;
        if gap_count <= self.limits.max_rows && bytes.len() <= self.limits.max_response_bytes {
            return Ok(QueryResult::Inline(body));
        }
        self.offload(&body.collection, bytes, gap_count).await
    }

    async fn offload(&self, collection: &str, bytes: Vec<u8>, gap_count: usize) -> Result<QueryResult> {
        let size = bytes.len();
        let reference = self
            .objects
            .put(&query_result_key(collection, Utc::now()), bytes)
            .await?;
        tracing::info!(
            collection,
            size,
            gap_count,
            key = %reference.key,
            "query result offloaded"
        );
        Ok(QueryResult::Offloaded {
            reference,
            gap_count,
        })
    }
}

fn entry(range: &TimeRange, reasons: Vec<String>) -> GapEntry {
    GapEntry {
        start: range.start,
        end: range.end,
        reasons,
    }
}

/// Annotates gaps with intersecting reasons or removes covered portions.
pub fn apply_known_gaps(merged: &[TimeRange], reasons: &[Reason], mode: KnownGapMode) -> Vec<GapEntry> {
    match mode {
        KnownGapMode::Ignore => merged.iter().map(|r| entry(r, Vec::new())).collect(),
        KnownGapMode::Annotate => merged
            .iter()
            .map(|gap| {
                let mut texts: Vec<String> = Vec::new();
                for reason in reasons.iter().filter(|r| r.range().overlaps(gap)) {
                    if !texts.contains(&reason.reason) {
                        texts.push(reason.reason.clone());
                    }
                }
                entry(gap, texts)
            })
            .collect(),
        KnownGapMode::Exclude => {
            let covered: RangeSet = reasons.iter().map(Reason::range).collect();
            RangeSet::from_ranges(merged.iter().copied())
                .difference(&covered)
                .ranges()
                .iter()
                .map(|r| entry(r, Vec::new()))
                .collect()
        }
    }
}

/// Replaces the open-end sentinel with the current time.
fn clamp_open_end(mut gap: GapEntry) -> GapEntry {
    if is_open_end(gap.end) {
        let now = Utc::now();
        if now > gap.start {
            gap.end = now;
        }
    }
    gap
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranges::parse_timestamp;

    fn r(a: &str, b: &str) -> TimeRange {
        TimeRange::new(parse_timestamp(a).unwrap(), parse_timestamp(b).unwrap()).unwrap()
    }

    fn reason(a: &str, b: &str, text: &str) -> Reason {
        let range = r(a, b);
        Reason {
            reason_id: 1,
            collection_id: "X___1_0".into(),
            start_ts: range.start,
            end_ts: range.end,
            reason: text.into(),
        }
    }

    #[test]
    fn test_annotate_lists_overlapping_reasons() {
        let merged = vec![r("2020-01-01", "2020-01-10"), r("2020-01-20", "2020-02-01")];
        let reasons = vec![
            reason("2020-01-02", "2020-01-03", "safe mode"),
            reason("2020-01-05", "2020-01-25", "outage"),
        ];

        let entries = apply_known_gaps(&merged, &reasons, KnownGapMode::Annotate);
        assert_eq!(entries[0].reasons, vec!["safe mode", "outage"]);
        assert_eq!(entries[1].reasons, vec!["outage"]);
    }

    #[test]
    fn test_exclude_removes_covered_portions() {
        let merged = vec![r("2020-01-01", "2020-01-10")];
        let reasons = vec![reason("2020-01-01", "2020-01-04", "planned")];

        let entries = apply_known_gaps(&merged, &reasons, KnownGapMode::Exclude);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].start, parse_timestamp("2020-01-04").unwrap());
        assert_eq!(entries[0].end, parse_timestamp("2020-01-10").unwrap());
    }

    #[test]
    fn test_exclude_fully_covered_gap_disappears() {
        let merged = vec![r("2020-01-02", "2020-01-03")];
        let reasons = vec![reason("2020-01-01", "2020-01-05", "planned")];
        assert!(apply_known_gaps(&merged, &reasons, KnownGapMode::Exclude).is_empty());
    }

    #[test]
    fn test_open_end_clamped_to_now() {
        let gap = GapEntry {
            start: parse_timestamp("2020-01-01").unwrap(),
            end: open_end(),
            reasons: Vec::new(),
        };
        let clamped = clamp_open_end(gap);
        assert!(clamped.end <= Utc::now());
        assert!(!is_open_end(clamped.end));
    }

    #[test]
    fn test_body_wire_names() {
        let body = GapQueryBody {
            collection: "X___1_0".into(),
            time_gaps: vec![],
            gap_tolerance: 5,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("timeGaps").is_some());
        assert_eq!(json["gapTolerance"], 5);
    }
}
