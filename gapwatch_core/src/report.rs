//! Periodic completeness reporter.
//!
//! A report run walks every registered collection, measures its gap
//! coverage against its tolerance and writes one report object per
//! collection. A failing collection does not stop the run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GapError, Result};
use crate::objects::{report_key, report_prefix, ObjectRef, ObjectStore};
use crate::ranges::{is_open_end, merge_within_tolerance, RangeSet, TimeRange};
use crate::storage::GapStore;
use crate::tolerance::{secs_to_duration, ToleranceStore};
use crate::types::{Collection, CollectionId};

/// Completeness of one collection at one point in time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletenessReport {
    /// Collection key
    pub collection: String,
    /// When the report was computed
    pub generated_at: DateTime<Utc>,
    /// Extent start
    pub extent_start: DateTime<Utc>,
    /// Extent end; the generation time for ongoing collections
    pub extent_end: DateTime<Utc>,
    /// Tolerance applied, in seconds
    pub tolerance_secs: u64,
    /// Length of the extent in seconds
    pub extent_secs: i64,
    /// Total gap length inside the extent in seconds
    pub total_gap_secs: i64,
    /// Share of the extent covered by data, 0 to 100
    pub completeness_pct: f64,
    /// Stored gap rows inside the extent
    pub gap_count: usize,
    /// Gaps at least as long as the tolerance after merging
    pub significant_gaps: Vec<TimeRange>,
    /// True if no significant gap exists
    pub within_tolerance: bool,
}

impl CompletenessReport {
    /// Computes a report from a collection's stored gaps.
    pub fn compute(
        collection: &Collection,
        gaps: &[TimeRange],
        tolerance_secs: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let extent = collection.extent();
        let extent_end = if is_open_end(extent.end) { now.max(extent.start) } else { extent.end };
        let bounds = TimeRange {
            start: extent.start,
            end: extent_end,
        };

        let inside = RangeSet::from_ranges(gaps.iter().copied()).clip(&bounds);
        let extent_secs = bounds.duration().num_seconds();
        let total_gap_secs = inside.total_duration().num_seconds();
        let completeness_pct = if extent_secs > 0 {
            (100.0 * (1.0 - total_gap_secs as f64 / extent_secs as f64)).clamp(0.0, 100.0)
        } else {
            100.0
        };

        let tolerance = secs_to_duration(tolerance_secs);
        let significant_gaps: Vec<TimeRange> = merge_within_tolerance(inside.ranges(), tolerance)
            .into_iter()
            .filter(|gap| gap.duration() >= tolerance)
            .collect();

        Self {
            collection: collection.id.key(),
            generated_at: now,
            extent_start: extent.start,
            extent_end,
            tolerance_secs,
            extent_secs,
            total_gap_secs,
            completeness_pct,
            gap_count: inside.len(),
            within_tolerance: significant_gaps.is_empty(),
            significant_gaps,
        }
    }

    /// Renders the significant gaps as `gap_begin,gap_end` CSV.
    pub fn to_csv(&self) -> String {
        let mut out = String::from("gap_begin,gap_end\n");
        for gap in &self.significant_gaps {
            out.push_str(&gap.start.to_rfc3339());
            out.push(',');
            out.push_str(&gap.end.to_rfc3339());
            out.push('\n');
        }
        out
    }
}

/// A report written during a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Collection key
    pub collection: String,
    /// Stored report location
    pub object: ObjectRef,
    /// Completeness percentage
    pub completeness_pct: f64,
    /// Number of significant gaps
    pub significant_gaps: usize,
}

/// A collection whose report could not be produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFailure {
    /// Collection key
    pub collection: String,
    /// Error description
    pub error: String,
}

/// Result of one report run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportRun {
    /// Reports written
    pub written: Vec<ReportSummary>,
    /// Collections that failed
    pub failed: Vec<ReportFailure>,
}

/// Latest report as returned to a reader.
#[derive(Clone, Debug, PartialEq)]
pub enum LatestReport {
    /// Report small enough to return directly.
    Inline(CompletenessReport),
    /// Report too large to return inline.
    Offloaded(ObjectRef),
}

/// Completeness reporter.
#[derive(Clone)]
pub struct Reporter {
    store: GapStore,
    tolerances: ToleranceStore,
    objects: Arc<dyn ObjectStore>,
    max_inline_bytes: usize,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("max_inline_bytes", &self.max_inline_bytes)
            .finish()
    }
}

impl Reporter {
    /// Creates a reporter.
    pub fn new(
        store: GapStore,
        tolerances: ToleranceStore,
        objects: Arc<dyn ObjectStore>,
        max_inline_bytes: usize,
    ) -> Self {
        Self {
            store,
            tolerances,
            objects,
            max_inline_bytes,
        }
    }

    /// Computes and stores a report for every registered collection.
    ///
    /// # Errors
    ///
    /// Fails only if the collection list cannot be read; per-collection
    /// failures are collected in [`ReportRun::failed`].
    pub async fn run_once(&self) -> Result<ReportRun> {
        let collections = self.store.list_collections().await?;
        tracing::info!(collections = collections.len(), "report run started");

        let mut run = ReportRun::default();
        for collection in &collections {
            let key = collection.id.key();
            match self.report_collection(collection).await {
                Ok(summary) => run.written.push(summary),
                Err(err) => {
                    tracing::error!(collection = %key, error = %err, "report failed");
                    run.failed.push(ReportFailure {
                        collection: key,
                        error: err.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            written = run.written.len(),
            failed = run.failed.len(),
            "report run finished"
        );
        Ok(run)
    }

    /// Computes and stores the report for one collection.
    pub async fn report_collection(&self, collection: &Collection) -> Result<ReportSummary> {
        let tolerance_secs = self.tolerances.effective_secs(&collection.id).await?;
        let gaps: Vec<TimeRange> = self
            .store
            .all_gaps(&collection.id)
            .await?
            .into_iter()
            .map(|g| g.range)
            .collect();

        let now = Utc::now();
        let report = CompletenessReport::compute(collection, &gaps, tolerance_secs, now);
        let bytes = serde_json::to_vec_pretty(&report)?;
        let object = self
            .objects
            .put(&report_key(&report.collection, now), bytes)
            .await?;

        tracing::debug!(
            collection = %report.collection,
            completeness_pct = report.completeness_pct,
            key = %object.key,
            "report written"
        );
        Ok(ReportSummary {
            collection: report.collection,
            object,
            completeness_pct: report.completeness_pct,
            significant_gaps: report.significant_gaps.len(),
        })
    }

    /// Returns the most recent report for a collection.
    ///
    /// # Errors
    ///
    /// Returns [`GapError::NotFound`] if no report has been written.
    pub async fn latest(&self, id: &CollectionId) -> Result<LatestReport> {
        let key = id.key();
        let object = self
            .objects
            .latest(&report_prefix(&key))
            .await?
            .ok_or_else(|| GapError::NotFound(format!("no report for collection {}", key)))?;

        if object.size as usize > self.max_inline_bytes {
            return Ok(LatestReport::Offloaded(object));
        }
        let bytes = self.objects.get(&object.key).await?;
        Ok(LatestReport::Inline(serde_json::from_slice(&bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranges::parse_timestamp;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_timestamp(s).unwrap()
    }

    fn r(a: &str, b: &str) -> TimeRange {
        TimeRange::new(ts(a), ts(b)).unwrap()
    }

    fn january(end: Option<&str>) -> Collection {
        Collection {
            id: CollectionId::new("X", "1.0").unwrap(),
            extent_start: ts("2020-01-01"),
            extent_end: end.map(ts),
        }
    }

    #[test]
    fn test_completeness_percentage() {
        let collection = january(Some("2020-01-11"));
        let gaps = vec![r("2020-01-01", "2020-01-02"), r("2020-01-05", "2020-01-06")];

        let report = CompletenessReport::compute(&collection, &gaps, 0, ts("2024-01-01"));
        assert_eq!(report.extent_secs, 10 * 86_400);
        assert_eq!(report.total_gap_secs, 2 * 86_400);
        assert!((report.completeness_pct - 80.0).abs() < 1e-9);
        assert_eq!(report.significant_gaps.len(), 2);
        assert!(!report.within_tolerance);
    }

    #[test]
    fn test_short_gaps_within_tolerance() {
        let collection = january(Some("2020-01-11"));
        let gaps = vec![r("2020-01-03T00:00:00Z", "2020-01-03T00:00:30Z")];

        let report = CompletenessReport::compute(&collection, &gaps, 60, ts("2024-01-01"));
        assert!(report.significant_gaps.is_empty());
        assert!(report.within_tolerance);
        assert_eq!(report.gap_count, 1);
    }

    #[test]
    fn test_open_extent_measured_to_now() {
        let collection = january(None);
        let now = ts("2020-01-05");
        let gaps = vec![TimeRange {
            start: ts("2020-01-04"),
            end: crate::ranges::open_end(),
        }];

        let report = CompletenessReport::compute(&collection, &gaps, 0, now);
        assert_eq!(report.extent_end, now);
        assert_eq!(report.total_gap_secs, 86_400);
        assert!((report.completeness_pct - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_csv_rendering() {
        let collection = january(Some("2020-01-11"));
        let gaps = vec![r("2020-01-01", "2020-01-02")];
        let report = CompletenessReport::compute(&collection, &gaps, 0, ts("2024-01-01"));

        let csv = report.to_csv();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines[0], "gap_begin,gap_end");
        assert_eq!(lines[1], "2020-01-01T00:00:00+00:00,2020-01-02T00:00:00+00:00");
    }
}
