//! Half-open time ranges and disjoint range sets.
//!
//! Every gap computation in the update engine, query service and reporter
//! goes through [`RangeSet`], which keeps its members sorted, pairwise
//! disjoint and non-touching. Two ranges `[a, b)` and `[b, c)` are coalesced
//! into `[a, c)` on construction.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GapError, Result};

/// End stored for ongoing collections: `9999-12-31T23:59:59Z`.
pub fn open_end() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Returns true if `ts` is the open-end sentinel.
pub fn is_open_end(ts: DateTime<Utc>) -> bool {
    ts >= open_end()
}

/// Returns the first whole second strictly after `ts`.
///
/// `23:59:59` and `23:59:59.250` both map to `00:00:00` of the next day.
pub fn next_whole_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0).unwrap_or(ts) + Duration::seconds(1)
}

/// Converts a timestamp to integer microseconds for storage.
pub fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

/// Converts stored microseconds back to a timestamp.
pub fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| GapError::Database(format!("timestamp out of range: {}", micros)))
}

/// Parses an RFC 3339 timestamp, a naive `YYYY-MM-DDTHH:MM:SS[.f]`
/// (taken as UTC), or a plain `YYYY-MM-DD` date (midnight UTC).
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(GapError::validation(format!("invalid timestamp: '{}'", value)))
}

/// A half-open time range `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Creates a non-empty range.
    ///
    /// # Errors
    ///
    /// Returns [`GapError::Validation`] unless `start < end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(GapError::validation(format!(
                "range start {} must be before end {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        Ok(Self { start, end })
    }

    /// Builds the range covered by a data unit with closed interval
    /// `[start, end]`.
    ///
    /// The exclusive end is the first whole second after `end`, so units
    /// ending on `...T23:59:59` meet units starting at the next midnight.
    /// An instantaneous unit covers up to the next second.
    pub fn from_data_unit(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(GapError::validation(format!(
                "data unit starts after it ends: {} > {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        Ok(Self {
            start,
            end: next_whole_second(end),
        })
    }

    /// Returns the length of this range.
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Returns true if the ranges share at least one instant.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if the ranges overlap or meet end-to-start.
    pub fn touches(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns true if `other` lies entirely inside this range.
    pub fn contains(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Returns the overlap of both ranges, if any.
    pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(TimeRange { start, end })
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Sorted set of pairwise disjoint, non-touching ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<TimeRange>,
}

impl RangeSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from arbitrary ranges, coalescing overlapping and
    /// adjacent members.
    pub fn from_ranges(ranges: impl IntoIterator<Item = TimeRange>) -> Self {
        let mut input: Vec<TimeRange> = ranges.into_iter().filter(|r| r.start < r.end).collect();
        input.sort_by_key(|r| r.start);

        let mut merged: Vec<TimeRange> = Vec::with_capacity(input.len());
        for range in input {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => {
                    if range.end > last.end {
                        last.end = range.end;
                    }
                }
                _ => merged.push(range),
            }
        }
        Self { ranges: merged }
    }

    /// Returns the members in ascending order.
    pub fn ranges(&self) -> &[TimeRange] {
        &self.ranges
    }

    /// Consumes the set, returning its members.
    pub fn into_vec(self) -> Vec<TimeRange> {
        self.ranges
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Returns true if the set has no members.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Smallest range covering every member.
    pub fn hull(&self) -> Option<TimeRange> {
        match (self.ranges.first(), self.ranges.last()) {
            (Some(first), Some(last)) => Some(TimeRange {
                start: first.start,
                end: last.end,
            }),
            _ => None,
        }
    }

    /// Returns true if any member overlaps `range`.
    pub fn overlaps(&self, range: &TimeRange) -> bool {
        self.ranges.iter().any(|r| r.overlaps(range))
    }

    /// Returns true if any member overlaps or is adjacent to `range`.
    pub fn touches(&self, range: &TimeRange) -> bool {
        self.ranges.iter().any(|r| r.touches(range))
    }

    /// Set union.
    pub fn union(&self, other: &RangeSet) -> RangeSet {
        RangeSet::from_ranges(self.ranges.iter().chain(other.ranges.iter()).copied())
    }

    /// Set difference: every instant of `self` not covered by `other`.
    pub fn difference(&self, other: &RangeSet) -> RangeSet {
        let subtrahend = &other.ranges;
        let mut out = Vec::with_capacity(self.ranges.len());
        let mut first = 0;

        for range in &self.ranges {
            let mut cursor = range.start;
            while first < subtrahend.len() && subtrahend[first].end <= cursor {
                first += 1;
            }

            let mut idx = first;
            while idx < subtrahend.len() && subtrahend[idx].start < range.end {
                let cut = &subtrahend[idx];
                if cut.start > cursor {
                    out.push(TimeRange {
                        start: cursor,
                        end: cut.start,
                    });
                }
                if cut.end > cursor {
                    cursor = cut.end;
                }
                if cursor >= range.end {
                    break;
                }
                idx += 1;
            }

            if cursor < range.end {
                out.push(TimeRange {
                    start: cursor,
                    end: range.end,
                });
            }
        }

        RangeSet { ranges: out }
    }

    /// Clips every member to `bounds`.
    pub fn clip(&self, bounds: &TimeRange) -> RangeSet {
        RangeSet {
            ranges: self
                .ranges
                .iter()
                .filter_map(|r| r.intersection(bounds))
                .collect(),
        }
    }

    /// Total covered duration.
    pub fn total_duration(&self) -> Duration {
        self.ranges
            .iter()
            .fold(Duration::zero(), |acc, r| acc + r.duration())
    }
}

impl FromIterator<TimeRange> for RangeSet {
    fn from_iter<I: IntoIterator<Item = TimeRange>>(iter: I) -> Self {
        RangeSet::from_ranges(iter)
    }
}

/// Merges consecutive ranges whose distance is at most `tolerance`.
///
/// Input need not be sorted. With a zero tolerance only overlapping or
/// adjacent ranges are merged.
pub fn merge_within_tolerance(ranges: &[TimeRange], tolerance: Duration) -> Vec<TimeRange> {
    let mut sorted = ranges.to_vec();
    sorted.sort_by_key(|r| r.start);

    let mut merged: Vec<TimeRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.start - last.end <= tolerance => {
                if range.end > last.end {
                    last.end = range.end;
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}
