//! Core types for Gapwatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GapError, Result};
use crate::ranges::{parse_timestamp, TimeRange};

/// Separator between short name and sanitized version in a collection key.
const KEY_SEPARATOR: &str = "___";

/// Identity of a versioned data collection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionId {
    /// Collection short name
    pub short_name: String,
    /// Version label, e.g. `6.1` or `V1`
    pub version: String,
}

impl CollectionId {
    /// Creates a validated collection identity.
    ///
    /// # Errors
    ///
    /// Returns [`GapError::Validation`] if either part is empty or contains
    /// the key separator.
    pub fn new(short_name: impl Into<String>, version: impl Into<String>) -> Result<Self> {
        let short_name = short_name.into();
        let version = version.into();

        if short_name.trim().is_empty() {
            return Err(GapError::validation("short_name must not be empty"));
        }
        if short_name.contains(KEY_SEPARATOR) {
            return Err(GapError::validation(format!(
                "short_name must not contain '{}'",
                KEY_SEPARATOR
            )));
        }
        if version.trim().is_empty() {
            return Err(GapError::validation("version must not be empty"));
        }
        if version.contains(KEY_SEPARATOR) {
            return Err(GapError::validation(format!(
                "version must not contain '{}'",
                KEY_SEPARATOR
            )));
        }

        Ok(Self { short_name, version })
    }

    /// Returns the storage key, e.g. `MODIS_A___6_1`.
    pub fn key(&self) -> String {
        format!(
            "{}{}{}",
            self.short_name,
            KEY_SEPARATOR,
            self.version.replace('.', "_")
        )
    }
}

impl std::fmt::Display for CollectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}", self.short_name, self.version)
    }
}

/// Kind of a data-unit interval event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// Data arrived; its interval stops being a gap.
    DataAdded,
    /// Data disappeared; its interval becomes a gap again.
    DataRemoved,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::DataAdded => write!(f, "data-added"),
            EventKind::DataRemoved => write!(f, "data-removed"),
        }
    }
}

/// Wire form of one data-unit event as delivered by an event source.
///
/// Fields are kept as strings so that a malformed record can be reported
/// against its message id instead of failing the whole batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Source-assigned id used for partial-batch acknowledgement
    pub message_id: String,
    /// Collection short name
    pub short_name: String,
    /// Collection version
    pub version: String,
    /// Data-unit interval start
    pub start_ts: String,
    /// Data-unit interval end (closed)
    pub end_ts: String,
    /// Added or removed
    pub kind: EventKind,
}

impl EventRecord {
    /// Builds a record from typed values.
    pub fn new(
        message_id: impl Into<String>,
        collection: &CollectionId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        kind: EventKind,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            short_name: collection.short_name.clone(),
            version: collection.version.clone(),
            start_ts: start.to_rfc3339(),
            end_ts: end.to_rfc3339(),
            kind,
        }
    }

    /// Validates the record and converts it into a typed event.
    pub fn parse(&self) -> Result<IntervalEvent> {
        let collection = CollectionId::new(&self.short_name, &self.version)?;
        let start = parse_timestamp(&self.start_ts)?;
        let end = parse_timestamp(&self.end_ts)?;
        let range = TimeRange::from_data_unit(start, end)?;
        Ok(IntervalEvent {
            message_id: self.message_id.clone(),
            collection,
            range,
            kind: self.kind,
        })
    }
}

/// A validated event with its normalized half-open range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntervalEvent {
    /// Source-assigned id
    pub message_id: String,
    /// Target collection
    pub collection: CollectionId,
    /// Normalized range covered by the data unit
    pub range: TimeRange,
    /// Added or removed
    pub kind: EventKind,
}

/// Registered collection with its temporal extent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    /// Identity
    pub id: CollectionId,
    /// Start of the temporal extent
    pub extent_start: DateTime<Utc>,
    /// End of the temporal extent; `None` for ongoing collections
    pub extent_end: Option<DateTime<Utc>>,
}

impl Collection {
    /// Returns the extent as a range, using the open-end sentinel for
    /// ongoing collections.
    pub fn extent(&self) -> TimeRange {
        TimeRange {
            start: self.extent_start,
            end: self.extent_end.unwrap_or_else(crate::ranges::open_end),
        }
    }
}

/// A stored gap row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GapRecord {
    /// Row id
    pub gap_id: i64,
    /// Gap range
    pub range: TimeRange,
}

/// A stored known-gap annotation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    /// Row id
    pub reason_id: i64,
    /// Collection key
    pub collection_id: String,
    /// Annotated range start
    pub start_ts: DateTime<Utc>,
    /// Annotated range end
    pub end_ts: DateTime<Utc>,
    /// Operator-supplied explanation
    pub reason: String,
}

impl Reason {
    /// Returns the annotated range.
    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.start_ts,
            end: self.end_ts,
        }
    }
}
