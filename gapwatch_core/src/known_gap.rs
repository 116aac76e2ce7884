//! Known-gap annotations.
//!
//! Operators explain expected gaps by attaching free-text reasons to time
//! ranges. Reasons live beside gap rows and are never touched by the update
//! engine; they may overlap each other and span any number of gaps.
//!
//! Payloads are validated at the boundary into an [`Annotation`], so a
//! malformed request is rejected before anything is written.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GapError, Result};
use crate::ranges::{parse_timestamp, TimeRange};
use crate::storage::GapStore;
use crate::types::{CollectionId, Reason};

/// Longest accepted reason, in characters.
pub const MAX_REASON_CHARS: usize = 255;

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+(\.\d+)*$").expect("static version pattern"))
}

/// Validated annotation operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnnotationOp {
    /// Attach a new reason to the range.
    Create {
        /// Explanation
        reason: String,
    },
    /// Rewrite reasons lying inside the range.
    Update {
        /// Replacement explanation
        reason: String,
    },
    /// Remove reasons lying inside the range.
    Delete,
}

impl AnnotationOp {
    /// Lowercase operation name.
    pub fn name(&self) -> &'static str {
        match self {
            AnnotationOp::Create { .. } => "create",
            AnnotationOp::Update { .. } => "update",
            AnnotationOp::Delete => "delete",
        }
    }
}

/// A validated annotation request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Annotation {
    /// Target collection
    pub collection: CollectionId,
    /// Annotated range `[gap_begin, gap_end)`
    pub range: TimeRange,
    /// What to do
    pub op: AnnotationOp,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CollectionRef {
    short_name: Option<String>,
    version: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAnnotation {
    operation: Option<String>,
    collection: Option<CollectionRef>,
    gap_begin: Option<String>,
    gap_end: Option<String>,
    reason: Option<String>,
}

impl Annotation {
    /// Validates a JSON payload of the form
    ///
    /// ```json
    /// {
    ///   "operation": "create",
    ///   "collection": {"short_name": "MODIS_A", "version": "6.1"},
    ///   "gap_begin": "2020-01-01T00:00:00Z",
    ///   "gap_end": "2020-01-02T00:00:00Z",
    ///   "reason": "instrument safe mode"
    /// }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`GapError::Validation`] naming the first failed constraint.
    pub fn from_json(value: &Value) -> Result<Self> {
        let raw: RawAnnotation = serde_json::from_value(value.clone())
            .map_err(|e| GapError::validation(e.to_string()))?;

        let op = match raw.operation.as_deref() {
            Some("create") => AnnotationOp::Create {
                reason: require_reason("create", raw.reason)?,
            },
            Some("update") => AnnotationOp::Update {
                reason: require_reason("update", raw.reason)?,
            },
            Some("delete") => {
                if raw.reason.is_some() {
                    return Err(GapError::validation(
                        "Operation 'delete' should not include a reason",
                    ));
                }
                AnnotationOp::Delete
            }
            _ => {
                return Err(GapError::validation(
                    "Invalid operation. Must be one of: create, update, delete",
                ))
            }
        };

        let collection = match raw.collection {
            Some(CollectionRef {
                short_name: Some(short_name),
                version: Some(version),
            }) => {
                if !version_pattern().is_match(&version) {
                    return Err(GapError::validation(format!(
                        "version '{}' does not match pattern ^\\d+(\\.\\d+)*$",
                        version
                    )));
                }
                CollectionId::new(short_name, version)?
            }
            _ => {
                return Err(GapError::validation(
                    "`short_name` and `version` are required",
                ))
            }
        };

        let begin = raw
            .gap_begin
            .ok_or_else(|| GapError::validation("gap_begin is required"))?;
        let end = raw
            .gap_end
            .ok_or_else(|| GapError::validation("gap_end is required"))?;
        let range = annotation_range(&begin, &end)?;

        Ok(Self {
            collection,
            range,
            op,
        })
    }

    /// Parses and validates a JSON request body.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| GapError::validation(format!("Invalid JSON: {}", e)))?;
        Self::from_json(&value)
    }
}

fn require_reason(operation: &str, reason: Option<String>) -> Result<String> {
    let reason = reason.ok_or_else(|| {
        GapError::validation(format!("Operation '{}' requires a reason", operation))
    })?;
    let chars = reason.chars().count();
    if chars == 0 || chars > MAX_REASON_CHARS {
        return Err(GapError::validation(format!(
            "reason must be between 1 and {} characters",
            MAX_REASON_CHARS
        )));
    }
    Ok(reason)
}

/// Parses an annotation range; it must be at least one second long.
pub fn annotation_range(begin: &str, end: &str) -> Result<TimeRange> {
    let range = TimeRange::new(parse_timestamp(begin)?, parse_timestamp(end)?)
        .map_err(|_| GapError::validation("gap_begin must be before gap_end"))?;
    if range.duration() < chrono::Duration::seconds(1) {
        return Err(GapError::validation(
            "annotated range must be at least 1 second long",
        ));
    }
    Ok(range)
}

/// Result of an applied annotation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AnnotationResult {
    /// Operation name
    pub operation: String,
    /// Rows created, changed or removed
    pub affected: usize,
    /// Human-readable summary
    pub message: String,
}

/// Known-gap annotation store.
#[derive(Clone, Debug)]
pub struct KnownGapStore {
    store: GapStore,
}

impl KnownGapStore {
    /// Creates an annotation store over `store`.
    pub fn new(store: GapStore) -> Self {
        Self { store }
    }

    /// Applies a validated annotation.
    ///
    /// # Errors
    ///
    /// - [`GapError::NotRegistered`] if the collection does not exist
    /// - [`GapError::NotFound`] if an update or delete matches no reason
    pub async fn apply(&self, annotation: &Annotation) -> Result<AnnotationResult> {
        let id = &annotation.collection;
        let range = &annotation.range;
        let affected = match &annotation.op {
            AnnotationOp::Create { reason } => {
                self.store.insert_reason(id, range, reason).await?;
                1
            }
            AnnotationOp::Update { reason } => {
                self.store.update_reasons_within(id, range, reason).await?
            }
            AnnotationOp::Delete => self.store.delete_reasons_within(id, range).await?,
        };

        if affected == 0 {
            self.store.require_collection(id).await?;
            return Err(GapError::NotFound(format!(
                "no reasons found in range {} for collection {}",
                range,
                id.key()
            )));
        }

        let message = match &annotation.op {
            AnnotationOp::Create { reason } => format!("Added reason '{}' for range {}", reason, range),
            AnnotationOp::Update { reason } => {
                format!("Updated reason to '{}' for {} annotations in range", reason, affected)
            }
            AnnotationOp::Delete => format!("Deleted {} annotations in range", affected),
        };
        tracing::info!(
            collection = %id.key(),
            operation = annotation.op.name(),
            affected,
            "known gap annotation applied"
        );

        Ok(AnnotationResult {
            operation: annotation.op.name().to_string(),
            affected,
            message,
        })
    }

    /// Returns every reason intersecting `range`.
    pub async fn lookup(&self, id: &CollectionId, range: &TimeRange) -> Result<Vec<Reason>> {
        self.store.require_collection(id).await?;
        self.store.reasons_intersecting(id, range).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(operation: &str) -> Value {
        json!({
            "operation": operation,
            "collection": {"short_name": "MODIS_A", "version": "6.1"},
            "gap_begin": "2020-01-01T00:00:00Z",
            "gap_end": "2020-01-02T00:00:00Z",
        })
    }

    fn message(err: GapError) -> String {
        match err {
            GapError::Validation(msg) => msg,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_create_requires_reason() {
        let err = Annotation::from_json(&payload("create")).unwrap_err();
        assert_eq!(message(err), "Operation 'create' requires a reason");
    }

    #[test]
    fn test_update_requires_reason() {
        let err = Annotation::from_json(&payload("update")).unwrap_err();
        assert_eq!(message(err), "Operation 'update' requires a reason");
    }

    #[test]
    fn test_delete_rejects_reason() {
        let mut body = payload("delete");
        body["reason"] = json!("not allowed");
        let err = Annotation::from_json(&body).unwrap_err();
        assert_eq!(message(err), "Operation 'delete' should not include a reason");
    }

    #[test]
    fn test_delete_without_reason_accepted() {
        let annotation = Annotation::from_json(&payload("delete")).unwrap();
        assert_eq!(annotation.op, AnnotationOp::Delete);
        assert_eq!(annotation.collection.key(), "MODIS_A___6_1");
    }

    #[test]
    fn test_unknown_operation() {
        let err = Annotation::from_json(&payload("upsert")).unwrap_err();
        assert!(message(err).starts_with("Invalid operation"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut body = payload("delete");
        body["extra"] = json!(1);
        assert!(matches!(
            Annotation::from_json(&body),
            Err(GapError::Validation(_))
        ));
    }

    #[test]
    fn test_reason_length_bounds() {
        let mut body = payload("create");
        body["reason"] = json!("");
        assert!(Annotation::from_json(&body).is_err());

        body["reason"] = json!("x".repeat(256));
        assert!(Annotation::from_json(&body).is_err());

        body["reason"] = json!("x".repeat(255));
        assert!(Annotation::from_json(&body).is_ok());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut body = payload("delete");
        body["gap_begin"] = json!("2020-01-03T00:00:00Z");
        let err = Annotation::from_json(&body).unwrap_err();
        assert_eq!(message(err), "gap_begin must be before gap_end");
    }

    #[test]
    fn test_sub_second_range_rejected() {
        let mut body = payload("delete");
        body["gap_end"] = json!("2020-01-01T00:00:00.500Z");
        assert!(Annotation::from_json(&body).is_err());
    }

    #[test]
    fn test_version_must_be_dotted_numeric() {
        for bad in ["v6", "6.", "6..1", "V1"] {
            let mut body = payload("delete");
            body["collection"]["version"] = json!(bad);
            let err = Annotation::from_json(&body).unwrap_err();
            assert!(message(err).contains("does not match pattern"), "{} accepted", bad);
        }

        for good in ["6", "6.1", "2.3.1", "061"] {
            let mut body = payload("delete");
            body["collection"]["version"] = json!(good);
            assert!(Annotation::from_json(&body).is_ok(), "{} rejected", good);
        }
    }
}
