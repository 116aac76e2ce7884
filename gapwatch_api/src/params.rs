//! Query parameter parsing.
//!
//! Parameter names follow the public interface: `short_name`, `version`,
//! `tolerance`, `knownGap`, `startDate`, `endDate` and `output`.

use chrono::{DateTime, Utc};
use gapwatch_core::ranges::parse_timestamp;
use gapwatch_core::registry::BackfillMode;
use gapwatch_core::{CollectionId, KnownGapMode, ToleranceMode};

use crate::error::{ApiError, Result};
use crate::request::ApiRequest;

/// Report output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON report body
    #[default]
    Json,
    /// `gap_begin,gap_end` rows
    Csv,
}

/// Reads `short_name` and `version` into a collection id.
pub fn collection_id(request: &ApiRequest) -> Result<CollectionId> {
    match (request.get("short_name"), request.get("version")) {
        (Some(short_name), Some(version)) if !short_name.is_empty() && !version.is_empty() => {
            Ok(CollectionId::new(short_name, version)?)
        }
        _ => Err(ApiError::bad_request(
            "Missing query parameters: short_name or version",
        )),
    }
}

/// Reads `tolerance`: `true` uses the configured tolerance, `false` or
/// absent disables it, and a number of seconds overrides it.
pub fn tolerance(request: &ApiRequest) -> Result<ToleranceMode> {
    let Some(value) = request.get("tolerance") else {
        return Ok(ToleranceMode::Off);
    };
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(ToleranceMode::Configured),
        "false" => Ok(ToleranceMode::Off),
        other => other.parse::<u64>().map(ToleranceMode::Override).map_err(|_| {
            ApiError::bad_request(
                "Tolerance flag should be either 'true', 'false' or a number of seconds",
            )
        }),
    }
}

/// Reads `knownGap`: `true` and `exclude` drop annotated spans, `annotate`
/// attaches reasons, `false` or absent ignores annotations.
pub fn known_gap(request: &ApiRequest) -> Result<KnownGapMode> {
    let Some(value) = request.get("knownGap") else {
        return Ok(KnownGapMode::Ignore);
    };
    match value.to_ascii_lowercase().as_str() {
        "true" | "exclude" => Ok(KnownGapMode::Exclude),
        "annotate" => Ok(KnownGapMode::Annotate),
        "false" => Ok(KnownGapMode::Ignore),
        _ => Err(ApiError::bad_request(
            "Known gap flag should be one of 'true', 'false', 'exclude' or 'annotate'",
        )),
    }
}

/// Reads an optional date parameter (`YYYY-MM-DD` or RFC 3339).
pub fn date(request: &ApiRequest, name: &str) -> Result<Option<DateTime<Utc>>> {
    request
        .get(name)
        .map(|value| {
            parse_timestamp(value).map_err(|_| {
                ApiError::bad_request(format!("{} needs to be in format YEAR-MONTH-DAY", name))
            })
        })
        .transpose()
}

/// Reads `startDate` and `endDate`, rejecting an inverted window.
pub fn window(request: &ApiRequest) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
    let start = date(request, "startDate")?;
    let end = date(request, "endDate")?;
    if let (Some(start), Some(end)) = (start, end) {
        if start > end {
            return Err(ApiError::bad_request("Start date is greater than end date"));
        }
    }
    Ok((start, end))
}

/// Reads `output`.
pub fn output(request: &ApiRequest) -> Result<OutputFormat> {
    match request.get("output").map(str::to_ascii_lowercase).as_deref() {
        None | Some("") | Some("json") => Ok(OutputFormat::Json),
        Some("csv") => Ok(OutputFormat::Csv),
        Some(other) => Err(ApiError::bad_request(format!("unsupported output format '{}'", other))),
    }
}

/// Parses the `backfill` field of a configure body.
pub fn backfill_mode(value: Option<&str>) -> Result<BackfillMode> {
    match value.map(str::to_ascii_lowercase).as_deref() {
        None | Some("") | Some("default") => Ok(BackfillMode::Default),
        Some("force") => Ok(BackfillMode::Force),
        Some("skip") | Some("none") => Ok(BackfillMode::Skip),
        Some(other) => Err(ApiError::bad_request(format!(
            "backfill must be one of 'force', 'skip' or empty, got '{}'",
            other
        ))),
    }
}
