//! Request handlers.
//!
//! [`GapApi`] maps each public operation onto the core services and turns
//! outcomes into status codes and JSON bodies. Errors never escape
//! [`GapApi::handle`]; they become `{"message": ...}` responses.

use gapwatch_core::known_gap::Annotation;
use gapwatch_core::registry::{BackfillStatus, CollectionSpec};
use gapwatch_core::storage::BootstrapOutcome;
use gapwatch_core::{
    CollectionId, ConfigureRequest, GapQuery, Gapwatch, LatestReport, QueryResult, TimeRange,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, Result};
use crate::params::{self, OutputFormat};
use crate::request::{ApiRequest, ApiResponse, Method};

/// Schema bootstrap route.
pub const ROUTE_BOOTSTRAP: &str = "/bootstrap";
/// Collection registration route.
pub const ROUTE_CONFIGURE: &str = "/configure";
/// Gap query route.
pub const ROUTE_GAPS: &str = "/gaps";
/// Known-gap lookup and annotation route.
pub const ROUTE_KNOWN_GAPS: &str = "/known-gaps";
/// Latest report route.
pub const ROUTE_REPORT: &str = "/report";

const ROUTES: [&str; 5] = [
    ROUTE_BOOTSTRAP,
    ROUTE_CONFIGURE,
    ROUTE_GAPS,
    ROUTE_KNOWN_GAPS,
    ROUTE_REPORT,
];

#[derive(Deserialize)]
struct ConfigureBody {
    collections: Vec<ConfigureEntry>,
    #[serde(default)]
    backfill: Option<String>,
}

#[derive(Deserialize)]
struct ConfigureEntry {
    short_name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    tolerance: Option<u64>,
}

/// Request surface over a [`Gapwatch`] instance.
#[derive(Clone, Debug)]
pub struct GapApi {
    gapwatch: Gapwatch,
}

impl GapApi {
    /// Creates the surface.
    pub fn new(gapwatch: Gapwatch) -> Self {
        Self { gapwatch }
    }

    /// Returns the wrapped services.
    pub fn gapwatch(&self) -> &Gapwatch {
        &self.gapwatch
    }

    /// Dispatches `request` by method and route.
    pub async fn handle(&self, method: Method, route: &str, request: &ApiRequest) -> ApiResponse {
        let result = match (method, route) {
            (Method::Post, ROUTE_BOOTSTRAP) => self.bootstrap().await,
            (Method::Post, ROUTE_CONFIGURE) => self.configure(request).await,
            (Method::Get, ROUTE_GAPS) => self.query_gaps(request).await,
            (Method::Get, ROUTE_KNOWN_GAPS) => self.known_gaps(request).await,
            (Method::Put, ROUTE_KNOWN_GAPS) => self.annotate(request).await,
            (Method::Get, ROUTE_REPORT) => self.report(request).await,
            (_, route) if ROUTES.contains(&route) => Err(ApiError::MethodNotAllowed(method)),
            (_, route) => Err(ApiError::UnknownRoute(route.to_string())),
        };

        match result {
            Ok(response) => {
                tracing::info!(%method, route, status = response.status, "request handled");
                response
            }
            Err(err) => {
                let status = err.status();
                if status >= 500 {
                    tracing::error!(%method, route, status, error = %err, "request failed");
                } else {
                    tracing::warn!(%method, route, status, error = %err, "request rejected");
                }
                err.into_response()
            }
        }
    }

    /// Creates the schema if needed. Repeating it is a no-op.
    pub async fn bootstrap(&self) -> Result<ApiResponse> {
        let outcome = self.gapwatch.store().bootstrap().await?;
        let message = match outcome {
            BootstrapOutcome::Created => "Schema created",
            BootstrapOutcome::AlreadyPresent => "Schema already present",
        };
        Ok(ApiResponse::json(
            200,
            &json!({ "message": message, "outcome": outcome }),
        ))
    }

    /// Registers collections from a body of the form
    /// `{"collections": [{"short_name", "version", "tolerance"?}], "backfill"?}`.
    ///
    /// Responds 202 when any backfill was deferred to the asynchronous path.
    pub async fn configure(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let bytes = request
            .body
            .as_deref()
            .ok_or_else(|| ApiError::bad_request("Missing request body"))?;
        let body: ConfigureBody = serde_json::from_slice(bytes)
            .map_err(|e| ApiError::bad_request(format!("Error processing request: {}", e)))?;
        if body.collections.is_empty() {
            return Err(ApiError::bad_request("collections must not be empty"));
        }

        let mut collections = Vec::with_capacity(body.collections.len());
        for entry in body.collections {
            let (Some(short_name), Some(version)) = (entry.short_name, entry.version) else {
                return Err(ApiError::bad_request("`short_name` and `version` are required"));
            };
            collections.push(CollectionSpec {
                id: CollectionId::new(short_name, version)?,
                tolerance_secs: entry.tolerance,
            });
        }
        let configure = ConfigureRequest {
            collections,
            backfill: params::backfill_mode(body.backfill.as_deref())?,
        };

        let outcomes = self.gapwatch.registry().configure(&configure).await?;
        let deferred = outcomes
            .iter()
            .any(|o| matches!(o.backfill, BackfillStatus::Deferred { .. }));
        let status = if deferred { 202 } else { 200 };
        Ok(ApiResponse::json(
            status,
            &json!({
                "message": format!("Configured {} collection(s)", outcomes.len()),
                "collections": serde_json::to_value(&outcomes)?,
            }),
        ))
    }

    /// Answers a gap query from query parameters.
    ///
    /// Results too large to return inline are answered with a reference to
    /// the stored result.
    pub async fn query_gaps(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let id = params::collection_id(request)?;
        let tolerance = params::tolerance(request)?;
        let known_gaps = params::known_gap(request)?;
        let (start, end) = params::window(request)?;

        let query = GapQuery::new(id)
            .between(start, end)
            .with_tolerance(tolerance)
            .with_known_gaps(known_gaps);

        match self.gapwatch.queries().query(&query).await? {
            QueryResult::Inline(body) => {
                let mut value = serde_json::to_value(&body)?;
                if body.time_gaps.is_empty() {
                    if let Value::Object(map) = &mut value {
                        map.insert("message".into(), json!("No qualifying time gaps found."));
                    }
                }
                Ok(ApiResponse::json(200, &value))
            }
            QueryResult::Offloaded {
                reference,
                gap_count,
            } => Ok(ApiResponse::json(
                200,
                &json!({
                    "message": "Too many results for response, use the result URL",
                    "result_url": reference.uri,
                    "key": reference.key,
                    "size": reference.size,
                    "gap_count": gap_count,
                }),
            )),
        }
    }

    /// Lists known-gap reasons intersecting `startDate..endDate`.
    pub async fn known_gaps(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let id = params::collection_id(request)?;
        let (start, end) = match params::window(request)? {
            (Some(start), Some(end)) => (start, end),
            _ => return Err(ApiError::bad_request("startDate and endDate are required")),
        };
        let range = TimeRange::new(start, end)?;

        let reasons = self.gapwatch.known_gaps().lookup(&id, &range).await?;
        Ok(ApiResponse::json(
            200,
            &json!({
                "collection": id.key(),
                "reasons": serde_json::to_value(&reasons)?,
            }),
        ))
    }

    /// Creates, updates or deletes known-gap reasons from a JSON body.
    pub async fn annotate(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let bytes = request
            .body
            .as_deref()
            .ok_or_else(|| ApiError::bad_request("Missing request body"))?;
        let annotation = Annotation::from_slice(bytes)?;
        let result = self.gapwatch.known_gaps().apply(&annotation).await?;
        Ok(ApiResponse::json(200, &serde_json::to_value(&result)?))
    }

    /// Returns the latest completeness report, as JSON or CSV.
    pub async fn report(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let id = params::collection_id(request)?;
        let format = params::output(request)?;

        match self.gapwatch.reporter().latest(&id).await? {
            LatestReport::Inline(report) => match format {
                OutputFormat::Csv => Ok(ApiResponse::csv(
                    report.to_csv(),
                    format!("{}_filtered_time_gaps.csv", id.key()),
                )),
                OutputFormat::Json => Ok(ApiResponse::json(200, &serde_json::to_value(&report)?)),
            },
            LatestReport::Offloaded(reference) => Ok(ApiResponse::json(
                200,
                &json!({
                    "message": "File too large for direct download, use the result URL",
                    "result_url": reference.uri,
                    "key": reference.key,
                    "size": reference.size,
                }),
            )),
        }
    }
}
