//! Request surface tests against a real store in a scratch directory.

use std::sync::Arc;

use gapwatch_api::{ApiRequest, ApiResponse, GapApi, Method};
use gapwatch_core::catalog::{DataUnit, StaticCatalog};
use gapwatch_core::ranges::parse_timestamp;
use gapwatch_core::{Collection, CollectionId, Gapwatch, GapwatchConfig};
use serde_json::{json, Value};

fn january() -> Collection {
    Collection {
        id: CollectionId::new("VNP46A1", "1.0").unwrap(),
        extent_start: parse_timestamp("2020-01-01").unwrap(),
        extent_end: Some(parse_timestamp("2020-02-01").unwrap()),
    }
}

/// Catalog holding January with daily units for the first ten days.
async fn catalog() -> Arc<StaticCatalog> {
    let catalog = Arc::new(StaticCatalog::new());
    let collection = january();
    let id = collection.id.clone();
    catalog.insert_collection(collection).await;
    catalog
        .add_units(
            &id,
            (1..=10).map(|day| DataUnit {
                id: format!("G{}", day),
                start: parse_timestamp(&format!("2020-01-{:02}T00:00:00Z", day)).unwrap(),
                end: parse_timestamp(&format!("2020-01-{:02}T23:59:59.9Z", day)).unwrap(),
            }),
        )
        .await;
    catalog
}

async fn api_with(config: GapwatchConfig) -> GapApi {
    let gapwatch = Gapwatch::open(config, catalog().await).await.unwrap();
    GapApi::new(gapwatch)
}

async fn api(dir: &tempfile::TempDir) -> GapApi {
    api_with(GapwatchConfig::in_dir(dir.path())).await
}

fn collection_params() -> ApiRequest {
    ApiRequest::new().param("short_name", "VNP46A1").param("version", "1.0")
}

fn configure_body(tolerance: Option<u64>) -> ApiRequest {
    let mut entry = json!({"short_name": "VNP46A1", "version": "1.0"});
    if let Some(secs) = tolerance {
        entry["tolerance"] = json!(secs);
    }
    ApiRequest::new().json(&json!({ "collections": [entry] }))
}

fn body(response: &ApiResponse) -> Value {
    response.json_body().unwrap()
}

#[tokio::test]
async fn test_bootstrap_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let api = api(&dir).await;

    for _ in 0..2 {
        let response = api.handle(Method::Post, "/bootstrap", &ApiRequest::new()).await;
        assert_eq!(response.status, 200);
        assert_eq!(body(&response)["outcome"], "already_present");
    }
}

#[tokio::test]
async fn test_configure_then_query() {
    let dir = tempfile::tempdir().unwrap();
    let api = api(&dir).await;

    let response = api
        .handle(Method::Post, "/configure", &configure_body(Some(86_400)))
        .await;
    assert_eq!(response.status, 200, "{}", response.body);
    let outcome = &body(&response)["collections"][0];
    assert_eq!(outcome["collection"], "VNP46A1___1_0");
    assert_eq!(outcome["registered"], true);
    assert_eq!(outcome["backfill"]["status"], "completed");
    assert_eq!(outcome["backfill"]["units"], 10);

    let response = api.handle(Method::Get, "/gaps", &collection_params()).await;
    assert_eq!(response.status, 200);
    let gaps = body(&response);
    assert_eq!(gaps["collection"], "VNP46A1___1_0");
    assert_eq!(gaps["gapTolerance"], 0);
    assert_eq!(gaps["timeGaps"].as_array().unwrap().len(), 1);
    assert_eq!(gaps["timeGaps"][0]["start"], "2020-01-11T00:00:00Z");
    assert_eq!(gaps["timeGaps"][0]["end"], "2020-02-01T00:00:00Z");

    let response = api
        .handle(Method::Get, "/gaps", &collection_params().param("tolerance", "true"))
        .await;
    assert_eq!(body(&response)["gapTolerance"], 86_400);

    // Second configure keeps the collection and skips backfill.
    let response = api.handle(Method::Post, "/configure", &configure_body(None)).await;
    assert_eq!(response.status, 200);
    let outcome = &body(&response)["collections"][0];
    assert_eq!(outcome["registered"], false);
    assert_eq!(outcome["backfill"]["status"], "skipped");
}

#[tokio::test]
async fn test_query_window_outside_gaps_reports_none() {
    let dir = tempfile::tempdir().unwrap();
    let api = api(&dir).await;
    api.handle(Method::Post, "/configure", &configure_body(None)).await;

    let request = collection_params()
        .param("startDate", "2020-01-02")
        .param("endDate", "2020-01-05");
    let response = api.handle(Method::Get, "/gaps", &request).await;
    assert_eq!(response.status, 200);
    let gaps = body(&response);
    assert!(gaps["timeGaps"].as_array().unwrap().is_empty());
    assert_eq!(gaps["message"], "No qualifying time gaps found.");
}

#[tokio::test]
async fn test_configure_rejections() {
    let dir = tempfile::tempdir().unwrap();
    let api = api(&dir).await;

    let missing_version = ApiRequest::new().json(&json!({"collections": [{"short_name": "VNP46A1"}]}));
    let response = api.handle(Method::Post, "/configure", &missing_version).await;
    assert_eq!(response.status, 400);

    let response = api.handle(Method::Post, "/configure", &ApiRequest::new()).await;
    assert_eq!(response.status, 400);
    assert_eq!(body(&response)["message"], "Bad request: Missing request body");

    let unknown = ApiRequest::new().json(&json!({"collections": [{"short_name": "NOPE", "version": "2"}]}));
    let response = api.handle(Method::Post, "/configure", &unknown).await;
    assert_eq!(response.status, 404);

    let bad_mode = ApiRequest::new().json(&json!({
        "collections": [{"short_name": "VNP46A1", "version": "1.0"}],
        "backfill": "later"
    }));
    let response = api.handle(Method::Post, "/configure", &bad_mode).await;
    assert_eq!(response.status, 400);
}

#[tokio::test]
async fn test_oversized_configure_without_async_path() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = GapwatchConfig::in_dir(dir.path());
    config.backfill.interactive_ceiling = 5;
    let api = api_with(config).await;

    let response = api.handle(Method::Post, "/configure", &configure_body(None)).await;
    assert_eq!(response.status, 413);
}

#[tokio::test]
async fn test_query_rejections() {
    let dir = tempfile::tempdir().unwrap();
    let api = api(&dir).await;

    let response = api.handle(Method::Get, "/gaps", &collection_params()).await;
    assert_eq!(response.status, 400);
    assert_eq!(
        body(&response)["message"],
        "Collection VNP46A1___1_0 has not been initialized for gap detection"
    );

    api.handle(Method::Post, "/configure", &configure_body(None)).await;

    let response = api
        .handle(Method::Get, "/gaps", &ApiRequest::new().param("short_name", "VNP46A1"))
        .await;
    assert_eq!(response.status, 400);

    let response = api
        .handle(Method::Get, "/gaps", &collection_params().param("tolerance", "sometimes"))
        .await;
    assert_eq!(response.status, 400);

    let inverted = collection_params()
        .param("startDate", "2020-01-20")
        .param("endDate", "2020-01-10");
    let response = api.handle(Method::Get, "/gaps", &inverted).await;
    assert_eq!(response.status, 400);
    assert_eq!(body(&response)["message"], "Bad request: Start date is greater than end date");
}

#[tokio::test]
async fn test_known_gap_annotation_flow() {
    let dir = tempfile::tempdir().unwrap();
    let api = api(&dir).await;
    api.handle(Method::Post, "/configure", &configure_body(None)).await;

    let create = ApiRequest::new().json(&json!({
        "operation": "create",
        "collection": {"short_name": "VNP46A1", "version": "1.0"},
        "gap_begin": "2020-01-11T00:00:00Z",
        "gap_end": "2020-01-21T00:00:00Z",
        "reason": "instrument safe mode"
    }));
    let response = api.handle(Method::Put, "/known-gaps", &create).await;
    assert_eq!(response.status, 200, "{}", response.body);
    assert_eq!(body(&response)["affected"], 1);

    let lookup = collection_params()
        .param("startDate", "2020-01-01")
        .param("endDate", "2020-02-01");
    let response = api.handle(Method::Get, "/known-gaps", &lookup).await;
    assert_eq!(response.status, 200);
    let reasons = body(&response)["reasons"].as_array().unwrap().clone();
    assert_eq!(reasons.len(), 1);
    assert_eq!(reasons[0]["reason"], "instrument safe mode");

    let excluded = collection_params().param("knownGap", "true");
    let response = api.handle(Method::Get, "/gaps", &excluded).await;
    let gaps = body(&response);
    assert_eq!(gaps["timeGaps"].as_array().unwrap().len(), 1);
    assert_eq!(gaps["timeGaps"][0]["start"], "2020-01-21T00:00:00Z");

    let annotated = collection_params().param("knownGap", "annotate");
    let response = api.handle(Method::Get, "/gaps", &annotated).await;
    assert_eq!(body(&response)["timeGaps"][0]["reasons"][0], "instrument safe mode");

    let delete = ApiRequest::new().json(&json!({
        "operation": "delete",
        "collection": {"short_name": "VNP46A1", "version": "1.0"},
        "gap_begin": "2020-01-01T00:00:00Z",
        "gap_end": "2020-02-01T00:00:00Z"
    }));
    let response = api.handle(Method::Put, "/known-gaps", &delete).await;
    assert_eq!(response.status, 200);
    assert_eq!(body(&response)["affected"], 1);

    let response = api.handle(Method::Put, "/known-gaps", &delete).await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_known_gap_rejections() {
    let dir = tempfile::tempdir().unwrap();
    let api = api(&dir).await;

    let response = api.handle(Method::Put, "/known-gaps", &ApiRequest::new()).await;
    assert_eq!(response.status, 400);

    let response = api
        .handle(Method::Put, "/known-gaps", &ApiRequest::new().body("not json"))
        .await;
    assert_eq!(response.status, 400);

    let response = api.handle(Method::Get, "/known-gaps", &collection_params()).await;
    assert_eq!(response.status, 400);

    let delete_with_reason = ApiRequest::new().json(&json!({
        "operation": "delete",
        "collection": {"short_name": "VNP46A1", "version": "1.0"},
        "gap_begin": "2020-01-01T00:00:00Z",
        "gap_end": "2020-02-01T00:00:00Z",
        "reason": "x"
    }));
    let response = api.handle(Method::Put, "/known-gaps", &delete_with_reason).await;
    assert_eq!(response.status, 400);
}

#[tokio::test]
async fn test_report_read_path() {
    let dir = tempfile::tempdir().unwrap();
    let api = api(&dir).await;
    api.handle(Method::Post, "/configure", &configure_body(None)).await;

    let response = api.handle(Method::Get, "/report", &collection_params()).await;
    assert_eq!(response.status, 404);

    api.gapwatch().reporter().run_once().await.unwrap();

    let response = api.handle(Method::Get, "/report", &collection_params()).await;
    assert_eq!(response.status, 200);
    let report = body(&response);
    assert_eq!(report["collection"], "VNP46A1___1_0");
    assert_eq!(report["significant_gaps"].as_array().unwrap().len(), 1);

    let response = api
        .handle(Method::Get, "/report", &collection_params().param("output", "csv"))
        .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type, "text/csv");
    assert_eq!(
        response.attachment.as_deref(),
        Some("VNP46A1___1_0_filtered_time_gaps.csv")
    );
    let mut lines = response.body.lines();
    assert_eq!(lines.next(), Some("gap_begin,gap_end"));
    assert!(lines.next().unwrap().starts_with("2020-01-11T00:00:00"));
}

#[tokio::test]
async fn test_unknown_route_and_method() {
    let dir = tempfile::tempdir().unwrap();
    let api = api(&dir).await;

    let response = api.handle(Method::Post, "/gaps", &ApiRequest::new()).await;
    assert_eq!(response.status, 405);

    let response = api.handle(Method::Get, "/nowhere", &ApiRequest::new()).await;
    assert_eq!(response.status, 404);
}
