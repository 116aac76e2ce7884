//! End-to-end tests for registration, event application and queries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gapwatch_core::catalog::{DataUnit, StaticCatalog};
use gapwatch_core::known_gap::Annotation;
use gapwatch_core::objects::ObjectStore;
use gapwatch_core::ranges::parse_timestamp;
use gapwatch_core::registry::{BackfillMode, BackfillStatus, CollectionSpec};
use gapwatch_core::retry::RetryConfig;
use gapwatch_core::{
    Collection, CollectionId, ConfigureRequest, EventKind, EventRecord, GapError, GapQuery,
    Gapwatch, GapwatchConfig, KnownGapMode, QueryResult, TimeRange, ToleranceMode,
};

fn ts(s: &str) -> DateTime<Utc> {
    parse_timestamp(s).unwrap()
}

fn r(a: &str, b: &str) -> TimeRange {
    TimeRange::new(ts(a), ts(b)).unwrap()
}

fn january() -> Collection {
    Collection {
        id: CollectionId::new("MOD09", "6.1").unwrap(),
        extent_start: ts("2020-01-01"),
        extent_end: Some(ts("2020-02-01")),
    }
}

fn added(id: &str, collection: &CollectionId, start: &str, end: &str) -> EventRecord {
    EventRecord::new(id, collection, ts(start), ts(end), EventKind::DataAdded)
}

fn removed(id: &str, collection: &CollectionId, start: &str, end: &str) -> EventRecord {
    EventRecord::new(id, collection, ts(start), ts(end), EventKind::DataRemoved)
}

async fn open(dir: &tempfile::TempDir) -> Gapwatch {
    let mut config = GapwatchConfig::in_dir(dir.path());
    config.retry = RetryConfig {
        max_retries: 50,
        initial_delay_ms: 1,
        max_delay_ms: 20,
        backoff_factor: 2.0,
        jitter: true,
    };
    Gapwatch::open(config, Arc::new(StaticCatalog::new())).await.unwrap()
}

async fn gap_ranges(gapwatch: &Gapwatch, id: &CollectionId) -> Vec<TimeRange> {
    gapwatch
        .store()
        .all_gaps(id)
        .await
        .unwrap()
        .into_iter()
        .map(|g| g.range)
        .collect()
}

fn inline(result: QueryResult) -> gapwatch_core::query::GapQueryBody {
    match result {
        QueryResult::Inline(body) => body,
        other => panic!("expected inline result, got {:?}", other),
    }
}

#[tokio::test]
async fn test_added_unit_splits_gap_and_tolerance_merges() {
    let dir = tempfile::tempdir().unwrap();
    let gapwatch = open(&dir).await;
    let collection = january();
    let id = collection.id.clone();
    gapwatch.store().register(&collection).await.unwrap();

    let outcome = gapwatch
        .engine()
        .apply_batch(vec![added("m1", &id, "2020-01-10", "2020-01-14T23:59:59Z")])
        .await
        .unwrap();
    assert!(outcome.is_complete());

    assert_eq!(
        gap_ranges(&gapwatch, &id).await,
        vec![r("2020-01-01", "2020-01-10"), r("2020-01-15", "2020-02-01")]
    );

    let body = inline(
        gapwatch
            .queries()
            .query(&GapQuery::new(id.clone()).with_tolerance(ToleranceMode::Override(6 * 86_400)))
            .await
            .unwrap(),
    );
    assert_eq!(body.time_gaps.len(), 1);
    assert_eq!(body.time_gaps[0].start, ts("2020-01-01"));
    assert_eq!(body.time_gaps[0].end, ts("2020-02-01"));
    assert_eq!(body.gap_tolerance, 6 * 86_400);
}

#[tokio::test]
async fn test_redelivered_batch_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let gapwatch = open(&dir).await;
    let collection = january();
    let id = collection.id.clone();
    gapwatch.store().register(&collection).await.unwrap();

    let batch = vec![added("m1", &id, "2020-01-10", "2020-01-14T23:59:59Z")];
    gapwatch.engine().apply_batch(batch.clone()).await.unwrap();
    let first = gap_ranges(&gapwatch, &id).await;

    let replay = gapwatch.engine().apply_batch(batch).await.unwrap();
    assert!(replay.is_complete());
    assert_eq!(replay.collections_changed, 0);
    assert_eq!(gap_ranges(&gapwatch, &id).await, first);
}

#[tokio::test]
async fn test_concurrent_disjoint_batches_lose_no_update() {
    let dir = tempfile::tempdir().unwrap();
    let gapwatch = open(&dir).await;
    let collection = january();
    let id = collection.id.clone();
    gapwatch.store().register(&collection).await.unwrap();

    let mut handles = Vec::new();
    for day in 2..=28u32 {
        let engine = gapwatch.engine();
        let record = added(
            &format!("m{}", day),
            &id,
            &format!("2020-01-{:02}T00:00:00Z", day),
            &format!("2020-01-{:02}T11:59:59Z", day),
        );
        handles.push(tokio::spawn(async move { engine.apply_batch(vec![record]).await }));
    }
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.is_complete(), "failures: {:?}", outcome.failures);
    }

    let gaps = gap_ranges(&gapwatch, &id).await;
    let mut expected = vec![r("2020-01-01", "2020-01-02")];
    for day in 2..=27u32 {
        expected.push(r(
            &format!("2020-01-{:02}T12:00:00Z", day),
            &format!("2020-01-{:02}T00:00:00Z", day + 1),
        ));
    }
    expected.push(r("2020-01-28T12:00:00Z", "2020-02-01"));
    assert_eq!(gaps, expected);
}

#[tokio::test]
async fn test_full_coverage_leaves_no_gaps_and_removal_restores() {
    let dir = tempfile::tempdir().unwrap();
    let gapwatch = open(&dir).await;
    let collection = january();
    let id = collection.id.clone();
    gapwatch.store().register(&collection).await.unwrap();

    gapwatch
        .engine()
        .apply_batch(vec![
            added("a", &id, "2020-01-01", "2020-01-15T23:59:59Z"),
            added("b", &id, "2020-01-16", "2020-01-31T23:59:59Z"),
        ])
        .await
        .unwrap();
    assert!(gap_ranges(&gapwatch, &id).await.is_empty());

    gapwatch
        .engine()
        .apply_batch(vec![removed("c", &id, "2020-01-05", "2020-01-06T23:59:59Z")])
        .await
        .unwrap();
    assert_eq!(gap_ranges(&gapwatch, &id).await, vec![r("2020-01-05", "2020-01-07")]);
}

#[tokio::test]
async fn test_back_to_back_units_leave_no_second_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let gapwatch = open(&dir).await;
    let collection = Collection {
        id: CollectionId::new("VNP46A2", "1").unwrap(),
        extent_start: ts("2000-01-01"),
        extent_end: Some(ts("2000-12-31T23:59:59Z")),
    };
    let id = collection.id.clone();
    gapwatch.store().register(&collection).await.unwrap();

    let outcome = gapwatch
        .engine()
        .apply_batch(vec![
            added("june", &id, "2000-06-01", "2000-06-30T23:59:59Z"),
            added("july", &id, "2000-07-01", "2000-07-31T23:59:59Z"),
        ])
        .await
        .unwrap();
    assert!(outcome.is_complete());

    assert_eq!(
        gap_ranges(&gapwatch, &id).await,
        vec![
            r("2000-01-01", "2000-06-01"),
            r("2000-08-01", "2000-12-31T23:59:59Z"),
        ]
    );
}

#[tokio::test]
async fn test_free_form_version_events_apply() {
    let dir = tempfile::tempdir().unwrap();
    let gapwatch = open(&dir).await;
    let collection = Collection {
        id: CollectionId::new("ATL03", "V1").unwrap(),
        extent_start: ts("2020-01-01"),
        extent_end: Some(ts("2020-02-01")),
    };
    let id = collection.id.clone();
    gapwatch.store().register(&collection).await.unwrap();

    let outcome = gapwatch
        .engine()
        .apply_batch(vec![added("v1", &id, "2020-01-01", "2020-01-15T23:59:59Z")])
        .await
        .unwrap();
    assert!(outcome.is_complete(), "failures: {:?}", outcome.failures);
    assert_eq!(outcome.applied, 1);
    assert_eq!(gap_ranges(&gapwatch, &id).await, vec![r("2020-01-16", "2020-02-01")]);
}

#[tokio::test]
async fn test_gaps_stay_disjoint_and_non_adjacent() {
    let dir = tempfile::tempdir().unwrap();
    let gapwatch = open(&dir).await;
    let collection = january();
    let id = collection.id.clone();
    gapwatch.store().register(&collection).await.unwrap();

    let engine = gapwatch.engine();
    engine
        .apply_batch(vec![
            added("a", &id, "2020-01-03", "2020-01-05T23:59:59Z"),
            added("b", &id, "2020-01-10", "2020-01-11T23:59:59Z"),
            added("c", &id, "2020-01-20", "2020-01-24T23:59:59Z"),
        ])
        .await
        .unwrap();
    engine
        .apply_batch(vec![
            removed("d", &id, "2020-01-06", "2020-01-09T23:59:59Z"),
            removed("e", &id, "2020-01-11", "2020-01-20T23:59:59Z"),
            removed("f", &id, "2020-01-31", "2020-02-29T23:59:59Z"),
        ])
        .await
        .unwrap();

    let gaps = gap_ranges(&gapwatch, &id).await;
    for pair in gaps.windows(2) {
        assert!(pair[0].end < pair[1].start, "gaps {:?} touch", pair);
    }
    let extent = collection.extent();
    assert!(gaps.iter().all(|g| extent.contains(g)));
    assert_eq!(
        gaps,
        vec![
            r("2020-01-01", "2020-01-03"),
            r("2020-01-06", "2020-01-10"),
            r("2020-01-11", "2020-01-21"),
            r("2020-01-25", "2020-02-01"),
        ]
    );
}

#[tokio::test]
async fn test_unregistered_and_malformed_records_fail_individually() {
    let dir = tempfile::tempdir().unwrap();
    let gapwatch = open(&dir).await;
    let collection = january();
    let id = collection.id.clone();
    gapwatch.store().register(&collection).await.unwrap();

    let stranger = CollectionId::new("OTHER", "1").unwrap();
    let mut malformed = added("bad", &id, "2020-01-02", "2020-01-03");
    malformed.start_ts = "not a time".into();

    let outcome = gapwatch
        .engine()
        .apply_batch(vec![
            added("ok", &id, "2020-01-02", "2020-01-03"),
            added("stranger", &stranger, "2020-01-02", "2020-01-03"),
            malformed,
        ])
        .await
        .unwrap();

    assert_eq!(outcome.applied, 1);
    let mut failed = outcome.failed_ids();
    failed.sort();
    assert_eq!(failed, vec!["bad".to_string(), "stranger".to_string()]);
}

#[tokio::test]
async fn test_query_validation_and_registration() {
    let dir = tempfile::tempdir().unwrap();
    let gapwatch = open(&dir).await;
    let id = CollectionId::new("NOPE", "1.0").unwrap();

    let err = gapwatch.queries().query(&GapQuery::new(id.clone())).await.unwrap_err();
    assert!(matches!(err, GapError::NotRegistered(_)));

    let backwards = GapQuery::new(id).between(Some(ts("2020-02-01")), Some(ts("2020-01-01")));
    let err = gapwatch.queries().query(&backwards).await.unwrap_err();
    assert!(matches!(err, GapError::Validation(_)));
}

#[tokio::test]
async fn test_known_gap_annotation_and_exclusion() {
    let dir = tempfile::tempdir().unwrap();
    let gapwatch = open(&dir).await;
    let collection = january();
    let id = collection.id.clone();
    gapwatch.store().register(&collection).await.unwrap();
    gapwatch
        .engine()
        .apply_batch(vec![added("m1", &id, "2020-01-10", "2020-01-14T23:59:59Z")])
        .await
        .unwrap();

    let annotation = Annotation::from_json(&serde_json::json!({
        "operation": "create",
        "collection": {"short_name": "MOD09", "version": "6.1"},
        "gap_begin": "2020-01-01T00:00:00Z",
        "gap_end": "2020-01-05T00:00:00Z",
        "reason": "instrument safe mode"
    }))
    .unwrap();
    gapwatch.known_gaps().apply(&annotation).await.unwrap();

    let annotated = inline(
        gapwatch
            .queries()
            .query(&GapQuery::new(id.clone()).with_known_gaps(KnownGapMode::Annotate))
            .await
            .unwrap(),
    );
    assert_eq!(annotated.time_gaps[0].reasons, vec!["instrument safe mode"]);
    assert!(annotated.time_gaps[1].reasons.is_empty());

    let excluded = inline(
        gapwatch
            .queries()
            .query(&GapQuery::new(id).with_known_gaps(KnownGapMode::Exclude))
            .await
            .unwrap(),
    );
    assert_eq!(excluded.time_gaps[0].start, ts("2020-01-05"));
    assert_eq!(excluded.time_gaps[0].end, ts("2020-01-10"));
}

#[tokio::test]
async fn test_large_result_offloaded() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = GapwatchConfig::in_dir(dir.path());
    config.query.max_rows = 1;
    let gapwatch = Gapwatch::open(config, Arc::new(StaticCatalog::new())).await.unwrap();
    let collection = january();
    let id = collection.id.clone();
    gapwatch.store().register(&collection).await.unwrap();
    gapwatch
        .engine()
        .apply_batch(vec![added("m1", &id, "2020-01-10", "2020-01-14T23:59:59Z")])
        .await
        .unwrap();

    match gapwatch.queries().query(&GapQuery::new(id)).await.unwrap() {
        QueryResult::Offloaded { reference, gap_count } => {
            assert_eq!(gap_count, 2);
            let bytes = gapwatch.objects().get(&reference.key).await.unwrap();
            let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(body["timeGaps"].as_array().unwrap().len(), 2);
        }
        other => panic!("expected offloaded result, got {:?}", other),
    }
}

#[tokio::test]
async fn test_configure_registers_and_backfills() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(StaticCatalog::new());
    let collection = january();
    let id = collection.id.clone();
    catalog.insert_collection(collection.clone()).await;
    catalog
        .add_units(
            &id,
            (1..=30).map(|day| DataUnit {
                id: format!("G{}", day),
                start: ts(&format!("2020-01-{:02}T00:00:00Z", day)),
                end: ts(&format!("2020-01-{:02}T23:59:59.5Z", day)),
            }),
        )
        .await;

    let gapwatch = Gapwatch::open(GapwatchConfig::in_dir(dir.path()), catalog).await.unwrap();
    let request = ConfigureRequest {
        collections: vec![CollectionSpec {
            id: id.clone(),
            tolerance_secs: Some(3600),
        }],
        backfill: BackfillMode::Default,
    };

    let outcomes = gapwatch.registry().configure(&request).await.unwrap();
    assert!(outcomes[0].registered);
    assert_eq!(outcomes[0].backfill, BackfillStatus::Completed { units: 30 });
    assert_eq!(gap_ranges(&gapwatch, &id).await, vec![r("2020-01-31", "2020-02-01")]);
    assert_eq!(gapwatch.tolerances().get(&id).await.unwrap(), Some(3600));

    // A second configure leaves gaps alone but still records the tolerance.
    let again = ConfigureRequest {
        collections: vec![CollectionSpec {
            id: id.clone(),
            tolerance_secs: Some(7200),
        }],
        backfill: BackfillMode::Default,
    };
    let outcomes = gapwatch.registry().configure(&again).await.unwrap();
    assert!(!outcomes[0].registered);
    assert_eq!(outcomes[0].backfill, BackfillStatus::Skipped);
    assert_eq!(gapwatch.tolerances().get(&id).await.unwrap(), Some(7200));
}

#[tokio::test]
async fn test_oversized_backfill_without_job_sink_refused() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(StaticCatalog::new());
    let collection = january();
    let id = collection.id.clone();
    catalog.insert_collection(collection).await;
    catalog
        .add_units(
            &id,
            (1..=5).map(|day| DataUnit {
                id: format!("G{}", day),
                start: ts(&format!("2020-01-{:02}", day)),
                end: ts(&format!("2020-01-{:02}T12:00:00Z", day)),
            }),
        )
        .await;

    let mut config = GapwatchConfig::in_dir(dir.path());
    config.backfill.interactive_ceiling = 2;
    let gapwatch = Gapwatch::open(config, catalog).await.unwrap();

    let request = ConfigureRequest {
        collections: vec![CollectionSpec {
            id,
            tolerance_secs: None,
        }],
        backfill: BackfillMode::Default,
    };
    let err = gapwatch.registry().configure(&request).await.unwrap_err();
    assert!(matches!(err, GapError::BackfillTooLarge { units: 5, ceiling: 2, .. }));
}
