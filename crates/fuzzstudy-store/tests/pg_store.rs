//! Integration tests against a live PostgreSQL instance.
//!
//! Credentials come from the `POSTGRES_*` variables (a `.env` file is
//! honoured). Run with:
//!   cargo test -p fuzzstudy-store --test pg_store -- --ignored
//!
//! Each test resets the schema, so point them at a scratch database.

use chrono::{NaiveDate, TimeZone, Utc};
use fuzzstudy_store::{
    BatchWriter, BuildQuery, BuildRecord, BuildResult, BuildStore, BuildType, CanonicalBatch,
    CoverageSample, CoverageStore, DetectionEvent, DuplicatePolicy, PgStore, ProjectRecord,
    ProjectStore, StoreError,
};

async fn fresh_store() -> PgStore {
    dotenvy::dotenv().ok();
    let store = PgStore::from_env().await.unwrap();
    store.reset_schema().await.unwrap();
    store
}

fn batch() -> CanonicalBatch {
    let at = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
    CanonicalBatch {
        projects: vec![ProjectRecord::new("expat").with_language("c")],
        builds: vec![
            BuildRecord::new("f-1", "expat", BuildType::Fuzzing, BuildResult::Finish, at),
            BuildRecord::new("c-1", "expat", BuildType::Coverage, BuildResult::Finish, at),
        ],
        detections: vec![],
    }
}

#[tokio::test]
#[ignore]
async fn pg_batch_is_idempotent() {
    let store = fresh_store().await;
    let first = store
        .write_batch(&batch(), DuplicatePolicy::KeepFirst)
        .await
        .unwrap();
    assert_eq!(first.builds, 2);
    let second = store
        .write_batch(&batch(), DuplicatePolicy::KeepFirst)
        .await
        .unwrap();
    assert_eq!(second.total(), 0);
    assert_eq!(store.count_builds(&BuildQuery::new()).await.unwrap(), 2);
    assert_eq!(store.list_projects().await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore]
async fn pg_rewrite_refreshes_fault_counts_and_durations() {
    let store = fresh_store().await;
    store
        .write_batch(&batch(), DuplicatePolicy::KeepFirst)
        .await
        .unwrap();

    let later = Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap();
    let mut more = batch();
    more.builds.push(BuildRecord::new(
        "f-2",
        "expat",
        BuildType::Fuzzing,
        BuildResult::Finish,
        later,
    ));
    more.detections.push(DetectionEvent {
        issue_number: 9,
        build_id: "f-1".to_string(),
        project: "expat".to_string(),
        reported_at: later,
        offset_secs: 86_400,
        status: "Fixed".to_string(),
        crash_type: None,
        severity: None,
    });
    store
        .write_batch(&more, DuplicatePolicy::KeepFirst)
        .await
        .unwrap();

    let f1 = store.get_build("f-1").await.unwrap().unwrap();
    assert_eq!(f1.detected_faults, 1);
    assert_eq!(f1.duration_secs, Some(86_400));
    let c1 = store.get_build("c-1").await.unwrap().unwrap();
    assert_eq!(c1.duration_secs, None);
}

#[tokio::test]
#[ignore]
async fn pg_rejects_dangling_build_atomically() {
    let store = fresh_store().await;
    let mut b = batch();
    b.builds.push(BuildRecord::new(
        "x-1",
        "ghost",
        BuildType::Fuzzing,
        BuildResult::Finish,
        Utc::now(),
    ));
    let err = store
        .write_batch(&b, DuplicatePolicy::KeepFirst)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::MissingReference { .. }), "{err}");
    assert!(store.list_projects().await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn pg_coverage_roundtrip() {
    let store = fresh_store().await;
    store
        .write_batch(&batch(), DuplicatePolicy::KeepFirst)
        .await
        .unwrap();
    let date = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
    let sample = CoverageSample::measured("c-1", "expat", date, 180, 200).unwrap();
    store.insert_coverage(&sample).await.unwrap();

    let series = store.coverage_series("expat", None).await.unwrap();
    assert_eq!(series, vec![sample.clone()]);
    assert!(matches!(
        store.insert_coverage(&sample).await.unwrap_err(),
        StoreError::Duplicate { .. }
    ));
}
