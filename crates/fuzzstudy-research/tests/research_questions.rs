//! Research-question runs over a small hand-built store.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use fuzzstudy_research::report::{write_rq2, RQ2_JSON, RQ2_MD};
use fuzzstudy_research::{rq1, rq2, rq3, StudyParams};
use fuzzstudy_store::fakes::MemoryStore;
use fuzzstudy_store::{
    BatchWriter, BuildRecord, BuildResult, BuildType, CanonicalBatch, CoverageSample,
    CoverageStore, DetectionEvent, DuplicatePolicy, ProjectRecord,
};

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, day, hour, 0, 0).unwrap()
}

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
}

fn build(
    id: &str,
    project: &str,
    t: BuildType,
    result: BuildResult,
    created: DateTime<Utc>,
    rev: &str,
) -> BuildRecord {
    let mut b = BuildRecord::new(id, project, t, result, created);
    b.revisions = vec![rev.to_string(), "https://github.com/google/oss-fuzz".to_string()];
    b
}

fn issue(
    n: i64,
    project: &str,
    build_id: &str,
    reported: DateTime<Utc>,
    status: &str,
) -> DetectionEvent {
    DetectionEvent {
        issue_number: n,
        build_id: build_id.to_string(),
        project: project.to_string(),
        reported_at: reported,
        offset_secs: 3600,
        status: status.to_string(),
        crash_type: Some("Heap-buffer-overflow READ 4".to_string()),
        severity: Some("High".to_string()),
    }
}

fn params() -> StudyParams {
    StudyParams::default()
        .with_min_coverage_reports(3)
        .with_min_projects(1)
}

/// Two projects over five days of June 2024.
///
/// zlib: a successful fuzzing build at 06:00 and a coverage build at 08:00
/// every day, coverage 50, 55, 60, 70, 72 %. Issue 1 (day 3) lines up with
/// its builds; issue 2 (day 5) does not because the coverage build ran on
/// other revisions; issue 3 is still open.
///
/// libpng: fuzzing fails on day 2 and is Halfway otherwise; coverage is
/// flat at 40 % and drops to 0 % on day 5.
async fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    let mut batch = CanonicalBatch {
        projects: vec![
            ProjectRecord::new("zlib").with_language("c"),
            ProjectRecord::new("libpng").with_language("c"),
        ],
        ..Default::default()
    };
    let mut samples = Vec::new();
    let zlib_covered = [50, 55, 60, 70, 72];
    for day in 1..=5u32 {
        let rev = format!("r{day}");
        batch.builds.push(build(
            &format!("zlib-f{day}"),
            "zlib",
            BuildType::Fuzzing,
            BuildResult::Finish,
            at(day, 6),
            &rev,
        ));
        let cov_rev = if day == 5 { "r5-other".to_string() } else { rev.clone() };
        batch.builds.push(build(
            &format!("zlib-c{day}"),
            "zlib",
            BuildType::Coverage,
            BuildResult::Finish,
            at(day, 8),
            &cov_rev,
        ));
        samples.push(
            CoverageSample::measured(
                format!("zlib-c{day}"),
                "zlib",
                date(day),
                zlib_covered[day as usize - 1],
                100,
            )
            .unwrap(),
        );

        let result = if day == 2 { BuildResult::Error } else { BuildResult::Halfway };
        batch.builds.push(build(
            &format!("libpng-f{day}"),
            "libpng",
            BuildType::Fuzzing,
            result,
            at(day, 5),
            &rev,
        ));
        batch.builds.push(build(
            &format!("libpng-c{day}"),
            "libpng",
            BuildType::Coverage,
            BuildResult::Finish,
            at(day, 9),
            &rev,
        ));
        let covered = if day == 5 { 0 } else { 40 };
        samples.push(
            CoverageSample::measured(format!("libpng-c{day}"), "libpng", date(day), covered, 100)
                .unwrap(),
        );
    }
    batch.detections = vec![
        issue(1, "zlib", "zlib-f3", at(3, 7), "Fixed"),
        issue(2, "zlib", "zlib-f5", at(5, 7), "Fixed (Verified)"),
        issue(3, "zlib", "zlib-f4", at(4, 7), "New"),
    ];

    store
        .write_batch(&batch, DuplicatePolicy::KeepFirst)
        .await
        .unwrap();
    for s in &samples {
        store.insert_coverage(s).await.unwrap();
    }
    store
}

#[tokio::test]
async fn rq1_maps_fixed_detections_to_iterations() {
    let store = seeded_store().await;
    let report = rq1::run(&store, &params()).await.unwrap();

    assert_eq!(report.eligible_projects, 2);
    assert_eq!(report.successful_builds, 9);
    assert_eq!(report.dropped_iterations, 0);

    let rows: Vec<(usize, usize, usize, f64)> = report
        .iterations
        .iter()
        .map(|s| (s.iteration, s.total_projects, s.detected_projects, s.detection_rate))
        .collect();
    assert_eq!(
        rows,
        vec![
            (1, 2, 0, 0.0),
            (2, 2, 0, 0.0),
            (3, 2, 1, 50.0),
            (4, 2, 0, 0.0),
            (5, 1, 1, 100.0),
        ]
    );
    let mapped: Vec<(i64, usize)> = report
        .detections
        .iter()
        .map(|d| (d.issue_number, d.iteration))
        .collect();
    assert_eq!(mapped, vec![(1, 3), (2, 5)]);
}

#[tokio::test]
async fn rq1_drops_thin_iterations() {
    let store = seeded_store().await;
    let report = rq1::run(&store, &params().with_min_projects(2)).await.unwrap();
    assert_eq!(report.dropped_iterations, 1);
    assert_eq!(report.iterations.len(), 4);
    assert!(report.late_stage.is_none());
}

#[tokio::test]
async fn rq1_project_without_detections_has_zero_rate() {
    let store = MemoryStore::new();
    let mut batch = CanonicalBatch {
        projects: vec![ProjectRecord::new("quiet")],
        ..Default::default()
    };
    for day in 1..=10u32 {
        batch.builds.push(build(
            &format!("q-f{day}"),
            "quiet",
            BuildType::Fuzzing,
            BuildResult::Finish,
            at(day, 6),
            "r",
        ));
    }
    for day in 1..=3u32 {
        batch.builds.push(build(
            &format!("q-c{day}"),
            "quiet",
            BuildType::Coverage,
            BuildResult::Finish,
            at(day, 8),
            "r",
        ));
    }
    store
        .write_batch(&batch, DuplicatePolicy::KeepFirst)
        .await
        .unwrap();
    for day in 1..=3u32 {
        let s = CoverageSample::measured(format!("q-c{day}"), "quiet", date(day), 10, 100).unwrap();
        store.insert_coverage(&s).await.unwrap();
    }

    let report = rq1::run(&store, &params()).await.unwrap();
    assert_eq!(report.iterations.len(), 10);
    assert!(report
        .iterations
        .iter()
        .all(|s| s.total_projects == 1 && s.detection_rate == 0.0));
    assert!(report.detections.is_empty());
}

#[tokio::test]
async fn ineligible_projects_are_left_out() {
    let store = seeded_store().await;
    // libpng has four positive samples, zlib five.
    let p = params().with_min_coverage_reports(5);
    assert_eq!(rq1::run(&store, &p).await.unwrap().eligible_projects, 1);
    let p = params().with_cutoff(date(3));
    assert_eq!(rq2::run(&store, &p).await.unwrap().eligible_projects, 0);
}

#[tokio::test]
async fn rq2_trends_per_project_and_session() {
    let store = seeded_store().await;
    let report = rq2::run(&store, &params()).await.unwrap();

    assert_eq!(report.eligible_projects, 2);
    let libpng = &report.projects[0];
    assert_eq!(libpng.project, "libpng");
    assert_eq!(libpng.sessions, 4);
    assert!(libpng.spearman.is_none());

    let zlib = &report.projects[1];
    assert_eq!(zlib.sessions, 5);
    assert_eq!(zlib.first_coverage, Some(50.0));
    assert_eq!(zlib.last_coverage, Some(72.0));
    assert!((zlib.spearman.unwrap().coefficient - 1.0).abs() < 1e-12);
    assert_eq!(report.strong_trends, vec!["zlib".to_string()]);
    assert_eq!(report.correlation_summary.valid, 1);

    assert_eq!(report.sessions.len(), 5);
    assert_eq!(report.sessions[0].projects, 2);
    assert!((report.sessions[0].mean - 45.0).abs() < 1e-9);
    assert_eq!(report.sessions[4].projects, 1);
    assert_eq!(report.session_boxes.len(), 1);
    assert!(report.trend_correlations.spearman_mean.is_some());
}

#[tokio::test]
async fn rq2_artifacts_are_written() {
    let store = seeded_store().await;
    let report = rq2::run(&store, &params()).await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let paths = write_rq2(dir.path(), &report).unwrap();
    assert_eq!(paths, vec![dir.path().join(RQ2_JSON), dir.path().join(RQ2_MD)]);
    let md = std::fs::read_to_string(&paths[1]).unwrap();
    assert!(md.contains("- strong trends (|rho| > 0.5): 1\n"));
    assert!(md.contains("- `zlib`"));
}

#[tokio::test]
async fn rq3_splits_detected_and_ordinary_changes() {
    let store = seeded_store().await;
    let report = rq3::run(&store, &params()).await.unwrap();

    // Issues 1 and 2 are fixed; issue 3 is open.
    assert_eq!(report.issues_considered, 2);
    assert_eq!(report.detected.len(), 1);
    let d = &report.detected[0];
    assert_eq!(d.issue_number, Some(1));
    assert_eq!(d.date, date(3));
    assert_eq!((d.covered_diff, d.total_diff), (5, 0));
    assert!((d.percent_diff - 5.0).abs() < 1e-9);

    let zlib: Vec<(NaiveDate, i64)> = report
        .non_detected
        .iter()
        .filter(|c| c.project == "zlib")
        .map(|c| (c.date, c.covered_diff))
        .collect();
    assert_eq!(zlib, vec![(date(2), 5), (date(4), 10), (date(5), 2)]);
    assert_eq!(
        report
            .non_detected
            .iter()
            .filter(|c| c.project == "libpng")
            .count(),
        4
    );

    // One detected change is too few for a test.
    assert_eq!(report.comparison.detected, 1);
    assert_eq!(report.comparison.non_detected, 7);
    assert!(report.comparison.mann_whitney.is_none());
    assert!(report.comparison.significant.is_none());
}

#[tokio::test]
async fn rq3_respects_detection_window() {
    let store = seeded_store().await;
    let report = rq3::run(&store, &params().with_detection_window_hours(1))
        .await
        .unwrap();
    assert!(report.detected.is_empty());
    assert_eq!(
        report
            .non_detected
            .iter()
            .filter(|c| c.project == "zlib")
            .count(),
        4
    );
}

fn jan(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, day, hour, 0, 0).unwrap()
}

fn jan_date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
}

/// Two projects around the default cutoff of 2025-01-08.
///
/// edge: fuzzing at 20:00 and coverage at 08:00 on January 5-10, coverage
/// 25, 30, ... 50 %. Fixed issues are reported on the 7th, the cutoff day
/// and the 9th.
///
/// late: coverage on January 5-7 only, successful fuzzing from the cutoff
/// day on, and one fixed issue on the 9th.
async fn cutoff_store() -> MemoryStore {
    let store = MemoryStore::new();
    let mut batch = CanonicalBatch {
        projects: vec![ProjectRecord::new("edge"), ProjectRecord::new("late")],
        ..Default::default()
    };
    let mut samples = Vec::new();
    for day in 5..=10u32 {
        batch.builds.push(build(
            &format!("edge-f{day}"),
            "edge",
            BuildType::Fuzzing,
            BuildResult::Finish,
            jan(day, 20),
            "r",
        ));
        batch.builds.push(build(
            &format!("edge-c{day}"),
            "edge",
            BuildType::Coverage,
            BuildResult::Finish,
            jan(day, 8),
            "r",
        ));
        samples.push(
            CoverageSample::measured(
                format!("edge-c{day}"),
                "edge",
                jan_date(day),
                5 * day as i64,
                100,
            )
            .unwrap(),
        );
    }
    for day in 5..=7u32 {
        batch.builds.push(build(
            &format!("late-c{day}"),
            "late",
            BuildType::Coverage,
            BuildResult::Finish,
            jan(day, 8),
            "r",
        ));
        samples.push(
            CoverageSample::measured(format!("late-c{day}"), "late", jan_date(day), 20, 100)
                .unwrap(),
        );
    }
    for day in 8..=9u32 {
        batch.builds.push(build(
            &format!("late-f{day}"),
            "late",
            BuildType::Fuzzing,
            BuildResult::Finish,
            jan(day, 20),
            "r",
        ));
    }
    batch.detections = vec![
        issue(10, "edge", "edge-f7", jan(7, 22), "Fixed"),
        issue(11, "edge", "edge-f8", jan(8, 21), "Fixed"),
        issue(12, "edge", "edge-f9", jan(9, 22), "Fixed (Verified)"),
        issue(20, "late", "late-f9", jan(9, 22), "Fixed"),
    ];

    store
        .write_batch(&batch, DuplicatePolicy::KeepFirst)
        .await
        .unwrap();
    for s in &samples {
        store.insert_coverage(s).await.unwrap();
    }
    store
}

#[tokio::test]
async fn eligibility_counts_samples_strictly_before_cutoff() {
    let store = cutoff_store().await;
    // edge has six positive samples but only three before the cutoff.
    let p = params().with_min_coverage_reports(4);
    assert_eq!(rq1::run(&store, &p).await.unwrap().eligible_projects, 0);
    assert_eq!(rq2::run(&store, &params()).await.unwrap().eligible_projects, 2);
}

#[tokio::test]
async fn rq1_counts_builds_and_reports_past_cutoff() {
    let store = cutoff_store().await;
    let report = rq1::run(&store, &params()).await.unwrap();

    assert_eq!(report.eligible_projects, 2);
    assert_eq!(report.successful_builds, 8);

    let rows: Vec<(usize, usize, usize)> = report
        .iterations
        .iter()
        .map(|s| (s.iteration, s.total_projects, s.detected_projects))
        .collect();
    assert_eq!(
        rows,
        vec![(1, 2, 0), (2, 2, 0), (3, 1, 1), (4, 1, 1), (5, 1, 1), (6, 1, 0)]
    );

    // Reports on and after the cutoff day still map; issue 20 has no
    // successful fuzzing build before the cutoff.
    let mapped: Vec<(i64, usize)> = report
        .detections
        .iter()
        .map(|d| (d.issue_number, d.iteration))
        .collect();
    assert_eq!(mapped, vec![(10, 3), (11, 4), (12, 5)]);
}

#[tokio::test]
async fn rq2_series_stop_before_cutoff_day() {
    let store = cutoff_store().await;
    let report = rq2::run(&store, &params()).await.unwrap();

    let edge = &report.projects[0];
    assert_eq!(edge.project, "edge");
    assert_eq!(edge.sessions, 3);
    assert_eq!(edge.first_coverage, Some(25.0));
    assert_eq!(edge.last_coverage, Some(35.0));
    assert_eq!(report.projects[1].sessions, 3);

    assert_eq!(report.sessions.len(), 3);
    assert!(report.sessions.iter().all(|s| s.projects == 2));
    assert!((report.sessions[0].mean - 22.5).abs() < 1e-9);
}

#[tokio::test]
async fn rq3_uses_grace_day_for_coverage_only() {
    let store = cutoff_store().await;
    let report = rq3::run(&store, &params()).await.unwrap();

    // Only issue 10 is reported before the cutoff.
    assert_eq!(report.issues_considered, 1);

    // Its first coverage build after the report runs on the cutoff day.
    assert_eq!(report.detected.len(), 1);
    let d = &report.detected[0];
    assert_eq!(d.issue_number, Some(10));
    assert_eq!(d.date, jan_date(7));
    assert_eq!(d.covered_diff, 5);

    // The cutoff-day sample closes an ordinary pair; the 9th is past the grace day.
    let edge: Vec<NaiveDate> = report
        .non_detected
        .iter()
        .filter(|c| c.project == "edge")
        .map(|c| c.date)
        .collect();
    assert_eq!(edge, vec![jan_date(6), jan_date(8)]);
    assert_eq!(
        report
            .non_detected
            .iter()
            .filter(|c| c.project == "late")
            .count(),
        2
    );
    assert_eq!((report.comparison.detected, report.comparison.non_detected), (1, 4));
}
