//! HTTP-backed collectors against a local mock server.

use std::time::Duration;

use chrono::NaiveDate;
use fuzzstudy_collect::raw::read_jsonl;
use fuzzstudy_collect::{
    BuildlogAnalyzer, BuildlogLister, CollectError, CoverageReportFetcher, FetchClient,
    HttpConfig, LineCounts, ListingConfig, RawBuildAnalysis, RawBuildlogMeta,
};
use fuzzstudy_store::{BuildResult, BuildType};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_client() -> FetchClient {
    FetchClient::new(
        HttpConfig::default()
            .with_max_attempts(3)
            .with_backoff_base(Duration::from_millis(5)),
    )
    .unwrap()
}

fn meta(server: &MockServer, uuid: &str) -> RawBuildlogMeta {
    RawBuildlogMeta {
        name: format!("log-{uuid}.txt"),
        self_link: None,
        media_link: Some(format!("{}/logs/{uuid}", server.uri())),
        size: Some("512".to_string()),
        time_created: "2024-03-01T06:00:00.000Z".to_string(),
    }
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let body = fast_client()
        .get_text(&format!("{}/flaky", server.uri()))
        .await
        .unwrap();
    assert_eq!(body.as_deref(), Some("ok"));
}

#[tokio::test]
async fn retries_are_bounded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&server)
        .await;

    let err = fast_client()
        .get_text(&format!("{}/down", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, CollectError::Http(_)), "{err}");
}

#[tokio::test]
async fn not_found_is_absent_and_client_errors_fail_fast() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/forbidden"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client();
    let missing = client
        .get_text(&format!("{}/missing", server.uri()))
        .await
        .unwrap();
    assert!(missing.is_none());

    let err = client
        .get_text(&format!("{}/forbidden", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, CollectError::HttpStatus { status: 403, .. }));
}

#[tokio::test]
async fn listing_follows_page_tokens_and_filters_names() {
    let server = MockServer::start().await;
    let item = |name: &str| {
        json!({
            "name": name,
            "selfLink": "https://example.invalid/self",
            "mediaLink": "https://example.invalid/media",
            "size": "1024",
            "timeCreated": "2024-03-01T06:00:00.000Z"
        })
    };

    Mock::given(method("GET"))
        .and(path("/b/oss-fuzz-gcb-logs/o"))
        .and(query_param("pageToken", "p2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [item("log-0b7c33a2-31cd-4f6e-9f6a-4f1f0d4e1b11.txt")]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b/oss-fuzz-gcb-logs/o"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                item("log-6259f647-370a-40e2-916b-8f4aaf105697.txt"),
                item("log-short.txt"),
            ],
            "nextPageToken": "p2"
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("buildlog_metadata.jsonl");
    let client = fast_client();
    let config = ListingConfig {
        api_base: format!("{}/b", server.uri()),
        pages_per_flush: 1,
        page_delay: Duration::ZERO,
        ..Default::default()
    };

    let written = BuildlogLister::new(&client, config)
        .collect_to(&out)
        .await
        .unwrap();
    assert_eq!(written, 2);

    let metas: Vec<RawBuildlogMeta> = read_jsonl(&out).unwrap();
    let ids: Vec<_> = metas.iter().map(|m| m.build_id().to_string()).collect();
    assert_eq!(
        ids,
        vec![
            "6259f647-370a-40e2-916b-8f4aaf105697",
            "0b7c33a2-31cd-4f6e-9f6a-4f1f0d4e1b11"
        ]
    );
    assert_eq!(metas[0].size_bytes(), 1024);
}

#[tokio::test]
async fn analyzer_downloads_classifies_and_resumes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/logs/6259f647-370a-40e2-916b-8f4aaf105697"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(include_str!("fixtures/fuzzing_build.log")),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/logs/0b7c33a2-31cd-4f6e-9f6a-4f1f0d4e1b11"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let metas = vec![
        meta(&server, "6259f647-370a-40e2-916b-8f4aaf105697"),
        meta(&server, "0b7c33a2-31cd-4f6e-9f6a-4f1f0d4e1b11"),
    ];
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("buildlog_analysis.jsonl");
    let client = fast_client();
    let analyzer = BuildlogAnalyzer::new(&client);

    assert_eq!(analyzer.run(&metas, &out).await.unwrap(), 2);
    assert_eq!(analyzer.run(&metas, &out).await.unwrap(), 0);

    let analysed: Vec<RawBuildAnalysis> = read_jsonl(&out).unwrap();
    assert_eq!(analysed.len(), 2);
    assert_eq!(analysed[0].project.as_deref(), Some("libpng"));
    assert_eq!(analysed[0].build_type, Some(BuildType::Fuzzing));
    assert_eq!(analysed[0].size_bytes, 512);
    assert_eq!(analysed[1].result, BuildResult::Unknown);
    assert_eq!(analysed[1].project, None);
}

#[tokio::test]
async fn analyzer_respects_batch_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Step #0: hello\n"))
        .mount(&server)
        .await;

    let metas = vec![
        meta(&server, "6259f647-370a-40e2-916b-8f4aaf105697"),
        meta(&server, "0b7c33a2-31cd-4f6e-9f6a-4f1f0d4e1b11"),
    ];
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("analysis.jsonl");
    let client = fast_client();
    let analyzer = BuildlogAnalyzer::new(&client).with_limit(Some(1));

    assert_eq!(analyzer.run(&metas, &out).await.unwrap(), 1);
    assert_eq!(analyzer.run(&metas, &out).await.unwrap(), 1);
    assert_eq!(analyzer.run(&metas, &out).await.unwrap(), 0);
}

#[tokio::test]
async fn coverage_fetcher_reads_daily_report() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/zlib/reports/20240301/linux/file_view_index.html"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(include_str!("fixtures/llvm_file_view_index.html")),
        )
        .mount(&server)
        .await;

    let client = fast_client();
    let fetcher = CoverageReportFetcher::new(&client).with_base_url(server.uri());
    let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

    let counts = fetcher.fetch("zlib", Some("c"), day).await.unwrap();
    assert_eq!(
        counts,
        Some(LineCounts {
            covered: 1780,
            total: 2500
        })
    );

    // no report published for the next day
    let next = fetcher
        .fetch("zlib", Some("c"), day.succ_opt().unwrap())
        .await
        .unwrap();
    assert_eq!(next, None);

    // unsupported languages never hit the network
    assert_eq!(fetcher.fetch("gopkg", Some("go"), day).await.unwrap(), None);
}
