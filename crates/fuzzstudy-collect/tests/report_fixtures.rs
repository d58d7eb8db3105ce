//! Known build logs and coverage reports classify to known values.

use fuzzstudy_collect::coverage::{parse_jvm_report, parse_llvm_report, parse_python_report};
use fuzzstudy_collect::{analyze_log, LineCounts};
use fuzzstudy_store::{BuildResult, BuildType};

const FUZZING_LOG: &str = include_str!("fixtures/fuzzing_build.log");
const COVERAGE_LOG: &str = include_str!("fixtures/coverage_build.log");
const FAILED_LOG: &str = include_str!("fixtures/failed_build.log");
const LLVM_REPORT: &str = include_str!("fixtures/llvm_file_view_index.html");
const PYTHON_REPORT: &str = include_str!("fixtures/python_index.html");
const JACOCO_REPORT: &str = include_str!("fixtures/jacoco_index.html");

#[test]
fn fuzzing_log_classification() {
    let a = analyze_log(FUZZING_LOG);
    assert_eq!(a.project.as_deref(), Some("libpng"));
    assert_eq!(a.build_type, Some(BuildType::Fuzzing));
    assert_eq!(a.result, BuildResult::Finish);

    let paths: Vec<_> = a.sources.iter().map(|s| s.path.as_str()).collect();
    assert_eq!(paths, vec!["/src/libpng", "/src/zlib"]);
    let modules: Vec<_> = a.sources.iter().map(|s| s.module_name()).collect();
    assert_eq!(modules, vec!["Libpng", "Zlib"]);
    assert_eq!(a.sources[1].rev, "51b7f2abdade71cd9bb0e7a373ef2610ec6f9daf");
}

#[test]
fn coverage_log_classification() {
    let a = analyze_log(COVERAGE_LOG);
    assert_eq!(a.project.as_deref(), Some("zlib"));
    assert_eq!(a.build_type, Some(BuildType::Coverage));
    assert_eq!(a.result, BuildResult::Finish);
    assert_eq!(a.sources.len(), 1);
    assert_eq!(a.sources[0].kind, "git");
}

#[test]
fn failed_log_classification() {
    let a = analyze_log(FAILED_LOG);
    assert_eq!(a.project.as_deref(), Some("expat"));
    assert_eq!(a.build_type, Some(BuildType::Error));
    assert_eq!(a.result, BuildResult::Error);
    assert!(a.sources.is_empty());
}

#[test]
fn llvm_report_totals_row() {
    assert_eq!(
        parse_llvm_report(LLVM_REPORT),
        Some(LineCounts {
            covered: 1780,
            total: 2500
        })
    );
}

#[test]
fn python_report_footer_row() {
    assert_eq!(
        parse_python_report(PYTHON_REPORT),
        Some(LineCounts {
            covered: 150,
            total: 200
        })
    );
}

#[test]
fn jacoco_report_uses_second_missed_column() {
    assert_eq!(
        parse_jvm_report(JACOCO_REPORT),
        Some(LineCounts {
            covered: 1750,
            total: 3000
        })
    );
}

#[test]
fn missing_columns_yield_nothing() {
    // An LLVM page parsed as a Python report lacks the expected columns.
    assert_eq!(parse_python_report(LLVM_REPORT), None);
    assert_eq!(parse_jvm_report(PYTHON_REPORT), None);
    assert_eq!(parse_llvm_report("<html><body>404</body></html>"), None);
}
