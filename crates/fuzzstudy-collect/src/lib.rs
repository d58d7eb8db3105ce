//! fuzzstudy-collect: raw data collectors for OSS-Fuzz
//!
//! Each collector fetches one kind of raw record and appends it to a JSON
//! Lines file under the data directory. Failures for a single project, log
//! or issue are logged and skipped; the batch carries on.
//!
//! - `projects`: `project.yaml` metadata from an OSS-Fuzz checkout
//! - `buildlogs`: build-log listing from the public GCS bucket
//! - `analysis`: build-log download and classification
//! - `coverage`: daily coverage report scraping
//! - `issues`: issue page parsing

pub mod analysis;
pub mod buildlogs;
pub mod coverage;
mod error;
pub mod http;
pub mod issues;
pub mod projects;
pub mod raw;

pub use analysis::{analyze_log, BuildlogAnalyzer, LogAnalysis};
pub use buildlogs::{BuildlogLister, ListingConfig};
pub use coverage::{CoverageReportFetcher, LanguageFamily, LineCounts};
pub use error::CollectError;
pub use http::{FetchClient, HttpConfig};
pub use issues::IssueCollector;
pub use projects::ProjectCollector;
pub use raw::{RawBuildAnalysis, RawBuildlogMeta, RawIssue, RawProject, SourceEntry};

/// Result type for collector operations
pub type Result<T> = std::result::Result<T, CollectError>;
