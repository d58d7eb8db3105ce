//! Storage trait definitions for fuzzstudy
//!
//! These traits define the persistence seams every stage and runner goes
//! through:
//! - `BatchWriter`: transactional, validated load of canonical rows
//! - `ProjectStore` / `BuildStore`: deterministic reads of projects and builds
//! - `CoverageStore`: one coverage sample per coverage build
//! - `DetectionStore`: issues linked to the builds that found them
//! - `StageLedger`: append-only audit trail of stage invocations
//!
//! All traits are async and backend-agnostic. `PgStore` implements them on
//! PostgreSQL; `fakes::MemoryStore` implements them in memory.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::schema::{
    BuildRecord, BuildResult, BuildType, CoverageSample, DetectionEvent, ProjectRecord,
    StageRunRecord,
};

/// Result type for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Batch loading
// ---------------------------------------------------------------------------

/// How a write treats a row whose natural key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// The stored row is left untouched.
    #[default]
    KeepFirst,
    /// The incoming row replaces the stored one.
    LastWriteWins,
}

impl std::str::FromStr for DuplicatePolicy {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep-first" => Ok(DuplicatePolicy::KeepFirst),
            "last-write-wins" => Ok(DuplicatePolicy::LastWriteWins),
            other => Err(StoreError::InvalidValue {
                field: "duplicate_policy".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Canonical rows produced by one transform run, written in dependency order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalBatch {
    pub projects: Vec<ProjectRecord>,
    pub builds: Vec<BuildRecord>,
    pub detections: Vec<DetectionEvent>,
}

impl CanonicalBatch {
    /// Projects whose builds or detections appear in the batch.
    pub fn touched_projects(&self) -> BTreeSet<String> {
        self.builds
            .iter()
            .map(|b| b.project.clone())
            .chain(self.detections.iter().map(|d| d.project.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty() && self.builds.is_empty() && self.detections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.projects.len() + self.builds.len() + self.detections.len()
    }
}

/// Rows inserted or replaced by a batch write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub projects: u64,
    pub builds: u64,
    pub detections: u64,
}

impl BatchCounts {
    pub fn total(&self) -> u64 {
        self.projects + self.builds + self.detections
    }
}

/// Transactional loader for canonical rows.
///
/// Guarantees:
/// - Every build references a project present in the batch or the store.
/// - Every detection references a build present in the batch or the store.
/// - Either the whole batch is applied or nothing is
///   (`StoreError::MissingReference` on a dangling reference).
/// - Writing the same batch twice leaves the store unchanged after the first.
/// - Whatever the policy, every stored build of a project the batch touches
///   ends with `detected_faults` equal to its stored detection events and
///   `duration_secs` measured to the next stored build of the same type.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    async fn write_batch(
        &self,
        batch: &CanonicalBatch,
        policy: DuplicatePolicy,
    ) -> StoreResult<BatchCounts>;
}

// ---------------------------------------------------------------------------
// Projects and builds
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Look up a project by name. `None` if absent.
    async fn get_project(&self, name: &str) -> StoreResult<Option<ProjectRecord>>;

    /// All projects ordered by name.
    async fn list_projects(&self) -> StoreResult<Vec<ProjectRecord>>;
}

/// Filter for build listings. Empty type/result lists match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildQuery {
    pub project: Option<String>,
    pub build_types: Vec<BuildType>,
    pub results: Vec<BuildResult>,
    /// Exclusive upper bound on `created_at`
    pub created_before: Option<DateTime<Utc>>,
    /// Exclusive lower bound on `created_at`
    pub created_after: Option<DateTime<Utc>>,
}

impl BuildQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn build_type(mut self, build_type: BuildType) -> Self {
        self.build_types.push(build_type);
        self
    }

    pub fn result(mut self, result: BuildResult) -> Self {
        self.results.push(result);
        self
    }

    /// Fuzzing builds with result Finish or Halfway.
    pub fn successful_fuzzing(self) -> Self {
        self.build_type(BuildType::Fuzzing)
            .result(BuildResult::Finish)
            .result(BuildResult::Halfway)
    }

    pub fn before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn matches(&self, build: &BuildRecord) -> bool {
        self.project.as_deref().map_or(true, |p| build.project == p)
            && (self.build_types.is_empty() || self.build_types.contains(&build.build_type))
            && (self.results.is_empty() || self.results.contains(&build.result))
            && self.created_before.map_or(true, |t| build.created_at < t)
            && self.created_after.map_or(true, |t| build.created_at > t)
    }
}

#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn get_build(&self, build_id: &str) -> StoreResult<Option<BuildRecord>>;

    /// Matching builds ordered by `(created_at, build_id)`.
    async fn list_builds(&self, query: &BuildQuery) -> StoreResult<Vec<BuildRecord>>;

    async fn count_builds(&self, query: &BuildQuery) -> StoreResult<u64>;
}

// ---------------------------------------------------------------------------
// Coverage
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CoverageStore: Send + Sync {
    /// Attach a sample to its build.
    ///
    /// Fails with `MissingReference` for an unknown build and `Duplicate`
    /// when the build already has a sample.
    async fn insert_coverage(&self, sample: &CoverageSample) -> StoreResult<()>;

    /// Coverage builds without a sample, ordered by `(created_at, build_id)`.
    async fn builds_missing_coverage(&self) -> StoreResult<Vec<BuildRecord>>;

    /// A project's samples ordered by `(report_date, build_id)`, optionally
    /// restricted to report dates strictly before `before`.
    async fn coverage_series(
        &self,
        project: &str,
        before: Option<NaiveDate>,
    ) -> StoreResult<Vec<CoverageSample>>;

    /// Projects with at least `min_samples` samples of positive coverage
    /// reported strictly before `before`, ordered by name.
    async fn eligible_projects(&self, min_samples: u64, before: NaiveDate)
        -> StoreResult<Vec<String>>;
}

// ---------------------------------------------------------------------------
// Detections
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DetectionStore: Send + Sync {
    /// Detection events ordered by `(reported_at, issue_number)`, optionally
    /// restricted to one project.
    async fn list_detections(&self, project: Option<&str>) -> StoreResult<Vec<DetectionEvent>>;
}

// ---------------------------------------------------------------------------
// Stage ledger
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StageLedger: Send + Sync {
    /// Append one stage row. Rows are never updated.
    async fn record_stage_run(&self, record: &StageRunRecord) -> StoreResult<()>;

    /// Most recent rows first, up to `limit`.
    async fn list_stage_runs(&self, limit: usize) -> StoreResult<Vec<StageRunRecord>>;
}

/// Everything a pipeline stage or research runner needs from a backend.
pub trait StudyStore:
    BatchWriter + ProjectStore + BuildStore + CoverageStore + DetectionStore + StageLedger
{
}

impl<T> StudyStore for T where
    T: BatchWriter + ProjectStore + BuildStore + CoverageStore + DetectionStore + StageLedger
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn build(project: &str, t: BuildType, r: BuildResult, day: u32) -> BuildRecord {
        BuildRecord::new(
            format!("{project}-{day}"),
            project,
            t,
            r,
            Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn empty_query_matches_everything() {
        let b = build("zlib", BuildType::Unknown, BuildResult::Unknown, 1);
        assert!(BuildQuery::new().matches(&b));
    }

    #[test]
    fn successful_fuzzing_query() {
        let q = BuildQuery::new().successful_fuzzing();
        assert!(q.matches(&build("a", BuildType::Fuzzing, BuildResult::Finish, 1)));
        assert!(q.matches(&build("a", BuildType::Fuzzing, BuildResult::Halfway, 1)));
        assert!(!q.matches(&build("a", BuildType::Fuzzing, BuildResult::Error, 1)));
        assert!(!q.matches(&build("a", BuildType::Coverage, BuildResult::Finish, 1)));
    }

    #[test]
    fn time_bounds_are_exclusive() {
        let at = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        let b = build("a", BuildType::Fuzzing, BuildResult::Finish, 5);
        assert!(!BuildQuery::new().before(at).matches(&b));
        assert!(!BuildQuery::new().after(at).matches(&b));
        assert!(BuildQuery::new().project("a").matches(&b));
        assert!(!BuildQuery::new().project("b").matches(&b));
    }

    #[test]
    fn duplicate_policy_parses() {
        assert_eq!(
            "keep-first".parse::<DuplicatePolicy>().unwrap(),
            DuplicatePolicy::KeepFirst
        );
        assert_eq!(
            "last-write-wins".parse::<DuplicatePolicy>().unwrap(),
            DuplicatePolicy::LastWriteWins
        );
        assert!("newest".parse::<DuplicatePolicy>().is_err());
        assert_eq!(DuplicatePolicy::default(), DuplicatePolicy::KeepFirst);
    }
}
