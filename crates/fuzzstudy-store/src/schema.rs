//! Canonical entities stored in PostgreSQL
//!
//! Every record here is produced by exactly one pipeline stage and is never
//! mutated once that stage completes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

/// Issue statuses that count as a fixed fault.
pub const FIXED_STATUSES: &[&str] = &["Fixed", "Fixed (Verified)"];

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Kind of Cloud Build job recorded in a build log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BuildType {
    Fuzzing,
    Coverage,
    Introspector,
    Error,
    Unknown,
}

impl BuildType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildType::Fuzzing => "Fuzzing",
            BuildType::Coverage => "Coverage",
            BuildType::Introspector => "Introspector",
            BuildType::Error => "Error",
            BuildType::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for BuildType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Fuzzing" => Ok(BuildType::Fuzzing),
            "Coverage" => Ok(BuildType::Coverage),
            "Introspector" => Ok(BuildType::Introspector),
            "Error" => Ok(BuildType::Error),
            "Unknown" => Ok(BuildType::Unknown),
            other => Err(StoreError::InvalidValue {
                field: "build_type".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// How far a build log got before it ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildResult {
    /// Log ends with PUSH and DONE
    Finish,
    /// Non-empty log without an error or a clean finish
    Halfway,
    Error,
    /// Log could not be downloaded or was empty
    Unknown,
}

impl BuildResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildResult::Finish => "Finish",
            BuildResult::Halfway => "Halfway",
            BuildResult::Error => "Error",
            BuildResult::Unknown => "Unknown",
        }
    }

    /// Finish and Halfway builds both ran their fuzzers.
    pub fn is_successful(&self) -> bool {
        matches!(self, BuildResult::Finish | BuildResult::Halfway)
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildResult {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Finish" => Ok(BuildResult::Finish),
            "Halfway" => Ok(BuildResult::Halfway),
            "Error" => Ok(BuildResult::Error),
            "Unknown" => Ok(BuildResult::Unknown),
            other => Err(StoreError::InvalidValue {
                field: "result".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// An OSS-Fuzz project as declared by its `project.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    /// Lower-cased directory name under `projects/`
    pub name: String,
    pub language: Option<String>,
    pub main_repo: Option<String>,
    pub homepage: Option<String>,
    /// First commit touching the project directory
    pub first_commit_at: Option<DateTime<Utc>>,
    pub fuzzing_engines: Vec<String>,
    pub sanitizers: Vec<String>,
    pub architectures: Vec<String>,
    /// Remaining YAML keys, kept verbatim
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ProjectRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            language: None,
            main_repo: None,
            homepage: None,
            first_commit_at: None,
            fuzzing_engines: Vec::new(),
            sanitizers: Vec::new(),
            architectures: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

/// One Cloud Build execution attributed to a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    /// UUID taken from the log file name
    pub build_id: String,
    pub project: String,
    pub build_type: BuildType,
    pub result: BuildResult,
    pub created_at: DateTime<Utc>,
    /// Seconds until the next build of the same project and type
    pub duration_secs: Option<i64>,
    pub detected_faults: i64,
    pub size_bytes: i64,
    pub modules: Vec<String>,
    pub revisions: Vec<String>,
    pub log_url: Option<String>,
}

impl BuildRecord {
    pub fn new(
        build_id: impl Into<String>,
        project: impl Into<String>,
        build_type: BuildType,
        result: BuildResult,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            build_id: build_id.into(),
            project: project.into(),
            build_type,
            result,
            created_at,
            duration_secs: None,
            detected_faults: 0,
            size_bytes: 0,
            modules: Vec::new(),
            revisions: Vec::new(),
            log_url: None,
        }
    }

    /// A fuzzing build whose fuzzers ran.
    pub fn is_successful_fuzzing(&self) -> bool {
        self.build_type == BuildType::Fuzzing && self.result.is_successful()
    }

    /// Revisions sorted for set comparison.
    pub fn sorted_revisions(&self) -> Vec<String> {
        let mut revs = self.revisions.clone();
        revs.sort();
        revs
    }
}

// ---------------------------------------------------------------------------
// Coverage
// ---------------------------------------------------------------------------

/// Line coverage percentage, always within `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct CoveragePercent(f64);

impl CoveragePercent {
    pub fn value(&self) -> f64 {
        self.0
    }

    /// `covered / total * 100`; `None` when total is zero.
    pub fn from_lines(covered: i64, total: i64) -> Option<Result<Self, StoreError>> {
        if total <= 0 {
            return None;
        }
        Some(Self::try_from(covered as f64 / total as f64 * 100.0))
    }
}

impl TryFrom<f64> for CoveragePercent {
    type Error = StoreError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || !(0.0..=100.0).contains(&value) {
            return Err(StoreError::InvalidCoverage(format!(
                "{value} is outside [0, 100]"
            )));
        }
        Ok(CoveragePercent(value))
    }
}

impl From<CoveragePercent> for f64 {
    fn from(p: CoveragePercent) -> f64 {
        p.0
    }
}

/// Daily coverage report attached to one coverage build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageSample {
    pub build_id: String,
    pub project: String,
    pub report_date: NaiveDate,
    pub coverage: Option<CoveragePercent>,
    pub covered_lines: Option<i64>,
    pub total_lines: Option<i64>,
}

impl CoverageSample {
    /// Sample for a build whose report was absent or unparseable.
    pub fn missing(
        build_id: impl Into<String>,
        project: impl Into<String>,
        report_date: NaiveDate,
    ) -> Self {
        Self {
            build_id: build_id.into(),
            project: project.into(),
            report_date,
            coverage: None,
            covered_lines: None,
            total_lines: None,
        }
    }

    /// Sample with line counts; the percentage is derived from them.
    pub fn measured(
        build_id: impl Into<String>,
        project: impl Into<String>,
        report_date: NaiveDate,
        covered: i64,
        total: i64,
    ) -> Result<Self, StoreError> {
        if covered < 0 || total < 0 || covered > total {
            return Err(StoreError::InvalidCoverage(format!(
                "covered lines {covered} vs total lines {total}"
            )));
        }
        let coverage = CoveragePercent::from_lines(covered, total).transpose()?;
        Ok(Self {
            build_id: build_id.into(),
            project: project.into(),
            report_date,
            coverage,
            covered_lines: Some(covered),
            total_lines: Some(total),
        })
    }

    pub fn has_measurement(&self) -> bool {
        self.coverage.is_some()
    }

    /// Re-check the line-count invariant (deserialized samples bypass `measured`).
    pub fn validate(&self) -> Result<(), StoreError> {
        if let (Some(covered), Some(total)) = (self.covered_lines, self.total_lines) {
            if covered < 0 || covered > total {
                return Err(StoreError::InvalidCoverage(format!(
                    "covered lines {covered} vs total lines {total} for build {}",
                    self.build_id
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// An OSS-Fuzz issue attributed to the fuzzing build that found it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub issue_number: i64,
    pub build_id: String,
    pub project: String,
    pub reported_at: DateTime<Utc>,
    /// Seconds between the build's creation and the report
    pub offset_secs: i64,
    pub status: String,
    pub crash_type: Option<String>,
    pub severity: Option<String>,
}

impl DetectionEvent {
    pub fn is_fixed(&self) -> bool {
        FIXED_STATUSES.contains(&self.status.as_str())
    }
}

// ---------------------------------------------------------------------------
// Stage runs
// ---------------------------------------------------------------------------

/// Identifier shared by all stage rows of one pipeline invocation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SHA-256 hex digest of a stage's input files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputDigest(String);

impl InputDigest {
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        InputDigest(hex::encode(hasher.finalize()))
    }

    /// Digest over several named inputs, order-sensitive.
    pub fn from_parts<'a>(parts: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Self {
        let mut hasher = Sha256::new();
        for (name, data) in parts {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update((data.len() as u64).to_le_bytes());
            hasher.update(data);
        }
        InputDigest(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for InputDigest {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StoreError::InvalidValue {
                field: "input_digest".to_string(),
                value: s,
            });
        }
        Ok(InputDigest(s.to_ascii_lowercase()))
    }
}

impl fmt::Display for InputDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Audit row for one stage invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRunRecord {
    pub run_id: RunId,
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_read: i64,
    pub records_written: i64,
    pub records_skipped: i64,
    pub input_digest: Option<InputDigest>,
    pub success: bool,
    pub error: Option<String>,
}

impl StageRunRecord {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}
