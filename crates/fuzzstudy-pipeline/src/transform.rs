//! Raw collector output -> canonical rows
//!
//! Normalisation is a pure function over the raw records ([`Transformer::normalize`]);
//! [`Transformer::run`] adds the single batch write. Raw files are read
//! strictly, so a malformed line aborts the stage before anything is written.
//! Records that parse but cannot be normalised (no project, unknown
//! project, bad timestamp) are skipped and counted.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use fuzzstudy_collect::raw::{parse_timestamp, read_jsonl, read_jsonl_or_empty};
use fuzzstudy_collect::{RawBuildAnalysis, RawIssue, RawProject};
use fuzzstudy_store::{
    BatchCounts, BuildRecord, BuildType, CanonicalBatch, DetectionEvent, DuplicatePolicy,
    ProjectRecord, StudyStore,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument};

use crate::config::DataLayout;
use crate::obs::emit_record_skipped;
use crate::Result;

const STAGE: &str = "transform";

/// Raw records read from the data directory
#[derive(Debug, Clone, Default)]
pub struct RawInputs {
    pub projects: Vec<RawProject>,
    pub builds: Vec<RawBuildAnalysis>,
    pub issues: Vec<RawIssue>,
}

impl RawInputs {
    /// Read the three raw files. Projects and build analyses are required;
    /// a missing issues file reads as no issues.
    pub fn load(layout: &DataLayout) -> Result<Self> {
        Ok(Self {
            projects: read_jsonl(&layout.projects_file())?,
            builds: read_jsonl(&layout.buildlog_analysis_file())?,
            issues: read_jsonl_or_empty(&layout.issues_file())?,
        })
    }

    pub fn len(&self) -> usize {
        self.projects.len() + self.builds.len() + self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What normalisation kept and dropped
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformStats {
    pub projects_read: usize,
    pub builds_read: usize,
    pub issues_read: usize,

    pub projects_invalid: usize,
    pub projects_duplicate: usize,
    pub projects_without_builds: usize,

    pub builds_without_project: usize,
    pub builds_unknown_project: usize,
    pub builds_bad_timestamp: usize,
    pub builds_duplicate: usize,

    pub issues_without_project: usize,
    pub issues_bad_timestamp: usize,
    pub issues_duplicate: usize,
    pub issues_without_build: usize,
}

impl TransformStats {
    pub fn records_read(&self) -> usize {
        self.projects_read + self.builds_read + self.issues_read
    }

    pub fn records_skipped(&self) -> usize {
        self.projects_invalid
            + self.projects_duplicate
            + self.projects_without_builds
            + self.builds_without_project
            + self.builds_unknown_project
            + self.builds_bad_timestamp
            + self.builds_duplicate
            + self.issues_without_project
            + self.issues_bad_timestamp
            + self.issues_duplicate
            + self.issues_without_build
    }
}

/// Result of one transform run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformReport {
    pub stats: TransformStats,
    pub projects: usize,
    pub builds: usize,
    pub detections: usize,
    /// Rows actually inserted or changed by the write
    pub written: BatchCounts,
}

/// Canonical batch plus normalisation counters
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub batch: CanonicalBatch,
    pub stats: TransformStats,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Transformer {
    policy: DuplicatePolicy,
}

impl Transformer {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Normalise, deduplicate and link raw records. Pure.
    pub fn normalize(&self, raw: &RawInputs) -> Normalized {
        let mut stats = TransformStats {
            projects_read: raw.projects.len(),
            builds_read: raw.builds.len(),
            issues_read: raw.issues.len(),
            ..Default::default()
        };

        let projects = self.normalize_projects(&raw.projects, &mut stats);
        let mut builds = self.normalize_builds(&raw.builds, &projects, &mut stats);
        assign_durations(&mut builds);
        let detections = self.link_detections(&raw.issues, &mut builds, &mut stats);

        let with_builds: BTreeSet<&str> = builds.iter().map(|b| b.project.as_str()).collect();
        let mut kept = Vec::with_capacity(with_builds.len());
        for (name, project) in projects {
            if with_builds.contains(name.as_str()) {
                kept.push(project);
            } else {
                stats.projects_without_builds += 1;
                emit_record_skipped(STAGE, &name, "project has no builds");
            }
        }

        Normalized {
            batch: CanonicalBatch {
                projects: kept,
                builds,
                detections,
            },
            stats,
        }
    }

    /// Normalise `raw` and write it to `store` as one batch.
    #[instrument(skip_all, fields(policy = ?self.policy, records = raw.len()))]
    pub async fn run(&self, store: &dyn StudyStore, raw: &RawInputs) -> Result<TransformReport> {
        let Normalized { batch, stats } = self.normalize(raw);
        let written = store.write_batch(&batch, self.policy).await?;

        let report = TransformReport {
            projects: batch.projects.len(),
            builds: batch.builds.len(),
            detections: batch.detections.len(),
            written,
            stats,
        };
        info!(
            projects = report.projects,
            builds = report.builds,
            detections = report.detections,
            written = report.written.total(),
            skipped = report.stats.records_skipped(),
            "Transform complete"
        );
        Ok(report)
    }

    fn normalize_projects(
        &self,
        raw: &[RawProject],
        stats: &mut TransformStats,
    ) -> BTreeMap<String, ProjectRecord> {
        let mut out = BTreeMap::new();
        for record in raw {
            let Some(project) = normalize_project(record) else {
                stats.projects_invalid += 1;
                emit_record_skipped(STAGE, &record.name, "empty project name");
                continue;
            };
            if keep_by_policy(&mut out, project.name.clone(), project, self.policy) {
                stats.projects_duplicate += 1;
            }
        }
        out
    }

    fn normalize_builds(
        &self,
        raw: &[RawBuildAnalysis],
        projects: &BTreeMap<String, ProjectRecord>,
        stats: &mut TransformStats,
    ) -> Vec<BuildRecord> {
        let mut out = BTreeMap::new();
        for record in raw {
            let Some(project) = record.project.as_deref().and_then(normalize_name) else {
                stats.builds_without_project += 1;
                emit_record_skipped(STAGE, &record.build_id, "no project in build log");
                continue;
            };
            if !projects.contains_key(&project) {
                stats.builds_unknown_project += 1;
                emit_record_skipped(STAGE, &record.build_id, "unknown project");
                continue;
            }
            let Some(created_at) = parse_timestamp(&record.time_created) else {
                stats.builds_bad_timestamp += 1;
                emit_record_skipped(STAGE, &record.build_id, "unparseable creation time");
                continue;
            };

            let build = BuildRecord {
                size_bytes: record.size_bytes,
                modules: record.modules(),
                revisions: record.revisions(),
                log_url: record.log_url.clone(),
                ..BuildRecord::new(
                    record.build_id.trim(),
                    project,
                    record.build_type.unwrap_or(BuildType::Unknown),
                    record.result,
                    created_at,
                )
            };
            if keep_by_policy(&mut out, build.build_id.clone(), build, self.policy) {
                stats.builds_duplicate += 1;
            }
        }

        let mut builds: Vec<BuildRecord> = out.into_values().collect();
        builds.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.build_id.cmp(&b.build_id))
        });
        builds
    }

    /// Link each issue to the latest successful fuzzing build of its project
    /// created strictly before the report, and count faults per build.
    fn link_detections(
        &self,
        raw: &[RawIssue],
        builds: &mut [BuildRecord],
        stats: &mut TransformStats,
    ) -> Vec<DetectionEvent> {
        let mut issues = BTreeMap::new();
        for issue in raw {
            if keep_by_policy(&mut issues, issue.id, issue, self.policy) {
                stats.issues_duplicate += 1;
            }
        }

        let mut detections = Vec::new();
        {
            let mut fuzzing: HashMap<&str, Vec<(&str, DateTime<Utc>)>> = HashMap::new();
            for b in builds.iter().filter(|b| b.is_successful_fuzzing()) {
                fuzzing
                    .entry(b.project.as_str())
                    .or_default()
                    .push((b.build_id.as_str(), b.created_at));
            }

            for (id, issue) in issues {
                let key = id.to_string();
                let Some(project) = issue.project().and_then(normalize_name) else {
                    stats.issues_without_project += 1;
                    emit_record_skipped(STAGE, &key, "issue names no project");
                    continue;
                };
                let Some(reported_at) = parse_timestamp(&issue.reported_at) else {
                    stats.issues_bad_timestamp += 1;
                    emit_record_skipped(STAGE, &key, "unparseable report time");
                    continue;
                };
                let candidates = fuzzing.get(project.as_str()).map(Vec::as_slice).unwrap_or(&[]);
                let idx = candidates.partition_point(|(_, at)| *at < reported_at);
                let Some((build_id, built_at)) = idx.checked_sub(1).map(|i| candidates[i]) else {
                    stats.issues_without_build += 1;
                    emit_record_skipped(STAGE, &key, "no fuzzing build before report");
                    continue;
                };

                detections.push(DetectionEvent {
                    issue_number: id,
                    build_id: build_id.to_string(),
                    project,
                    reported_at,
                    offset_secs: (reported_at - built_at).num_seconds(),
                    status: issue.status.trim().to_string(),
                    crash_type: issue.crash_type().map(str::to_string),
                    severity: issue.severity.clone(),
                });
            }
        }

        let mut faults: HashMap<&str, i64> = HashMap::new();
        for d in &detections {
            *faults.entry(d.build_id.as_str()).or_default() += 1;
        }
        for b in builds.iter_mut() {
            b.detected_faults = faults.get(b.build_id.as_str()).copied().unwrap_or(0);
        }

        detections.sort_by(|a, b| {
            a.reported_at
                .cmp(&b.reported_at)
                .then_with(|| a.issue_number.cmp(&b.issue_number))
        });
        detections
    }
}

/// Insert `value` under `key` following `policy`. Returns true for a duplicate.
fn keep_by_policy<K: Ord, V>(
    map: &mut BTreeMap<K, V>,
    key: K,
    value: V,
    policy: DuplicatePolicy,
) -> bool {
    match map.entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(value);
            false
        }
        Entry::Occupied(mut slot) => {
            if policy == DuplicatePolicy::LastWriteWins {
                slot.insert(value);
            }
            true
        }
    }
}

/// Seconds until the next build of the same project and type.
///
/// `builds` must be ordered by creation time.
fn assign_durations(builds: &mut [BuildRecord]) {
    let mut next: HashMap<(String, BuildType), DateTime<Utc>> = HashMap::new();
    for build in builds.iter_mut().rev() {
        let key = (build.project.clone(), build.build_type);
        build.duration_secs = next
            .get(&key)
            .map(|at| (*at - build.created_at).num_seconds());
        next.insert(key, build.created_at);
    }
}

fn normalize_name(raw: &str) -> Option<String> {
    let name = raw.trim().to_lowercase();
    (!name.is_empty()).then_some(name)
}

/// Canonical project row from a `project.yaml` record.
pub fn normalize_project(raw: &RawProject) -> Option<ProjectRecord> {
    let name = normalize_name(&raw.name)?;
    let yaml = &raw.yaml;
    Some(ProjectRecord {
        name,
        language: string_field(yaml, "language").map(|l| l.to_lowercase()),
        main_repo: string_field(yaml, "main_repo"),
        homepage: string_field(yaml, "homepage"),
        first_commit_at: raw.first_commit_at,
        fuzzing_engines: string_list(yaml.get("fuzzing_engines")),
        sanitizers: string_list(yaml.get("sanitizers")),
        architectures: string_list(yaml.get("architectures")),
        metadata: yaml.clone(),
    })
}

fn string_field(yaml: &Value, key: &str) -> Option<String> {
    yaml.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Flatten a YAML list into names.
///
/// Map entries contribute their keys, so `- memory: {experimental: true}`
/// yields `memory`.
fn string_list(value: Option<&Value>) -> Vec<String> {
    let mut out = Vec::new();
    flatten_into(value, &mut out);
    out
}

fn flatten_into(value: Option<&Value>, out: &mut Vec<String>) {
    match value {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => {
            let s = s.trim();
            if !s.is_empty() {
                out.push(s.to_string());
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                flatten_into(Some(item), out);
            }
        }
        Some(Value::Object(map)) => out.extend(map.keys().cloned()),
        Some(other) => out.push(other.to_string()),
    }
}
