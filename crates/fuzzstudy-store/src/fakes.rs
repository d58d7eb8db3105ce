//! In-memory fake for the storage traits (testing only)
//!
//! `MemoryStore` satisfies the same contracts as `PgStore`, including
//! referential checks and all-or-nothing batch writes, without a database.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::StoreError;
use crate::schema::{
    BuildRecord, BuildType, CoverageSample, DetectionEvent, ProjectRecord, StageRunRecord,
};
use crate::storage_traits::*;

#[derive(Debug, Default, Clone)]
struct Tables {
    projects: BTreeMap<String, ProjectRecord>,
    builds: BTreeMap<String, BuildRecord>,
    coverage: BTreeMap<String, CoverageSample>,
    detections: BTreeMap<i64, DetectionEvent>,
    stage_runs: Vec<StageRunRecord>,
}

/// In-memory store backed by ordered maps keyed by natural identity.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored (projects, builds, coverage samples, detections).
    pub fn row_counts(&self) -> (usize, usize, usize, usize) {
        let t = self.tables.lock().unwrap();
        (
            t.projects.len(),
            t.builds.len(),
            t.coverage.len(),
            t.detections.len(),
        )
    }
}

fn upsert<K: Ord, V: PartialEq>(
    map: &mut BTreeMap<K, V>,
    key: K,
    value: V,
    policy: DuplicatePolicy,
) -> u64 {
    match (map.get(&key), policy) {
        (None, _) => {
            map.insert(key, value);
            1
        }
        (Some(_), DuplicatePolicy::KeepFirst) => 0,
        (Some(_), DuplicatePolicy::LastWriteWins) => {
            map.insert(key, value);
            1
        }
    }
}

#[async_trait]
impl BatchWriter for MemoryStore {
    async fn write_batch(
        &self,
        batch: &CanonicalBatch,
        policy: DuplicatePolicy,
    ) -> StoreResult<BatchCounts> {
        let mut tables = self.tables.lock().unwrap();

        // Validate every reference before touching any table.
        let projects: HashSet<&str> = tables
            .projects
            .keys()
            .map(String::as_str)
            .chain(batch.projects.iter().map(|p| p.name.as_str()))
            .collect();
        for b in &batch.builds {
            if !projects.contains(b.project.as_str()) {
                return Err(StoreError::MissingReference {
                    entity: "build".to_string(),
                    target: "project".to_string(),
                    key: b.build_id.clone(),
                });
            }
        }
        let builds: HashSet<&str> = tables
            .builds
            .keys()
            .map(String::as_str)
            .chain(batch.builds.iter().map(|b| b.build_id.as_str()))
            .collect();
        for d in &batch.detections {
            if !builds.contains(d.build_id.as_str()) || !projects.contains(d.project.as_str()) {
                return Err(StoreError::MissingReference {
                    entity: "detection".to_string(),
                    target: "build".to_string(),
                    key: d.issue_number.to_string(),
                });
            }
            if d.offset_secs < 0 {
                return Err(StoreError::InvalidValue {
                    field: "offset_secs".to_string(),
                    value: d.offset_secs.to_string(),
                });
            }
        }
        drop(projects);
        drop(builds);

        let mut counts = BatchCounts::default();
        for p in &batch.projects {
            counts.projects += upsert(&mut tables.projects, p.name.clone(), p.clone(), policy);
        }
        for b in &batch.builds {
            counts.builds += upsert(&mut tables.builds, b.build_id.clone(), b.clone(), policy);
        }
        for d in &batch.detections {
            counts.detections += upsert(&mut tables.detections, d.issue_number, d.clone(), policy);
        }
        refresh_derived(&mut tables, &batch.touched_projects());
        Ok(counts)
    }
}

/// Recompute fault counts and durations of the builds of `projects`.
fn refresh_derived(tables: &mut Tables, projects: &BTreeSet<String>) {
    let mut faults: HashMap<String, i64> = HashMap::new();
    for d in tables.detections.values() {
        *faults.entry(d.build_id.clone()).or_default() += 1;
    }

    let mut series: HashMap<(String, BuildType), Vec<(DateTime<Utc>, String)>> = HashMap::new();
    for b in tables.builds.values_mut() {
        if !projects.contains(&b.project) {
            continue;
        }
        b.detected_faults = faults.get(&b.build_id).copied().unwrap_or(0);
        series
            .entry((b.project.clone(), b.build_type))
            .or_default()
            .push((b.created_at, b.build_id.clone()));
    }

    for mut ordered in series.into_values() {
        ordered.sort();
        let mut next: Option<DateTime<Utc>> = None;
        for (created_at, build_id) in ordered.into_iter().rev() {
            if let Some(b) = tables.builds.get_mut(&build_id) {
                b.duration_secs = next.map(|at| (at - created_at).num_seconds());
            }
            next = Some(created_at);
        }
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn get_project(&self, name: &str) -> StoreResult<Option<ProjectRecord>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.projects.get(name).cloned())
    }

    async fn list_projects(&self) -> StoreResult<Vec<ProjectRecord>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.projects.values().cloned().collect())
    }
}

fn sort_builds(builds: &mut [BuildRecord]) {
    builds.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.build_id.cmp(&b.build_id))
    });
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn get_build(&self, build_id: &str) -> StoreResult<Option<BuildRecord>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.builds.get(build_id).cloned())
    }

    async fn list_builds(&self, query: &BuildQuery) -> StoreResult<Vec<BuildRecord>> {
        let tables = self.tables.lock().unwrap();
        let mut out: Vec<BuildRecord> = tables
            .builds
            .values()
            .filter(|b| query.matches(b))
            .cloned()
            .collect();
        sort_builds(&mut out);
        Ok(out)
    }

    async fn count_builds(&self, query: &BuildQuery) -> StoreResult<u64> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.builds.values().filter(|b| query.matches(b)).count() as u64)
    }
}

#[async_trait]
impl CoverageStore for MemoryStore {
    async fn insert_coverage(&self, sample: &CoverageSample) -> StoreResult<()> {
        sample.validate()?;
        let mut tables = self.tables.lock().unwrap();
        if !tables.builds.contains_key(&sample.build_id)
            || !tables.projects.contains_key(&sample.project)
        {
            return Err(StoreError::MissingReference {
                entity: "coverage sample".to_string(),
                target: "build".to_string(),
                key: sample.build_id.clone(),
            });
        }
        if tables.coverage.contains_key(&sample.build_id) {
            return Err(StoreError::Duplicate {
                entity: "coverage sample".to_string(),
                key: sample.build_id.clone(),
            });
        }
        tables
            .coverage
            .insert(sample.build_id.clone(), sample.clone());
        Ok(())
    }

    async fn builds_missing_coverage(&self) -> StoreResult<Vec<BuildRecord>> {
        let tables = self.tables.lock().unwrap();
        let mut out: Vec<BuildRecord> = tables
            .builds
            .values()
            .filter(|b| b.build_type == BuildType::Coverage)
            .filter(|b| !tables.coverage.contains_key(&b.build_id))
            .cloned()
            .collect();
        sort_builds(&mut out);
        Ok(out)
    }

    async fn coverage_series(
        &self,
        project: &str,
        before: Option<NaiveDate>,
    ) -> StoreResult<Vec<CoverageSample>> {
        let tables = self.tables.lock().unwrap();
        let mut out: Vec<CoverageSample> = tables
            .coverage
            .values()
            .filter(|s| s.project == project)
            .filter(|s| before.map_or(true, |d| s.report_date < d))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.report_date
                .cmp(&b.report_date)
                .then_with(|| a.build_id.cmp(&b.build_id))
        });
        Ok(out)
    }

    async fn eligible_projects(
        &self,
        min_samples: u64,
        before: NaiveDate,
    ) -> StoreResult<Vec<String>> {
        let tables = self.tables.lock().unwrap();
        let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
        for s in tables.coverage.values() {
            let positive = s.coverage.map_or(false, |c| c.value() > 0.0);
            if positive && s.report_date < before {
                *counts.entry(s.project.as_str()).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .filter(|(_, n)| *n >= min_samples)
            .map(|(p, _)| p.to_string())
            .collect())
    }
}

#[async_trait]
impl DetectionStore for MemoryStore {
    async fn list_detections(&self, project: Option<&str>) -> StoreResult<Vec<DetectionEvent>> {
        let tables = self.tables.lock().unwrap();
        let mut out: Vec<DetectionEvent> = tables
            .detections
            .values()
            .filter(|d| project.map_or(true, |p| d.project == p))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.reported_at
                .cmp(&b.reported_at)
                .then_with(|| a.issue_number.cmp(&b.issue_number))
        });
        Ok(out)
    }
}

#[async_trait]
impl StageLedger for MemoryStore {
    async fn record_stage_run(&self, record: &StageRunRecord) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.stage_runs.push(record.clone());
        Ok(())
    }

    async fn list_stage_runs(&self, limit: usize) -> StoreResult<Vec<StageRunRecord>> {
        let tables = self.tables.lock().unwrap();
        let mut out: Vec<(usize, StageRunRecord)> =
            tables.stage_runs.iter().cloned().enumerate().collect();
        out.sort_by(|(ia, a), (ib, b)| b.started_at.cmp(&a.started_at).then(ib.cmp(ia)));
        Ok(out.into_iter().take(limit).map(|(_, r)| r).collect())
    }
}
