//! RQ1: how the vulnerability detection rate evolves over fuzzing iterations
//!
//! Iteration `i` of a project is its `i`-th successful fuzzing build, over
//! the project's full history. A fixed detection reported after `k` such
//! builds marks the project as detected at iteration `k`; it counts only when
//! a successful fuzzing build created before the cutoff precedes the report.
//! The rate of an iteration is the share of projects reaching it that were
//! detected there.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use fuzzstudy_store::{BuildQuery, StudyStore};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::params::StudyParams;
use crate::stats::percentile;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationStat {
    pub iteration: usize,
    pub total_projects: usize,
    pub detected_projects: usize,
    /// Percent of projects detected at this iteration
    pub detection_rate: f64,
}

/// Spread of the detection rate from `from_iteration` onwards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateStageSummary {
    pub from_iteration: usize,
    pub min: f64,
    pub max: f64,
    pub p25: f64,
    pub p75: f64,
}

/// A fixed detection and the iteration it was attributed to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedDetection {
    pub issue_number: i64,
    pub project: String,
    pub reported_at: DateTime<Utc>,
    pub iteration: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rq1Report {
    pub params: StudyParams,
    pub eligible_projects: usize,
    pub successful_builds: usize,
    pub dropped_iterations: usize,
    pub iterations: Vec<IterationStat>,
    pub late_stage: Option<LateStageSummary>,
    pub detections: Vec<MappedDetection>,
}

/// `detected / total * 100`, or 0.0 for an empty iteration.
pub fn detection_rate(detected: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    detected as f64 / total as f64 * 100.0
}

#[instrument(skip_all, fields(cutoff = %params.cutoff))]
pub async fn run(store: &dyn StudyStore, params: &StudyParams) -> Result<Rq1Report> {
    let eligible = store
        .eligible_projects(params.min_coverage_reports, params.cutoff)
        .await?;
    info!(projects = eligible.len(), "Eligible projects");
    let cutoff = params.cutoff_instant();

    let mut totals: BTreeMap<usize, usize> = BTreeMap::new();
    let mut detected: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
    let mut detections = Vec::new();
    let mut successful_builds = 0;

    for project in &eligible {
        // Iterations run over the whole build history; the cutoff only
        // gates which detections count.
        let builds = store
            .list_builds(&BuildQuery::new().project(project).successful_fuzzing())
            .await?;
        successful_builds += builds.len();
        for iteration in 1..=builds.len() {
            *totals.entry(iteration).or_default() += 1;
        }

        let created: Vec<DateTime<Utc>> = builds.iter().map(|b| b.created_at).collect();
        for event in store.list_detections(Some(project)).await? {
            if !event.is_fixed() || !has_prior_build_before(&created, event.reported_at, cutoff) {
                continue;
            }
            let iteration = created.partition_point(|at| *at < event.reported_at);
            detected
                .entry(iteration)
                .or_default()
                .insert(project.clone());
            detections.push(MappedDetection {
                issue_number: event.issue_number,
                project: project.clone(),
                reported_at: event.reported_at,
                iteration,
            });
        }
    }

    let before = totals.len();
    let iterations: Vec<IterationStat> = totals
        .into_iter()
        .filter(|(_, total)| *total >= params.min_projects)
        .map(|(iteration, total)| {
            let hit = detected.get(&iteration).map(BTreeSet::len).unwrap_or(0);
            IterationStat {
                iteration,
                total_projects: total,
                detected_projects: hit,
                detection_rate: detection_rate(hit, total),
            }
        })
        .collect();

    let late_stage = late_stage_summary(&iterations, params.late_stage_from);
    info!(
        iterations = iterations.len(),
        dropped = before - iterations.len(),
        detections = detections.len(),
        "RQ1 complete"
    );

    Ok(Rq1Report {
        params: params.clone(),
        eligible_projects: eligible.len(),
        successful_builds,
        dropped_iterations: before - iterations.len(),
        iterations,
        late_stage,
        detections,
    })
}

/// True when some build in `created` (ascending) precedes both `reported_at`
/// and `cutoff`.
fn has_prior_build_before(
    created: &[DateTime<Utc>],
    reported_at: DateTime<Utc>,
    cutoff: DateTime<Utc>,
) -> bool {
    created
        .first()
        .is_some_and(|first| *first < reported_at && *first < cutoff)
}

/// Summary over the retained iterations from the `from`-th (1-based) on.
pub fn late_stage_summary(iterations: &[IterationStat], from: usize) -> Option<LateStageSummary> {
    let rates: Vec<f64> = iterations
        .iter()
        .skip(from.saturating_sub(1))
        .map(|s| s.detection_rate)
        .collect();
    Some(LateStageSummary {
        from_iteration: from,
        min: rates.iter().copied().reduce(f64::min)?,
        max: rates.iter().copied().reduce(f64::max)?,
        p25: percentile(&rates, 25.0)?,
        p75: percentile(&rates, 75.0)?,
    })
}
