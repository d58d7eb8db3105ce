//! RQ3: do coverage changes differ when a bug is detected?
//!
//! A detection is usable when the last successful fuzzing build before the
//! report and the first coverage build after it ran on the same revisions
//! within the detection window. The coverage change on the report date is
//! then a "detected" change; every other consecutive pair of samples of the
//! same project is a "non-detected" change.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use fuzzstudy_store::{
    BuildQuery, BuildRecord, BuildType, CoverageSample, DetectionEvent, StudyStore,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::params::StudyParams;
use crate::stats::{cliffs_delta, mann_whitney_u, median, CliffsDelta, MannWhitney};
use crate::Result;

const SIGNIFICANCE: f64 = 0.05;

/// Difference between two consecutive coverage samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageChange {
    pub project: String,
    /// Report date of the later sample
    pub date: NaiveDate,
    pub percent_diff: f64,
    pub covered_diff: i64,
    pub total_diff: i64,
    /// Detection that selected this change, for the detected group
    pub issue_number: Option<i64>,
}

/// Detected vs non-detected percent changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupComparison {
    pub detected: usize,
    pub non_detected: usize,
    pub detected_median: Option<f64>,
    pub non_detected_median: Option<f64>,
    pub mann_whitney: Option<MannWhitney>,
    pub significant: Option<bool>,
    pub cliffs_delta: Option<CliffsDelta>,
}

impl GroupComparison {
    /// Compare two groups; tests need at least two observations in each.
    pub fn of(detected: &[f64], non_detected: &[f64]) -> Self {
        let testable = detected.len() >= 2 && non_detected.len() >= 2;
        let mann_whitney = testable
            .then(|| mann_whitney_u(detected, non_detected))
            .flatten();
        Self {
            detected: detected.len(),
            non_detected: non_detected.len(),
            detected_median: median(detected),
            non_detected_median: median(non_detected),
            significant: mann_whitney.map(|t| t.p_value < SIGNIFICANCE),
            mann_whitney,
            cliffs_delta: testable
                .then(|| cliffs_delta(detected, non_detected))
                .flatten(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rq3Report {
    pub params: StudyParams,
    pub eligible_projects: usize,
    pub issues_considered: usize,
    pub detected: Vec<CoverageChange>,
    pub non_detected: Vec<CoverageChange>,
    pub comparison: GroupComparison,
}

/// Change from `prev` to `curr`; `None` unless both have positive totals.
pub fn coverage_change(prev: &CoverageSample, curr: &CoverageSample) -> Option<CoverageChange> {
    let (pc, pt) = (prev.covered_lines?, prev.total_lines?);
    let (cc, ct) = (curr.covered_lines?, curr.total_lines?);
    if pt <= 0 || ct <= 0 {
        return None;
    }
    Some(CoverageChange {
        project: curr.project.clone(),
        date: curr.report_date,
        percent_diff: (cc as f64 / ct as f64 - pc as f64 / pt as f64) * 100.0,
        covered_diff: cc - pc,
        total_diff: ct - pt,
        issue_number: None,
    })
}

/// Project data the detection matching works on
struct ProjectHistory {
    fuzzing: Vec<BuildRecord>,
    coverage_builds: Vec<BuildRecord>,
    samples: Vec<CoverageSample>,
}

impl ProjectHistory {
    /// Detected change for one issue, if its builds line up.
    fn detected_change(&self, event: &DetectionEvent, params: &StudyParams) -> Option<CoverageChange> {
        let reported = event.reported_at;
        let Some(fuzz) = self.fuzzing.iter().rev().find(|b| b.created_at < reported) else {
            debug!(issue = event.issue_number, "No fuzzing build before report");
            return None;
        };
        let cov = self.coverage_builds.iter().find(|b| b.created_at > reported)?;
        if !cov.result.is_successful() {
            return None;
        }
        if fuzz.sorted_revisions() != cov.sorted_revisions() {
            debug!(issue = event.issue_number, "Revision sets differ");
            return None;
        }
        if cov.created_at - fuzz.created_at > params.detection_window() {
            return None;
        }

        let day = reported.date_naive();
        let idx = self.samples.iter().position(|s| s.report_date == day)?;
        let prev = self.samples.get(idx.checked_sub(1)?)?;
        let mut change = coverage_change(prev, &self.samples[idx])?;
        change.issue_number = Some(event.issue_number);
        Some(change)
    }

    /// Consecutive changes whose later date has no detected change.
    fn non_detected_changes(&self, detected_dates: &BTreeSet<NaiveDate>) -> Vec<CoverageChange> {
        self.samples
            .windows(2)
            .filter(|pair| !detected_dates.contains(&pair[1].report_date))
            .filter_map(|pair| coverage_change(&pair[0], &pair[1]))
            .collect()
    }
}

#[instrument(skip_all, fields(cutoff = %params.cutoff))]
pub async fn run(store: &dyn StudyStore, params: &StudyParams) -> Result<Rq3Report> {
    let eligible = store
        .eligible_projects(params.min_coverage_reports, params.cutoff)
        .await?;
    info!(projects = eligible.len(), "Eligible projects");
    let cutoff = params.cutoff_instant();
    let grace = params.cutoff_grace();
    let grace_instant = grace.and_time(chrono::NaiveTime::MIN).and_utc();

    let mut detected = Vec::new();
    let mut non_detected = Vec::new();
    let mut issues_considered = 0;

    for project in &eligible {
        let issues: Vec<DetectionEvent> = store
            .list_detections(Some(project))
            .await?
            .into_iter()
            .filter(|d| d.is_fixed() && d.reported_at < cutoff)
            .collect();
        issues_considered += issues.len();

        let history = ProjectHistory {
            fuzzing: store
                .list_builds(
                    &BuildQuery::new()
                        .project(project)
                        .successful_fuzzing()
                        .before(cutoff),
                )
                .await?,
            coverage_builds: store
                .list_builds(
                    &BuildQuery::new()
                        .project(project)
                        .build_type(BuildType::Coverage)
                        .before(grace_instant),
                )
                .await?,
            samples: store
                .coverage_series(project, Some(grace))
                .await?
                .into_iter()
                .filter(|s| s.covered_lines.is_some())
                .collect(),
        };

        let mut dates = BTreeSet::new();
        for event in &issues {
            if let Some(change) = history.detected_change(event, params) {
                dates.insert(change.date);
                detected.push(change);
            }
        }
        non_detected.extend(history.non_detected_changes(&dates));
    }

    let d: Vec<f64> = detected.iter().map(|c| c.percent_diff).collect();
    let n: Vec<f64> = non_detected.iter().map(|c| c.percent_diff).collect();
    let comparison = GroupComparison::of(&d, &n);
    info!(
        detected = detected.len(),
        non_detected = non_detected.len(),
        p_value = ?comparison.mann_whitney.map(|t| t.p_value),
        "RQ3 complete"
    );

    Ok(Rq3Report {
        params: params.clone(),
        eligible_projects: eligible.len(),
        issues_considered,
        detected,
        non_detected,
        comparison,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(day: u32, covered: i64, total: i64) -> CoverageSample {
        CoverageSample::measured(
            format!("c{day}"),
            "zlib",
            NaiveDate::from_ymd_opt(2024, 5, day).unwrap(),
            covered,
            total,
        )
        .unwrap()
    }

    #[test]
    fn change_between_samples() {
        let c = coverage_change(&sample(1, 50, 100), &sample(2, 60, 120)).unwrap();
        assert_eq!(c.covered_diff, 10);
        assert_eq!(c.total_diff, 20);
        assert!(c.percent_diff.abs() < 1e-12);
        assert!(coverage_change(&sample(1, 0, 0), &sample(2, 1, 2)).is_none());
    }

    #[test]
    fn comparison_needs_two_observations_per_group() {
        let cmp = GroupComparison::of(&[1.0], &[0.0, 0.5, 0.2]);
        assert!(cmp.mann_whitney.is_none());
        assert!(cmp.cliffs_delta.is_none());
        assert_eq!(cmp.detected_median, Some(1.0));

        let cmp = GroupComparison::of(&[3.0, 4.0, 5.0], &[0.0, 0.1, 0.2]);
        assert_eq!(cmp.cliffs_delta.unwrap().delta, 1.0);
        assert!(cmp.significant.is_some());
    }
}
