//! RQ2: how line coverage evolves over coverage measurements

use fuzzstudy_store::{CoverageSample, StudyStore};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::params::StudyParams;
use crate::stats::{mean, median, pearson, spearman, BoxSummary, Correlation};
use crate::Result;

/// One project's coverage series and its trend against session index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectTrend {
    pub project: String,
    pub sessions: usize,
    pub first_coverage: Option<f64>,
    pub last_coverage: Option<f64>,
    /// Spearman rho vs session index; absent for short or constant series
    pub spearman: Option<Correlation>,
}

/// Cross-project coverage at one session index (1-based)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStat {
    pub session: usize,
    pub projects: usize,
    pub mean: f64,
    pub median: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBox {
    pub session: usize,
    pub summary: BoxSummary,
}

/// Distribution of the per-project rho values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationSummary {
    pub projects: usize,
    pub valid: usize,
    pub mean: Option<f64>,
    pub median: Option<f64>,
}

/// Correlation of the mean and median session trends against session index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendCorrelations {
    pub pearson_mean: Option<Correlation>,
    pub pearson_median: Option<Correlation>,
    pub spearman_mean: Option<Correlation>,
    pub spearman_median: Option<Correlation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rq2Report {
    pub params: StudyParams,
    pub eligible_projects: usize,
    pub projects: Vec<ProjectTrend>,
    /// Projects with |rho| above the strong-trend threshold
    pub strong_trends: Vec<String>,
    pub correlation_summary: CorrelationSummary,
    /// Sessions observed in at least `min_projects` projects
    pub sessions: Vec<SessionStat>,
    /// Box-plot rows every `session_stride` sessions
    pub session_boxes: Vec<SessionBox>,
    pub trend_correlations: TrendCorrelations,
}

/// Coverage percentages of a series, skipping samples without line counts
/// or with zero total lines.
pub fn coverage_trend(samples: &[CoverageSample]) -> Vec<f64> {
    samples
        .iter()
        .filter_map(|s| match (s.covered_lines, s.total_lines) {
            (Some(covered), Some(total)) if total != 0 => {
                Some(covered as f64 / total as f64 * 100.0)
            }
            _ => None,
        })
        .collect()
}

/// Spearman rho of a series against its index.
pub fn index_correlation(series: &[f64], rank: bool) -> Option<Correlation> {
    let index: Vec<f64> = (0..series.len()).map(|i| i as f64).collect();
    if rank {
        spearman(&index, series)
    } else {
        pearson(&index, series)
    }
}

#[instrument(skip_all, fields(cutoff = %params.cutoff))]
pub async fn run(store: &dyn StudyStore, params: &StudyParams) -> Result<Rq2Report> {
    let eligible = store
        .eligible_projects(params.min_coverage_reports, params.cutoff)
        .await?;
    info!(projects = eligible.len(), "Eligible projects");

    let mut projects = Vec::with_capacity(eligible.len());
    let mut by_session: Vec<Vec<f64>> = Vec::new();

    for project in &eligible {
        let samples: Vec<CoverageSample> = store
            .coverage_series(project, Some(params.cutoff))
            .await?
            .into_iter()
            .filter(|s| s.coverage.is_some_and(|c| c.value() > 0.0))
            .collect();
        if samples.is_empty() {
            continue;
        }
        let trend = coverage_trend(&samples);

        for (i, value) in trend.iter().enumerate() {
            if by_session.len() <= i {
                by_session.push(Vec::new());
            }
            by_session[i].push(*value);
        }
        projects.push(ProjectTrend {
            project: project.clone(),
            sessions: trend.len(),
            first_coverage: trend.first().copied(),
            last_coverage: trend.last().copied(),
            spearman: index_correlation(&trend, true),
        });
    }

    let strong_trends: Vec<String> = projects
        .iter()
        .filter(|p| {
            p.spearman
                .is_some_and(|c| c.coefficient.abs() > params.strong_trend)
        })
        .map(|p| p.project.clone())
        .collect();

    let rhos: Vec<f64> = projects
        .iter()
        .filter_map(|p| p.spearman.map(|c| c.coefficient))
        .collect();
    let correlation_summary = CorrelationSummary {
        projects: projects.len(),
        valid: rhos.len(),
        mean: mean(&rhos),
        median: median(&rhos),
    };

    let sessions: Vec<SessionStat> = by_session
        .iter()
        .enumerate()
        .filter(|(_, values)| values.len() >= params.min_projects)
        .filter_map(|(i, values)| {
            Some(SessionStat {
                session: i + 1,
                projects: values.len(),
                mean: mean(values)?,
                median: median(values)?,
            })
        })
        .collect();

    let session_boxes = by_session
        .iter()
        .enumerate()
        .step_by(params.session_stride.max(1))
        .filter(|(_, values)| values.len() >= params.min_projects)
        .filter_map(|(i, values)| {
            Some(SessionBox {
                session: i + 1,
                summary: BoxSummary::of(values)?,
            })
        })
        .collect();

    let trend_correlations = if sessions.len() > 1 {
        let means: Vec<f64> = sessions.iter().map(|s| s.mean).collect();
        let medians: Vec<f64> = sessions.iter().map(|s| s.median).collect();
        TrendCorrelations {
            pearson_mean: index_correlation(&means, false),
            pearson_median: index_correlation(&medians, false),
            spearman_mean: index_correlation(&means, true),
            spearman_median: index_correlation(&medians, true),
        }
    } else {
        TrendCorrelations::default()
    };

    info!(
        projects = projects.len(),
        strong = strong_trends.len(),
        sessions = sessions.len(),
        "RQ2 complete"
    );

    Ok(Rq2Report {
        params: params.clone(),
        eligible_projects: eligible.len(),
        projects,
        strong_trends,
        correlation_summary,
        sessions,
        session_boxes,
        trend_correlations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample(day: u32, covered: i64, total: i64) -> CoverageSample {
        CoverageSample::measured(
            format!("b{day}"),
            "zlib",
            NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            covered,
            total,
        )
        .unwrap()
    }

    #[test]
    fn trend_skips_unmeasured_and_empty_reports() {
        let mut samples = vec![sample(1, 50, 100), sample(2, 0, 0), sample(3, 30, 40)];
        samples.push(CoverageSample::missing(
            "b4",
            "zlib",
            NaiveDate::from_ymd_opt(2024, 1, 4).unwrap(),
        ));
        assert_eq!(coverage_trend(&samples), vec![50.0, 75.0]);
    }

    #[test]
    fn index_correlation_of_rising_series() {
        let rho = index_correlation(&[10.0, 20.0, 15.0, 30.0, 40.0], true).unwrap();
        assert!((rho.coefficient - 0.9).abs() < 1e-12);
        assert!(index_correlation(&[10.0], true).is_none());
        assert!(index_correlation(&[5.0, 5.0, 5.0], true).is_none());
    }
}
