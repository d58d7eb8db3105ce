//! Study parameters shared by the research-question runners

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Thresholds and cut-offs of the study.
///
/// Defaults reproduce the published analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyParams {
    /// Data on or after this date is ignored
    pub cutoff: NaiveDate,
    /// Positive coverage samples a project needs before the cutoff
    pub min_coverage_reports: u64,
    /// Sessions or iterations observed in fewer projects are dropped
    pub min_projects: usize,
    /// Maximum gap between the fuzzing build and the coverage build at detection
    pub detection_window_hours: i64,
    /// First iteration of the RQ1 late-stage summary (1-based)
    pub late_stage_from: usize,
    /// |rho| above which a project's coverage trend counts as strong
    pub strong_trend: f64,
    /// Stride of the per-session coverage distributions in RQ2
    pub session_stride: usize,
}

impl Default for StudyParams {
    fn default() -> Self {
        Self {
            cutoff: NaiveDate::from_ymd_opt(2025, 1, 8).unwrap_or_default(),
            min_coverage_reports: 365,
            min_projects: 100,
            detection_window_hours: 24,
            late_stage_from: 26,
            strong_trend: 0.5,
            session_stride: 100,
        }
    }
}

impl StudyParams {
    pub fn with_cutoff(mut self, cutoff: NaiveDate) -> Self {
        self.cutoff = cutoff;
        self
    }

    pub fn with_min_coverage_reports(mut self, n: u64) -> Self {
        self.min_coverage_reports = n;
        self
    }

    pub fn with_min_projects(mut self, n: usize) -> Self {
        self.min_projects = n;
        self
    }

    pub fn with_detection_window_hours(mut self, hours: i64) -> Self {
        self.detection_window_hours = hours;
        self
    }

    /// Midnight UTC at the start of the cutoff date.
    pub fn cutoff_instant(&self) -> DateTime<Utc> {
        self.cutoff.and_time(chrono::NaiveTime::MIN).and_utc()
    }

    /// Day after the cutoff; the detection lookup in RQ3 may reach into it.
    pub fn cutoff_grace(&self) -> NaiveDate {
        self.cutoff.succ_opt().unwrap_or(self.cutoff)
    }

    pub fn detection_window(&self) -> Duration {
        Duration::hours(self.detection_window_hours)
    }
}
