//! JSON and Markdown artifacts of the research-question runs

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::ResearchError;
use crate::rq1::Rq1Report;
use crate::rq2::Rq2Report;
use crate::rq3::Rq3Report;
use crate::stats::Correlation;
use crate::Result;

pub const RQ1_JSON: &str = "rq1_detection_rate_stats.json";
pub const RQ1_MD: &str = "rq1_summary.md";
pub const RQ2_JSON: &str = "rq2_coverage_trend.json";
pub const RQ2_MD: &str = "rq2_summary.md";
pub const RQ3_JSON: &str = "rq3_coverage_changes.json";
pub const RQ3_MD: &str = "rq3_summary.md";

/// Write `value` as pretty JSON.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    write_text(path, &content)
}

fn write_text(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ResearchError::Artifact {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, content).map_err(|source| ResearchError::Artifact {
        path: path.to_path_buf(),
        source,
    })
}

fn opt(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.4}"))
}

fn corr(value: Option<Correlation>) -> String {
    value.map_or_else(
        || "n/a".to_string(),
        |c| format!("{:.4} (p = {:.4})", c.coefficient, c.p_value),
    )
}

/// Render the RQ1 summary.
pub fn render_rq1_md(report: &Rq1Report) -> String {
    let mut out = String::new();
    out.push_str("# RQ1: Detection Rate per Fuzzing Iteration\n\n");
    out.push_str(&format!(
        "- cutoff: {}\n- eligible projects: {}\n- successful fuzzing builds: {}\n- mapped detections: {}\n- iterations kept: {}\n- iterations dropped (< {} projects): {}\n\n",
        report.params.cutoff,
        report.eligible_projects,
        report.successful_builds,
        report.detections.len(),
        report.iterations.len(),
        report.params.min_projects,
        report.dropped_iterations
    ));

    if let Some(late) = &report.late_stage {
        out.push_str(&format!(
            "## Iterations {}+\n- min: {:.4}%\n- max: {:.4}%\n- 25th percentile: {:.4}%\n- 75th percentile: {:.4}%\n\n",
            late.from_iteration, late.min, late.max, late.p25, late.p75
        ));
    }

    if !report.iterations.is_empty() {
        out.push_str("## Iterations\n");
        out.push_str("| iteration | projects | detected | rate (%) |\n");
        out.push_str("|---|---|---|---|\n");
        for s in &report.iterations {
            out.push_str(&format!(
                "| {} | {} | {} | {:.4} |\n",
                s.iteration, s.total_projects, s.detected_projects, s.detection_rate
            ));
        }
    }
    out
}

/// Render the RQ2 summary.
pub fn render_rq2_md(report: &Rq2Report) -> String {
    let mut out = String::new();
    out.push_str("# RQ2: Coverage Trend\n\n");
    let cs = &report.correlation_summary;
    out.push_str(&format!(
        "- cutoff: {}\n- eligible projects: {}\n- projects with a valid rho: {} of {}\n- mean rho: {}\n- median rho: {}\n- strong trends (|rho| > {}): {}\n\n",
        report.params.cutoff,
        report.eligible_projects,
        cs.valid,
        cs.projects,
        opt(cs.mean),
        opt(cs.median),
        report.params.strong_trend,
        report.strong_trends.len()
    ));

    let tc = &report.trend_correlations;
    out.push_str(&format!(
        "## Session Trend ({} sessions with >= {} projects)\n- pearson (mean): {}\n- pearson (median): {}\n- spearman (mean): {}\n- spearman (median): {}\n\n",
        report.sessions.len(),
        report.params.min_projects,
        corr(tc.pearson_mean),
        corr(tc.pearson_median),
        corr(tc.spearman_mean),
        corr(tc.spearman_median)
    ));

    if !report.session_boxes.is_empty() {
        out.push_str("## Coverage Distribution\n");
        out.push_str("| session | n | min | q1 | median | q3 | max |\n");
        out.push_str("|---|---|---|---|---|---|---|\n");
        for b in &report.session_boxes {
            let s = &b.summary;
            out.push_str(&format!(
                "| {} | {} | {:.2} | {:.2} | {:.2} | {:.2} | {:.2} |\n",
                b.session, s.n, s.min, s.q1, s.median, s.q3, s.max
            ));
        }
        out.push('\n');
    }

    if !report.strong_trends.is_empty() {
        out.push_str("## Strong Trends\n");
        for p in &report.strong_trends {
            out.push_str(&format!("- `{p}`\n"));
        }
    }
    out
}

/// Render the RQ3 summary.
pub fn render_rq3_md(report: &Rq3Report) -> String {
    let mut out = String::new();
    let c = &report.comparison;
    out.push_str("# RQ3: Coverage Change at Detection\n\n");
    out.push_str(&format!(
        "- cutoff: {}\n- eligible projects: {}\n- fixed issues considered: {}\n- detected changes: {}\n- non-detected changes: {}\n- median change (detected): {}\n- median change (non-detected): {}\n\n",
        report.params.cutoff,
        report.eligible_projects,
        report.issues_considered,
        c.detected,
        c.non_detected,
        opt(c.detected_median),
        opt(c.non_detected_median)
    ));

    out.push_str("## Mann-Whitney U\n");
    match (&c.mann_whitney, &c.cliffs_delta) {
        (Some(mw), Some(cd)) => {
            out.push_str(&format!(
                "- U: {:.1}\n- p-value: {:.6}\n- significant (p < 0.05): {}\n- Cliff's delta: {:.4} ({})\n",
                mw.u,
                mw.p_value,
                if c.significant == Some(true) { "yes" } else { "no" },
                cd.delta,
                cd.magnitude.as_str()
            ));
        }
        _ => out.push_str("- not enough observations for a test\n"),
    }
    out
}

/// Write the RQ1 JSON and Markdown artifacts into `dir`.
pub fn write_rq1(dir: &Path, report: &Rq1Report) -> Result<Vec<PathBuf>> {
    write_pair(dir, (RQ1_JSON, report), (RQ1_MD, render_rq1_md(report)))
}

pub fn write_rq2(dir: &Path, report: &Rq2Report) -> Result<Vec<PathBuf>> {
    write_pair(dir, (RQ2_JSON, report), (RQ2_MD, render_rq2_md(report)))
}

pub fn write_rq3(dir: &Path, report: &Rq3Report) -> Result<Vec<PathBuf>> {
    write_pair(dir, (RQ3_JSON, report), (RQ3_MD, render_rq3_md(report)))
}

fn write_pair<T: Serialize>(
    dir: &Path,
    (json_name, value): (&str, &T),
    (md_name, markdown): (&str, String),
) -> Result<Vec<PathBuf>> {
    let json_path = dir.join(json_name);
    let md_path = dir.join(md_name);
    write_json(&json_path, value)?;
    write_text(&md_path, &markdown)?;
    Ok(vec![json_path, md_path])
}
