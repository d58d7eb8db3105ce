//! OSS-Fuzz issue report collector
//!
//! Consumes issue pages exported as JSON (one file per issue) and parses the
//! ClusterFuzz description block into labelled fields.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::error::CollectError;
use crate::raw::{append_jsonl, existing_keys, RawIssue};
use crate::Result;

/// Description labels recognised at the start of a line.
pub const DESCRIPTION_KEYS: &[&str] = &[
    "Project",
    "Fuzzing Engine",
    "Fuzz Target",
    "Fuzz target binary",
    "Fuzzer",
    "Fuzzer binary",
    "Job Type",
    "Platform Id",
    "Crash Type",
    "Crash Address",
    "Crash State",
    "Sanitizer",
    "Regressed",
    "Crash Revision",
    "Reproducer Testcase",
    "Minimized Testcase",
    "Unminimized Testcase",
    "Recommended Security Severity",
    "Download",
    "Fixed",
    "Build log",
    "Build type",
];

/// Labels whose value may carry trailing text after a URL.
const URL_KEYS: &[&str] = &[
    "Regressed",
    "Fixed",
    "Crash Revision",
    "Build log",
    "Reproducer Testcase",
    "Minimized Testcase",
];

/// Saved issue page as exported from the tracker
#[derive(Debug, Clone, Deserialize)]
pub struct IssuePage {
    pub id: i64,
    #[serde(default)]
    pub url: Option<String>,
    pub status: String,
    #[serde(default)]
    pub severity: Option<String>,
    pub reported: String,
    #[serde(default)]
    pub fixed_time: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl IssuePage {
    pub fn into_raw(self) -> RawIssue {
        RawIssue {
            id: self.id,
            url: self.url,
            status: self.status.trim().to_string(),
            severity: self.severity.filter(|s| !s.trim().is_empty() && s.trim() != "--"),
            reported_at: self.reported,
            fixed_at: self.fixed_time,
            description: parse_description(&self.description),
        }
    }
}

fn key_patterns() -> &'static Vec<(&'static str, Regex)> {
    static P: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    P.get_or_init(|| {
        DESCRIPTION_KEYS
            .iter()
            .map(|key| {
                let pattern = format!(r"(?i)^{}(?:\s*\(.*\))?\s*:", regex::escape(key));
                (*key, Regex::new(&pattern).expect("escaped label pattern"))
            })
            .collect()
    })
}

/// Parse a description block into label -> value lines.
///
/// A label line starts a value; following lines continue it until a blank
/// line, another label, or tracker boilerplate ("Issue filed automatically",
/// "See ...").
pub fn parse_description(text: &str) -> BTreeMap<String, Vec<String>> {
    let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut current: Option<&'static str> = None;

    for line in text.lines() {
        let line = line.trim().replace("<b>", "").replace("</b>", "");
        if line.is_empty() {
            current = None;
            continue;
        }
        let bare = line.replace("**", "");

        let matched = key_patterns()
            .iter()
            .find(|(_, re)| re.is_match(&bare))
            .map(|(key, _)| *key);

        match matched {
            Some(key) => {
                let value = bare
                    .split_once(':')
                    .map(|(_, v)| v.trim())
                    .unwrap_or_default();
                let value = if URL_KEYS.contains(&key) && value.contains("http") {
                    value.split(' ').next().unwrap_or_default()
                } else {
                    value
                };
                fields.insert(key.to_string(), vec![value.to_string()]);
                current = Some(key);
            }
            None => {
                let Some(key) = current else { continue };
                if line.contains("Issue filed automatically") || line.contains("See ") {
                    current = None;
                    continue;
                }
                let values = fields.entry(key.to_string()).or_default();
                if values.len() == 1 && values[0].is_empty() {
                    values[0] = line.clone();
                } else {
                    values.push(line.clone());
                }
            }
        }
    }
    fields
}

/// Reads exported issue pages from a directory
pub struct IssueCollector;

impl IssueCollector {
    /// Parse every `*.json` page in `input_dir` whose id is not yet in
    /// `out_path`, appending the results. Unparseable files are skipped.
    #[instrument(skip_all, fields(input = %input_dir.display()))]
    pub fn collect_to(input_dir: &Path, out_path: &Path) -> Result<usize> {
        if !input_dir.is_dir() {
            return Err(CollectError::MissingInput(input_dir.to_path_buf()));
        }
        let done = existing_keys(out_path, |i: &RawIssue| i.id)?;

        let mut files: Vec<_> = fs::read_dir(input_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut fresh = Vec::new();
        for path in files {
            let page = fs::read_to_string(&path)
                .map_err(CollectError::from)
                .and_then(|text| serde_json::from_str::<IssuePage>(&text).map_err(Into::into));
            match page {
                Ok(page) if done.contains(&page.id) => continue,
                Ok(page) => fresh.push(page.into_raw()),
                Err(e) => warn!(file = %path.display(), error = %e, "Skipping unparseable issue page"),
            }
        }

        fresh.sort_by_key(|i| i.id);
        fresh.dedup_by_key(|i| i.id);
        append_jsonl(out_path, &fresh)?;
        info!(
            new = fresh.len(),
            skipped_existing = done.len(),
            "Issue collection complete"
        );
        Ok(fresh.len())
    }
}
