//! Raw collector records and their JSON Lines files
//!
//! Collectors append to these files; the transformer reads them back.
//! Reading is strict: a malformed line is an error naming file and line.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use fuzzstudy_store::{BuildResult, BuildType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CollectError;
use crate::Result;

/// One `projects/<name>/project.yaml` with its first commit time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawProject {
    pub name: String,
    pub first_commit_at: Option<DateTime<Utc>>,
    /// YAML document converted to JSON, keys untouched
    pub yaml: serde_json::Value,
}

/// Listing entry for one build log object in GCS
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBuildlogMeta {
    pub name: String,
    #[serde(default)]
    pub self_link: Option<String>,
    #[serde(default)]
    pub media_link: Option<String>,
    /// GCS reports object size as a decimal string
    #[serde(default)]
    pub size: Option<String>,
    pub time_created: String,
}

impl RawBuildlogMeta {
    /// `log-<uuid>.txt` -> `<uuid>`
    pub fn build_id(&self) -> &str {
        let id = self.name.strip_prefix("log-").unwrap_or(&self.name);
        id.strip_suffix(".txt").unwrap_or(id)
    }

    pub fn size_bytes(&self) -> i64 {
        self.size
            .as_deref()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Source checkout named in a build log (srcmap entry)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub path: String,
    pub kind: String,
    pub url: String,
    pub rev: String,
}

impl SourceEntry {
    /// Last path segment, first letter upper-cased and the rest lower-cased.
    pub fn module_name(&self) -> String {
        let last = self.path.rsplit('/').next().unwrap_or_default();
        let mut chars = last.chars();
        match chars.next() {
            Some(first) => first
                .to_uppercase()
                .chain(chars.flat_map(char::to_lowercase))
                .collect(),
            None => String::new(),
        }
    }
}

/// Output of the build-log analyser for one log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBuildAnalysis {
    pub build_id: String,
    pub project: Option<String>,
    pub build_type: Option<BuildType>,
    pub result: BuildResult,
    pub time_created: String,
    pub size_bytes: i64,
    pub sources: Vec<SourceEntry>,
    pub log_url: Option<String>,
}

impl RawBuildAnalysis {
    pub fn modules(&self) -> Vec<String> {
        self.sources.iter().map(SourceEntry::module_name).collect()
    }

    pub fn revisions(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.rev.clone()).collect()
    }
}

/// One OSS-Fuzz issue with its parsed description block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawIssue {
    pub id: i64,
    pub url: Option<String>,
    pub status: String,
    pub severity: Option<String>,
    pub reported_at: String,
    pub fixed_at: Option<String>,
    /// Description labels to their value lines
    pub description: BTreeMap<String, Vec<String>>,
}

impl RawIssue {
    /// First value line of a description label.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.description
            .get(key)
            .and_then(|v| v.first())
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn project(&self) -> Option<&str> {
        self.field("Project")
    }

    pub fn crash_type(&self) -> Option<&str> {
        self.field("Crash Type")
    }
}

/// Parse the timestamp shapes seen in collector output.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM[:SS]` (UTC) and bare dates (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}

/// Read every record of a JSON Lines file. Blank lines are skipped.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Err(CollectError::MissingInput(path.to_path_buf()));
    }
    let reader = BufReader::new(fs::File::open(path)?);
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| CollectError::InvalidLine {
            path: path.to_path_buf(),
            line: idx + 1,
            message: e.to_string(),
        })?;
        out.push(record);
    }
    Ok(out)
}

/// Like `read_jsonl`, but a missing file reads as empty.
pub fn read_jsonl_or_empty<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if path.exists() {
        read_jsonl(path)
    } else {
        Ok(Vec::new())
    }
}

/// Append records, creating the file and its parent directory if needed.
pub fn append_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut buf = String::new();
    for record in records {
        buf.push_str(&serde_json::to_string(record)?);
        buf.push('\n');
    }
    file.write_all(buf.as_bytes())?;
    Ok(())
}

/// Replace the file with exactly these records.
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut buf = String::new();
    for record in records {
        buf.push_str(&serde_json::to_string(record)?);
        buf.push('\n');
    }
    fs::write(path, buf)?;
    Ok(())
}

/// Keys already present in an output file, for resumable collectors.
pub fn existing_keys<T, K, F>(path: &Path, key: F) -> Result<HashSet<K>>
where
    T: DeserializeOwned,
    K: std::hash::Hash + Eq,
    F: Fn(&T) -> K,
{
    Ok(read_jsonl_or_empty::<T>(path)?.iter().map(key).collect())
}
