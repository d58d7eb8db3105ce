//! OSS-Fuzz project metadata collector
//!
//! Clones (or reuses) the OSS-Fuzz repository and turns each
//! `projects/<name>/project.yaml` into a `RawProject`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::error::CollectError;
use crate::raw::{write_jsonl, RawProject};
use crate::Result;

pub const OSS_FUZZ_REPO_URL: &str = "https://github.com/google/oss-fuzz.git";

/// Walks a local OSS-Fuzz checkout
#[derive(Debug, Clone)]
pub struct ProjectCollector {
    repo_url: String,
    repo_dir: PathBuf,
}

impl ProjectCollector {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_url: OSS_FUZZ_REPO_URL.to_string(),
            repo_dir: repo_dir.into(),
        }
    }

    pub fn with_repo_url(mut self, url: impl Into<String>) -> Self {
        self.repo_url = url.into();
        self
    }

    /// Clone the repository unless the directory already exists.
    #[instrument(skip(self), fields(dir = %self.repo_dir.display()))]
    pub fn ensure_clone(&self) -> Result<()> {
        if self.repo_dir.exists() {
            info!("Repository already present, skipping clone");
            return Ok(());
        }
        if let Some(parent) = self.repo_dir.parent() {
            fs::create_dir_all(parent)?;
        }
        info!(url = %self.repo_url, "Cloning repository");
        let output = Command::new("git")
            .arg("clone")
            .arg(&self.repo_url)
            .arg(&self.repo_dir)
            .output()
            .map_err(|e| CollectError::Git(format!("failed to run git: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CollectError::Git(format!("git clone failed: {stderr}")));
        }
        Ok(())
    }

    /// Collect every project with a readable `project.yaml`, sorted by name.
    ///
    /// Projects without the file or with invalid YAML are logged and skipped.
    #[instrument(skip(self))]
    pub fn collect(&self) -> Result<Vec<RawProject>> {
        let projects_dir = self.repo_dir.join("projects");
        if !projects_dir.is_dir() {
            return Err(CollectError::MissingInput(projects_dir));
        }

        let mut names: Vec<String> = fs::read_dir(&projects_dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        info!(count = names.len(), "Found project directories");

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let yaml_path = projects_dir.join(&name).join("project.yaml");
            let text = match fs::read_to_string(&yaml_path) {
                Ok(text) => text,
                Err(_) => {
                    warn!(project = %name, "project.yaml not found, skipping");
                    continue;
                }
            };
            let first_commit_at = match first_commit_time(&self.repo_dir, &format!("projects/{name}")) {
                Ok(t) => t,
                Err(e) => {
                    warn!(project = %name, error = %e, "Could not read first commit time");
                    None
                }
            };
            match parse_project_yaml(&name, &text, first_commit_at) {
                Ok(project) => out.push(project),
                Err(e) => warn!(project = %name, error = %e, "Invalid project.yaml, skipping"),
            }
        }
        Ok(out)
    }

    /// Collect and write `projects.jsonl`; returns the number of projects.
    pub fn collect_to(&self, out_path: &Path) -> Result<usize> {
        self.ensure_clone()?;
        let projects = self.collect()?;
        write_jsonl(out_path, &projects)?;
        info!(count = projects.len(), path = %out_path.display(), "Wrote projects");
        Ok(projects.len())
    }
}

/// Convert a `project.yaml` document into a raw record.
pub fn parse_project_yaml(
    name: &str,
    text: &str,
    first_commit_at: Option<DateTime<Utc>>,
) -> Result<RawProject> {
    let doc: serde_yaml::Value = serde_yaml::from_str(text)?;
    let yaml = match doc {
        serde_yaml::Value::Null => serde_json::Value::Object(Default::default()),
        other => serde_json::to_value(other)?,
    };
    Ok(RawProject {
        name: name.to_string(),
        first_commit_at,
        yaml,
    })
}

/// Commit time of the oldest commit touching `rel_path`.
pub fn first_commit_time(repo_dir: &Path, rel_path: &str) -> Result<Option<DateTime<Utc>>> {
    let output = Command::new("git")
        .args(["log", "--reverse", "--format=%ct", "--", rel_path])
        .current_dir(repo_dir)
        .output()
        .map_err(|e| CollectError::Git(format!("failed to run git: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CollectError::Git(format!("git log failed: {stderr}")));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .next()
        .and_then(|line| line.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_git(dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_DATE", "2020-01-02T03:04:05Z")
            .env("GIT_COMMITTER_DATE", "2020-01-02T03:04:05Z")
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    #[test]
    fn yaml_is_kept_as_json() {
        let text = "language: c++\nmain_repo: https://github.com/madler/zlib\nsanitizers:\n  - address\n  - memory:\n      experimental: true\n";
        let p = parse_project_yaml("zlib", text, None).unwrap();
        assert_eq!(p.yaml["language"], "c++");
        assert_eq!(p.yaml["sanitizers"][0], "address");
        assert!(p.yaml["sanitizers"][1]["memory"].is_object());
    }

    #[test]
    fn empty_yaml_is_an_empty_object() {
        let p = parse_project_yaml("x", "", None).unwrap();
        assert!(p.yaml.as_object().unwrap().is_empty());
        assert!(parse_project_yaml("x", "a: [", None).is_err());
    }

    #[test]
    fn collect_walks_local_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path();
        run_git(repo, &["init", "-q"]);
        run_git(repo, &["config", "user.email", "t@example.com"]);
        run_git(repo, &["config", "user.name", "t"]);
        fs::create_dir_all(repo.join("projects/zlib")).unwrap();
        fs::create_dir_all(repo.join("projects/no-yaml")).unwrap();
        fs::write(repo.join("projects/zlib/project.yaml"), "language: c\n").unwrap();
        fs::write(repo.join("projects/no-yaml/build.sh"), "true\n").unwrap();
        run_git(repo, &["add", "."]);
        run_git(repo, &["commit", "-q", "-m", "init"]);

        let projects = ProjectCollector::new(repo).collect().unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "zlib");
        let first = projects[0].first_commit_at.unwrap();
        assert_eq!(first.to_rfc3339(), "2020-01-02T03:04:05+00:00");
    }
}
