//! On-disk layout of the data directory

use std::fs;
use std::path::{Path, PathBuf};

use crate::Result;

pub const DEFAULT_DATA_DIR: &str = "data";

/// Paths of every intermediate file and artifact, rooted at one directory.
///
/// ```text
/// data/
///   raw/projects.jsonl
///   raw/buildlog_metadata.jsonl
///   raw/buildlog_analysis.jsonl
///   raw/issues.jsonl
///   collect_data/repos/oss-fuzz/
///   collect_data/issue_pages/*.json
///   result_data/rq1/ rq2/ rq3/
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl Default for DataLayout {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR)
    }
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn projects_file(&self) -> PathBuf {
        self.raw_dir().join("projects.jsonl")
    }

    pub fn buildlog_metadata_file(&self) -> PathBuf {
        self.raw_dir().join("buildlog_metadata.jsonl")
    }

    pub fn buildlog_analysis_file(&self) -> PathBuf {
        self.raw_dir().join("buildlog_analysis.jsonl")
    }

    pub fn issues_file(&self) -> PathBuf {
        self.raw_dir().join("issues.jsonl")
    }

    pub fn oss_fuzz_repo(&self) -> PathBuf {
        self.root.join("collect_data").join("repos").join("oss-fuzz")
    }

    /// Default input directory for exported issue pages.
    pub fn issue_pages_dir(&self) -> PathBuf {
        self.root.join("collect_data").join("issue_pages")
    }

    /// Artifact directory of one research question, e.g. `result_data/rq1`.
    pub fn result_dir(&self, question: &str) -> PathBuf {
        self.root.join("result_data").join(question)
    }

    /// Raw inputs of the transform stage, in digest order.
    pub fn transform_inputs(&self) -> [PathBuf; 3] {
        [
            self.projects_file(),
            self.buildlog_analysis_file(),
            self.issues_file(),
        ]
    }

    /// Create the raw and result directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.raw_dir())?;
        fs::create_dir_all(self.root.join("collect_data"))?;
        fs::create_dir_all(self.root.join("result_data"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_study_paths() {
        let layout = DataLayout::default();
        assert_eq!(layout.projects_file(), Path::new("data/raw/projects.jsonl"));
        assert_eq!(
            layout.oss_fuzz_repo(),
            Path::new("data/collect_data/repos/oss-fuzz")
        );
        assert_eq!(layout.result_dir("rq2"), Path::new("data/result_data/rq2"));
    }

    #[test]
    fn ensure_dirs_creates_tree() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path().join("data"));
        layout.ensure_dirs().unwrap();
        assert!(layout.raw_dir().is_dir());
        assert!(layout.root().join("result_data").is_dir());
    }
}
