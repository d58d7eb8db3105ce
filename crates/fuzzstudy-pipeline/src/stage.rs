//! Pipeline stage definitions.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use fuzzstudy_store::InputDigest;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Stages that write to the store, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Raw JSONL -> projects, builds, detection events
    Transform,

    /// Coverage builds -> coverage samples
    Coverage,
}

impl PipelineStage {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::Transform => "transform",
            PipelineStage::Coverage => "coverage",
        }
    }

    pub fn all() -> Vec<PipelineStage> {
        vec![PipelineStage::Transform, PipelineStage::Coverage]
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PipelineStage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "transform" => Ok(PipelineStage::Transform),
            "coverage" => Ok(PipelineStage::Coverage),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

/// Counters a stage reports for its ledger row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutcome {
    pub records_read: i64,
    pub records_written: i64,
    pub records_skipped: i64,
    pub input_digest: Option<InputDigest>,
}

/// Digest over the contents of the given files, keyed by file name.
///
/// Missing files contribute their name and no content.
pub fn digest_files(paths: &[PathBuf]) -> Result<InputDigest> {
    let mut parts = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let data = if path.exists() {
            fs::read(path)?
        } else {
            Vec::new()
        };
        parts.push((name, data));
    }
    Ok(InputDigest::from_parts(
        parts.iter().map(|(n, d)| (n.as_str(), d.as_slice())),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_roundtrip() {
        for stage in PipelineStage::all() {
            assert_eq!(stage.name().parse::<PipelineStage>().unwrap(), stage);
        }
        assert!("load".parse::<PipelineStage>().is_err());
    }

    #[test]
    fn digest_tracks_file_content() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("projects.jsonl");
        let b = dir.path().join("issues.jsonl");
        fs::write(&a, "{}\n").unwrap();

        let first = digest_files(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(first, digest_files(&[a.clone(), b.clone()]).unwrap());

        fs::write(&b, "{}\n").unwrap();
        assert_ne!(first, digest_files(&[a, b]).unwrap());
    }
}
