use fuzzstudy_collect::CollectError;
use fuzzstudy_store::StoreError;
use thiserror::Error;

/// Errors raised by pipeline stages
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("raw input error: {0}")]
    Collect(#[from] CollectError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },
}

impl PipelineError {
    /// Raw input that could not be read as canonical records.
    pub fn is_schema_incompatible(&self) -> bool {
        matches!(
            self,
            PipelineError::Collect(CollectError::InvalidLine { .. })
                | PipelineError::Collect(CollectError::MissingInput(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn invalid_lines_are_schema_incompatible() {
        let err: PipelineError = CollectError::InvalidLine {
            path: PathBuf::from("raw/projects.jsonl"),
            line: 3,
            message: "expected value".to_string(),
        }
        .into();
        assert!(err.is_schema_incompatible());
        assert!(err.to_string().contains("projects.jsonl"));

        let err: PipelineError = StoreError::Connection("refused".to_string()).into();
        assert!(!err.is_schema_incompatible());
    }
}
