use std::path::PathBuf;

use fuzzstudy_store::StoreError;
use thiserror::Error;

/// Errors raised by research-question runners
#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("query failed: {0}")]
    Store(#[from] StoreError),

    #[error("failed to serialize artifact: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to write {}: {source}", path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
