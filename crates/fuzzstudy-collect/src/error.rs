//! Error types for fuzzstudy-collect

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while collecting raw data
#[derive(Error, Debug)]
pub enum CollectError {
    /// Transport failure or retries exhausted
    #[error("HTTP error: {0}")]
    Http(String),

    /// Non-retryable HTTP status
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// git command failed
    #[error("git failed: {0}")]
    Git(String),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// A JSON Lines file holds a record that does not match its schema
    #[error("{}:{line}: {message}", path.display())]
    InvalidLine {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// Expected input directory or file is missing
    #[error("Input not found: {}", .0.display())]
    MissingInput(PathBuf),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for CollectError {
    fn from(err: reqwest::Error) -> Self {
        CollectError::Http(err.to_string())
    }
}
