//! fuzzstudy-pipeline: the stages between raw collector output and the store
//!
//! - `transform`: raw JSONL -> canonical projects, builds and detection events
//! - `coverage_stage`: one coverage sample per coverage build
//! - `pipeline`: sequential execution with one ledger row per stage
//! - `telemetry` / `obs`: tracing setup and stage lifecycle events

pub mod config;
pub mod coverage_stage;
mod error;
pub mod obs;
pub mod pipeline;
pub mod stage;
pub mod telemetry;
pub mod transform;

pub use config::DataLayout;
pub use coverage_stage::{CoverageExtractor, CoverageStats};
pub use error::PipelineError;
pub use pipeline::{Pipeline, PipelineResult};
pub use stage::{PipelineStage, StageOutcome};
pub use telemetry::init_tracing;
pub use transform::{RawInputs, TransformReport, TransformStats, Transformer};

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
