//! fuzzstudy-research: the three research questions over the canonical store
//!
//! - `rq1`: detection rate per fuzzing iteration
//! - `rq2`: coverage trend per project and per session index
//! - `rq3`: coverage change at detection vs ordinary measurements
//! - `stats`: descriptive statistics, correlations and two-sample tests
//! - `report`: JSON and Markdown artifacts

mod error;
pub mod params;
pub mod report;
pub mod rq1;
pub mod rq2;
pub mod rq3;
pub mod stats;

pub use error::ResearchError;
pub use params::StudyParams;
pub use rq1::Rq1Report;
pub use rq2::Rq2Report;
pub use rq3::Rq3Report;

/// Result type for research runs
pub type Result<T> = std::result::Result<T, ResearchError>;
