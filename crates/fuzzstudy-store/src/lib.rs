//! fuzzstudy-store: PostgreSQL persistence for the replication package
//!
//! This crate owns the canonical schema shared by every downstream analysis
//! and all I/O with the relational store.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: referential integrity, batch transactionality, deterministic reads.
//!
//! ## Key Components
//!
//! - `PgStore`: PostgreSQL connection pool implementing the storage traits
//! - `MemoryStore`: in-memory fake with the same contracts (tests, dry runs)
//! - `ProjectRecord` / `BuildRecord` / `CoverageSample` / `DetectionEvent`:
//!   the canonical entities
//! - `StageRunRecord`: append-only audit trail of pipeline stage invocations

mod error;
pub mod fakes;
mod handle;
pub mod migrations;
mod schema;
pub mod storage_traits;

pub use error::StoreError;
pub use handle::{DbConfig, PgStore};
pub use schema::{
    BuildRecord, BuildResult, BuildType, CoveragePercent, CoverageSample, DetectionEvent,
    InputDigest, ProjectRecord, RunId, StageRunRecord, FIXED_STATUSES,
};
pub use storage_traits::{
    BatchCounts, BatchWriter, BuildQuery, BuildStore, CanonicalBatch, CoverageStore,
    DetectionStore, DuplicatePolicy, ProjectStore, StageLedger, StoreResult, StudyStore,
};

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
