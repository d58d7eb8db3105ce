//! PostgreSQL handle - connection and operations
//!
//! `PgStore` wraps a `sqlx` pool and implements every storage trait.
//! Batch writes run inside one transaction; reads use static SQL with
//! nullable parameters so the same statement serves filtered and unfiltered
//! listings.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, instrument};

use crate::error::StoreError;
use crate::migrations;
use crate::schema::{
    BuildRecord, CoveragePercent, CoverageSample, DetectionEvent, InputDigest, ProjectRecord,
    RunId, StageRunRecord,
};
use crate::storage_traits::{
    BatchCounts, BatchWriter, BuildQuery, BuildStore, CanonicalBatch, CoverageStore,
    DetectionStore, DuplicatePolicy, ProjectStore, StageLedger, StoreResult,
};
use crate::Result;

/// PostgreSQL connection settings
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Pool size (default: 5)
    pub max_connections: u32,
    /// Time allowed to acquire a connection (default: 10 s)
    pub connect_timeout: Duration,
}

impl DbConfig {
    pub fn new(
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: database.into(),
            user: user.into(),
            password: password.into(),
            max_connections: 5,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n.max(1);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - POSTGRES_DB (required)
    /// - POSTGRES_USER (required)
    /// - POSTGRES_PASSWORD (required)
    /// - POSTGRES_PORT (optional, default: 5432)
    /// - POSTGRES_IP (optional, default: "localhost")
    pub fn from_env() -> Result<Self> {
        let require = |key: &str| {
            std::env::var(key).map_err(|_| StoreError::Config(format!("{key} not set")))
        };
        let database = require("POSTGRES_DB")?;
        let user = require("POSTGRES_USER")?;
        let password = require("POSTGRES_PASSWORD")?;
        let host = std::env::var("POSTGRES_IP").unwrap_or_else(|_| "localhost".to_string());
        let port = match std::env::var("POSTGRES_PORT") {
            Ok(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| StoreError::Config(format!("POSTGRES_PORT is not a port: {raw}")))?,
            Err(_) => 5432,
        };

        Ok(Self::new(database, user, password)
            .with_host(host)
            .with_port(port))
    }

    fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
    }
}

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with the given settings. Connectivity failures are fatal.
    #[instrument(skip(config), fields(host = %config.host, db = %config.database))]
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        info!("Connecting to PostgreSQL");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect_with(config.connect_options())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Connect using `DbConfig::from_env`.
    pub async fn from_env() -> Result<Self> {
        let config = DbConfig::from_env()?;
        Self::connect(&config).await
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables if missing.
    pub async fn init_schema(&self) -> Result<()> {
        migrations::init_schema(&self.pool).await
    }

    /// Drop and recreate all tables.
    pub async fn reset_schema(&self) -> Result<()> {
        migrations::drop_schema(&self.pool).await?;
        migrations::init_schema(&self.pool).await
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, FromRow)]
struct ProjectRow {
    name: String,
    language: Option<String>,
    main_repo: Option<String>,
    homepage: Option<String>,
    first_commit_at: Option<DateTime<Utc>>,
    fuzzing_engines: Vec<String>,
    sanitizers: Vec<String>,
    architectures: Vec<String>,
    metadata: serde_json::Value,
}

impl From<ProjectRow> for ProjectRecord {
    fn from(row: ProjectRow) -> Self {
        ProjectRecord {
            name: row.name,
            language: row.language,
            main_repo: row.main_repo,
            homepage: row.homepage,
            first_commit_at: row.first_commit_at,
            fuzzing_engines: row.fuzzing_engines,
            sanitizers: row.sanitizers,
            architectures: row.architectures,
            metadata: row.metadata,
        }
    }
}

#[derive(Debug, FromRow)]
struct BuildRow {
    build_id: String,
    project: String,
    build_type: String,
    result: String,
    created_at: DateTime<Utc>,
    duration_secs: Option<i64>,
    detected_faults: i64,
    size_bytes: i64,
    modules: Vec<String>,
    revisions: Vec<String>,
    log_url: Option<String>,
}

impl TryFrom<BuildRow> for BuildRecord {
    type Error = StoreError;

    fn try_from(row: BuildRow) -> std::result::Result<Self, Self::Error> {
        Ok(BuildRecord {
            build_id: row.build_id,
            project: row.project,
            build_type: row.build_type.parse()?,
            result: row.result.parse()?,
            created_at: row.created_at,
            duration_secs: row.duration_secs,
            detected_faults: row.detected_faults,
            size_bytes: row.size_bytes,
            modules: row.modules,
            revisions: row.revisions,
            log_url: row.log_url,
        })
    }
}

#[derive(Debug, FromRow)]
struct CoverageRow {
    build_id: String,
    project: String,
    report_date: NaiveDate,
    coverage: Option<f64>,
    covered_lines: Option<i64>,
    total_lines: Option<i64>,
}

impl TryFrom<CoverageRow> for CoverageSample {
    type Error = StoreError;

    fn try_from(row: CoverageRow) -> std::result::Result<Self, Self::Error> {
        Ok(CoverageSample {
            build_id: row.build_id,
            project: row.project,
            report_date: row.report_date,
            coverage: row.coverage.map(CoveragePercent::try_from).transpose()?,
            covered_lines: row.covered_lines,
            total_lines: row.total_lines,
        })
    }
}

#[derive(Debug, FromRow)]
struct DetectionRow {
    issue_number: i64,
    build_id: String,
    project: String,
    reported_at: DateTime<Utc>,
    offset_secs: i64,
    status: String,
    crash_type: Option<String>,
    severity: Option<String>,
}

impl From<DetectionRow> for DetectionEvent {
    fn from(row: DetectionRow) -> Self {
        DetectionEvent {
            issue_number: row.issue_number,
            build_id: row.build_id,
            project: row.project,
            reported_at: row.reported_at,
            offset_secs: row.offset_secs,
            status: row.status,
            crash_type: row.crash_type,
            severity: row.severity,
        }
    }
}

#[derive(Debug, FromRow)]
struct StageRunRow {
    run_id: String,
    stage: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    records_read: i64,
    records_written: i64,
    records_skipped: i64,
    input_digest: Option<String>,
    success: bool,
    error: Option<String>,
}

impl TryFrom<StageRunRow> for StageRunRecord {
    type Error = StoreError;

    fn try_from(row: StageRunRow) -> std::result::Result<Self, Self::Error> {
        Ok(StageRunRecord {
            run_id: RunId(row.run_id),
            stage: row.stage,
            started_at: row.started_at,
            finished_at: row.finished_at,
            records_read: row.records_read,
            records_written: row.records_written,
            records_skipped: row.records_skipped,
            input_digest: row.input_digest.map(InputDigest::try_from).transpose()?,
            success: row.success,
            error: row.error,
        })
    }
}

// ---------------------------------------------------------------------------
// SQL
// ---------------------------------------------------------------------------

const PROJECT_COLUMNS: &str = "name, language, main_repo, homepage, first_commit_at, \
     fuzzing_engines, sanitizers, architectures, metadata";

const BUILD_COLUMNS: &str = "b.build_id, b.project, b.build_type, b.result, b.created_at, \
     b.duration_secs, b.detected_faults, b.size_bytes, b.modules, b.revisions, b.log_url";

const BUILD_FILTER: &str = "($1::text IS NULL OR b.project = $1) \
     AND (cardinality($2::text[]) = 0 OR b.build_type = ANY($2)) \
     AND (cardinality($3::text[]) = 0 OR b.result = ANY($3)) \
     AND ($4::timestamptz IS NULL OR b.created_at < $4) \
     AND ($5::timestamptz IS NULL OR b.created_at > $5)";

fn insert_project_sql(policy: DuplicatePolicy) -> String {
    let conflict = match policy {
        DuplicatePolicy::KeepFirst => "DO NOTHING",
        DuplicatePolicy::LastWriteWins => {
            "DO UPDATE SET language = EXCLUDED.language, main_repo = EXCLUDED.main_repo, \
             homepage = EXCLUDED.homepage, first_commit_at = EXCLUDED.first_commit_at, \
             fuzzing_engines = EXCLUDED.fuzzing_engines, sanitizers = EXCLUDED.sanitizers, \
             architectures = EXCLUDED.architectures, metadata = EXCLUDED.metadata"
        }
    };
    format!(
        "INSERT INTO projects ({PROJECT_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) ON CONFLICT (name) {conflict}"
    )
}

fn insert_build_sql(policy: DuplicatePolicy) -> String {
    let conflict = match policy {
        DuplicatePolicy::KeepFirst => "DO NOTHING",
        DuplicatePolicy::LastWriteWins => {
            "DO UPDATE SET project = EXCLUDED.project, build_type = EXCLUDED.build_type, \
             result = EXCLUDED.result, created_at = EXCLUDED.created_at, \
             duration_secs = EXCLUDED.duration_secs, \
             detected_faults = EXCLUDED.detected_faults, size_bytes = EXCLUDED.size_bytes, \
             modules = EXCLUDED.modules, revisions = EXCLUDED.revisions, \
             log_url = EXCLUDED.log_url"
        }
    };
    format!(
        "INSERT INTO builds (build_id, project, build_type, result, created_at, duration_secs, \
         detected_faults, size_bytes, modules, revisions, log_url) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         ON CONFLICT (build_id) {conflict}"
    )
}

fn insert_detection_sql(policy: DuplicatePolicy) -> String {
    let conflict = match policy {
        DuplicatePolicy::KeepFirst => "DO NOTHING",
        DuplicatePolicy::LastWriteWins => {
            "DO UPDATE SET build_id = EXCLUDED.build_id, project = EXCLUDED.project, \
             reported_at = EXCLUDED.reported_at, offset_secs = EXCLUDED.offset_secs, \
             status = EXCLUDED.status, crash_type = EXCLUDED.crash_type, \
             severity = EXCLUDED.severity"
        }
    };
    format!(
        "INSERT INTO detection_events (issue_number, build_id, project, reported_at, \
         offset_secs, status, crash_type, severity) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (issue_number) {conflict}"
    )
}

const REFRESH_FAULTS_SQL: &str = "\
    UPDATE builds b SET detected_faults = \
        (SELECT COUNT(*) FROM detection_events d WHERE d.build_id = b.build_id) \
    WHERE b.project = ANY($1)";

const REFRESH_DURATIONS_SQL: &str = "\
    UPDATE builds b SET duration_secs = n.secs \
    FROM (SELECT build_id, \
              EXTRACT(EPOCH FROM (LEAD(created_at) OVER ( \
                  PARTITION BY project, build_type ORDER BY created_at, build_id) \
              - created_at))::BIGINT AS secs \
          FROM builds WHERE project = ANY($1)) n \
    WHERE b.build_id = n.build_id AND b.duration_secs IS DISTINCT FROM n.secs";

// ---------------------------------------------------------------------------
// Trait implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl BatchWriter for PgStore {
    #[instrument(skip(self, batch), fields(rows = batch.len(), ?policy))]
    async fn write_batch(
        &self,
        batch: &CanonicalBatch,
        policy: DuplicatePolicy,
    ) -> StoreResult<BatchCounts> {
        let mut counts = BatchCounts::default();
        let mut tx = self.pool.begin().await?;

        let sql = insert_project_sql(policy);
        for p in &batch.projects {
            let done = sqlx::query(&sql)
                .bind(&p.name)
                .bind(&p.language)
                .bind(&p.main_repo)
                .bind(&p.homepage)
                .bind(p.first_commit_at)
                .bind(&p.fuzzing_engines)
                .bind(&p.sanitizers)
                .bind(&p.architectures)
                .bind(&p.metadata)
                .execute(&mut *tx)
                .await?;
            counts.projects += done.rows_affected();
        }

        let sql = insert_build_sql(policy);
        for b in &batch.builds {
            let done = sqlx::query(&sql)
                .bind(&b.build_id)
                .bind(&b.project)
                .bind(b.build_type.as_str())
                .bind(b.result.as_str())
                .bind(b.created_at)
                .bind(b.duration_secs)
                .bind(b.detected_faults)
                .bind(b.size_bytes)
                .bind(&b.modules)
                .bind(&b.revisions)
                .bind(&b.log_url)
                .execute(&mut *tx)
                .await
                .map_err(|e| reference_error(e, "build", &b.build_id, "project"))?;
            counts.builds += done.rows_affected();
        }

        let sql = insert_detection_sql(policy);
        for d in &batch.detections {
            let done = sqlx::query(&sql)
                .bind(d.issue_number)
                .bind(&d.build_id)
                .bind(&d.project)
                .bind(d.reported_at)
                .bind(d.offset_secs)
                .bind(&d.status)
                .bind(&d.crash_type)
                .bind(&d.severity)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    reference_error(e, "detection", &d.issue_number.to_string(), "build")
                })?;
            counts.detections += done.rows_affected();
        }

        let projects: Vec<String> = batch.touched_projects().into_iter().collect();
        if !projects.is_empty() {
            sqlx::query(REFRESH_FAULTS_SQL)
                .bind(&projects)
                .execute(&mut *tx)
                .await?;
            sqlx::query(REFRESH_DURATIONS_SQL)
                .bind(&projects)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(
            projects = counts.projects,
            builds = counts.builds,
            detections = counts.detections,
            "Batch committed"
        );
        Ok(counts)
    }
}

/// Rewrite a foreign-key failure so it names the offending row.
fn reference_error(err: sqlx::Error, entity: &str, key: &str, target: &str) -> StoreError {
    match StoreError::from(err) {
        StoreError::MissingReference { .. } => StoreError::MissingReference {
            entity: entity.to_string(),
            target: target.to_string(),
            key: key.to_string(),
        },
        other => other,
    }
}

#[async_trait]
impl ProjectStore for PgStore {
    async fn get_project(&self, name: &str) -> StoreResult<Option<ProjectRecord>> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE name = $1");
        let row = sqlx::query_as::<_, ProjectRow>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ProjectRecord::from))
    }

    async fn list_projects(&self) -> StoreResult<Vec<ProjectRecord>> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY name");
        let rows = sqlx::query_as::<_, ProjectRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ProjectRecord::from).collect())
    }
}

fn query_params(query: &BuildQuery) -> (Vec<String>, Vec<String>) {
    (
        query
            .build_types
            .iter()
            .map(|t| t.as_str().to_string())
            .collect(),
        query
            .results
            .iter()
            .map(|r| r.as_str().to_string())
            .collect(),
    )
}

#[async_trait]
impl BuildStore for PgStore {
    async fn get_build(&self, build_id: &str) -> StoreResult<Option<BuildRecord>> {
        let sql = format!("SELECT {BUILD_COLUMNS} FROM builds b WHERE b.build_id = $1");
        sqlx::query_as::<_, BuildRow>(&sql)
            .bind(build_id)
            .fetch_optional(&self.pool)
            .await?
            .map(BuildRecord::try_from)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn list_builds(&self, query: &BuildQuery) -> StoreResult<Vec<BuildRecord>> {
        let (types, results) = query_params(query);
        let sql = format!(
            "SELECT {BUILD_COLUMNS} FROM builds b WHERE {BUILD_FILTER} \
             ORDER BY b.created_at, b.build_id"
        );
        let rows = sqlx::query_as::<_, BuildRow>(&sql)
            .bind(&query.project)
            .bind(&types)
            .bind(&results)
            .bind(query.created_before)
            .bind(query.created_after)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(BuildRecord::try_from).collect()
    }

    async fn count_builds(&self, query: &BuildQuery) -> StoreResult<u64> {
        let (types, results) = query_params(query);
        let sql = format!("SELECT COUNT(*) FROM builds b WHERE {BUILD_FILTER}");
        let n: i64 = sqlx::query_scalar(&sql)
            .bind(&query.project)
            .bind(&types)
            .bind(&results)
            .bind(query.created_before)
            .bind(query.created_after)
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }
}

#[async_trait]
impl CoverageStore for PgStore {
    #[instrument(skip(self, sample), fields(build_id = %sample.build_id))]
    async fn insert_coverage(&self, sample: &CoverageSample) -> StoreResult<()> {
        sample.validate()?;
        sqlx::query(
            "INSERT INTO coverage_samples \
             (build_id, project, report_date, coverage, covered_lines, total_lines) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&sample.build_id)
        .bind(&sample.project)
        .bind(sample.report_date)
        .bind(sample.coverage.map(f64::from))
        .bind(sample.covered_lines)
        .bind(sample.total_lines)
        .execute(&self.pool)
        .await
        .map_err(|e| match reference_error(e, "coverage sample", &sample.build_id, "build") {
            StoreError::Duplicate { .. } => StoreError::Duplicate {
                entity: "coverage sample".to_string(),
                key: sample.build_id.clone(),
            },
            other => other,
        })?;
        Ok(())
    }

    async fn builds_missing_coverage(&self) -> StoreResult<Vec<BuildRecord>> {
        let sql = format!(
            "SELECT {BUILD_COLUMNS} FROM builds b \
             LEFT JOIN coverage_samples c ON c.build_id = b.build_id \
             WHERE b.build_type = 'Coverage' AND c.build_id IS NULL \
             ORDER BY b.created_at, b.build_id"
        );
        let rows = sqlx::query_as::<_, BuildRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(BuildRecord::try_from).collect()
    }

    async fn coverage_series(
        &self,
        project: &str,
        before: Option<NaiveDate>,
    ) -> StoreResult<Vec<CoverageSample>> {
        let rows = sqlx::query_as::<_, CoverageRow>(
            "SELECT build_id, project, report_date, coverage, covered_lines, total_lines \
             FROM coverage_samples \
             WHERE project = $1 AND ($2::date IS NULL OR report_date < $2) \
             ORDER BY report_date, build_id",
        )
        .bind(project)
        .bind(before)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CoverageSample::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn eligible_projects(
        &self,
        min_samples: u64,
        before: NaiveDate,
    ) -> StoreResult<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT project FROM coverage_samples \
             WHERE coverage > 0 AND report_date < $1 \
             GROUP BY project HAVING COUNT(*) >= $2 \
             ORDER BY project",
        )
        .bind(before)
        .bind(i64::try_from(min_samples).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        debug!(count = names.len(), "Eligible projects");
        Ok(names)
    }
}

#[async_trait]
impl DetectionStore for PgStore {
    async fn list_detections(&self, project: Option<&str>) -> StoreResult<Vec<DetectionEvent>> {
        let rows = sqlx::query_as::<_, DetectionRow>(
            "SELECT issue_number, build_id, project, reported_at, offset_secs, status, \
             crash_type, severity FROM detection_events \
             WHERE ($1::text IS NULL OR project = $1) \
             ORDER BY reported_at, issue_number",
        )
        .bind(project)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(DetectionEvent::from).collect())
    }
}

#[async_trait]
impl StageLedger for PgStore {
    async fn record_stage_run(&self, record: &StageRunRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO stage_runs (run_id, stage, started_at, finished_at, records_read, \
             records_written, records_skipped, input_digest, success, error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&record.run_id.0)
        .bind(&record.stage)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.records_read)
        .bind(record.records_written)
        .bind(record.records_skipped)
        .bind(record.input_digest.as_ref().map(|d| d.as_str().to_string()))
        .bind(record.success)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_stage_runs(&self, limit: usize) -> StoreResult<Vec<StageRunRecord>> {
        let rows = sqlx::query_as::<_, StageRunRow>(
            "SELECT run_id, stage, started_at, finished_at, records_read, records_written, \
             records_skipped, input_digest, success, error FROM stage_runs \
             ORDER BY started_at DESC, id DESC LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StageRunRecord::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_first_sql_does_nothing_on_conflict() {
        assert!(insert_build_sql(DuplicatePolicy::KeepFirst).ends_with("DO NOTHING"));
        assert!(insert_project_sql(DuplicatePolicy::LastWriteWins).contains("DO UPDATE"));
        assert!(insert_detection_sql(DuplicatePolicy::LastWriteWins)
            .contains("ON CONFLICT (issue_number)"));
    }

    #[test]
    fn db_config_builder() {
        let cfg = DbConfig::new("study", "postgres", "secret")
            .with_host("10.0.0.2")
            .with_port(5433)
            .with_max_connections(0);
        assert_eq!(cfg.host, "10.0.0.2");
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.max_connections, 1);
    }
}
