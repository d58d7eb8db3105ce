//! PostgreSQL schema migrations and initialization
//!
//! Every statement is `IF NOT EXISTS`, so `init_schema` may run on each
//! startup. Tables are created parent-first so foreign keys resolve.

use sqlx::PgPool;
use tracing::{debug, info, instrument};

use crate::error::StoreError;
use crate::Result;

/// Create all fuzzstudy tables. Safe to call multiple times.
#[instrument(skip(pool))]
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    info!("Initializing fuzzstudy schema");

    init_projects_table(pool).await?;
    init_builds_table(pool).await?;
    init_coverage_samples_table(pool).await?;
    init_detection_events_table(pool).await?;
    init_stage_runs_table(pool).await?;

    info!("fuzzstudy schema initialization complete");
    Ok(())
}

/// Drop every fuzzstudy table, children first. Used for from-scratch reruns.
#[instrument(skip(pool))]
pub async fn drop_schema(pool: &PgPool) -> Result<()> {
    info!("Dropping fuzzstudy schema");
    run_ddl(
        pool,
        "drop",
        r#"
        DROP TABLE IF EXISTS stage_runs;
        DROP TABLE IF EXISTS detection_events;
        DROP TABLE IF EXISTS coverage_samples;
        DROP TABLE IF EXISTS builds;
        DROP TABLE IF EXISTS projects;
        "#,
    )
    .await
}

/// Initialize `projects`
///
/// Schema:
/// ```text
/// TABLE projects {
///   name:             TEXT (primary key)
///   language:         TEXT?
///   main_repo:        TEXT?
///   homepage:         TEXT?
///   first_commit_at:  TIMESTAMPTZ?
///   fuzzing_engines:  TEXT[]
///   sanitizers:       TEXT[]
///   architectures:    TEXT[]
///   metadata:         JSONB
/// }
/// ```
async fn init_projects_table(pool: &PgPool) -> Result<()> {
    debug!("Initializing projects table");
    run_ddl(
        pool,
        "projects",
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            name             TEXT PRIMARY KEY,
            language         TEXT,
            main_repo        TEXT,
            homepage         TEXT,
            first_commit_at  TIMESTAMPTZ,
            fuzzing_engines  TEXT[] NOT NULL DEFAULT '{}',
            sanitizers       TEXT[] NOT NULL DEFAULT '{}',
            architectures    TEXT[] NOT NULL DEFAULT '{}',
            metadata         JSONB NOT NULL DEFAULT 'null'::jsonb
        );
        "#,
    )
    .await
}

/// Initialize `builds`
///
/// Schema:
/// ```text
/// TABLE builds {
///   build_id:         TEXT (primary key)
///   project:          TEXT -> projects.name
///   build_type:       TEXT (Fuzzing | Coverage | Introspector | Error | Unknown)
///   result:           TEXT (Finish | Halfway | Error | Unknown)
///   created_at:       TIMESTAMPTZ (indexed with project)
///   duration_secs:    BIGINT?
///   detected_faults:  BIGINT
///   size_bytes:       BIGINT
///   modules:          TEXT[]
///   revisions:        TEXT[]
///   log_url:          TEXT?
/// }
/// ```
async fn init_builds_table(pool: &PgPool) -> Result<()> {
    debug!("Initializing builds table");
    run_ddl(
        pool,
        "builds",
        r#"
        CREATE TABLE IF NOT EXISTS builds (
            build_id         TEXT PRIMARY KEY,
            project          TEXT NOT NULL REFERENCES projects(name),
            build_type       TEXT NOT NULL CHECK (build_type IN
                                ('Fuzzing', 'Coverage', 'Introspector', 'Error', 'Unknown')),
            result           TEXT NOT NULL CHECK (result IN
                                ('Finish', 'Halfway', 'Error', 'Unknown')),
            created_at       TIMESTAMPTZ NOT NULL,
            duration_secs    BIGINT,
            detected_faults  BIGINT NOT NULL DEFAULT 0 CHECK (detected_faults >= 0),
            size_bytes       BIGINT NOT NULL DEFAULT 0,
            modules          TEXT[] NOT NULL DEFAULT '{}',
            revisions        TEXT[] NOT NULL DEFAULT '{}',
            log_url          TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_builds_project_created
            ON builds (project, created_at);
        CREATE INDEX IF NOT EXISTS idx_builds_type ON builds (build_type);
        "#,
    )
    .await
}

/// Initialize `coverage_samples`
///
/// Schema:
/// ```text
/// TABLE coverage_samples {
///   build_id:       TEXT (primary key) -> builds.build_id
///   project:        TEXT -> projects.name
///   report_date:    DATE
///   coverage:       DOUBLE PRECISION? in [0, 100]
///   covered_lines:  BIGINT?
///   total_lines:    BIGINT?
/// }
/// ```
///
/// Constraints:
/// - one sample per build
/// - `covered_lines <= total_lines`
async fn init_coverage_samples_table(pool: &PgPool) -> Result<()> {
    debug!("Initializing coverage_samples table");
    run_ddl(
        pool,
        "coverage_samples",
        r#"
        CREATE TABLE IF NOT EXISTS coverage_samples (
            build_id       TEXT PRIMARY KEY REFERENCES builds(build_id),
            project        TEXT NOT NULL REFERENCES projects(name),
            report_date    DATE NOT NULL,
            coverage       DOUBLE PRECISION CHECK (coverage >= 0 AND coverage <= 100),
            covered_lines  BIGINT CHECK (covered_lines >= 0),
            total_lines    BIGINT CHECK (total_lines >= 0),
            CHECK (covered_lines IS NULL OR total_lines IS NULL OR covered_lines <= total_lines)
        );
        CREATE INDEX IF NOT EXISTS idx_coverage_project_date
            ON coverage_samples (project, report_date);
        "#,
    )
    .await
}

/// Initialize `detection_events`
///
/// Schema:
/// ```text
/// TABLE detection_events {
///   issue_number:  BIGINT (primary key)
///   build_id:      TEXT -> builds.build_id
///   project:       TEXT -> projects.name
///   reported_at:   TIMESTAMPTZ
///   offset_secs:   BIGINT >= 0
///   status:        TEXT
///   crash_type:    TEXT?
///   severity:      TEXT?
/// }
/// ```
async fn init_detection_events_table(pool: &PgPool) -> Result<()> {
    debug!("Initializing detection_events table");
    run_ddl(
        pool,
        "detection_events",
        r#"
        CREATE TABLE IF NOT EXISTS detection_events (
            issue_number  BIGINT PRIMARY KEY,
            build_id      TEXT NOT NULL REFERENCES builds(build_id),
            project       TEXT NOT NULL REFERENCES projects(name),
            reported_at   TIMESTAMPTZ NOT NULL,
            offset_secs   BIGINT NOT NULL CHECK (offset_secs >= 0),
            status        TEXT NOT NULL,
            crash_type    TEXT,
            severity      TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_detections_project_reported
            ON detection_events (project, reported_at);
        "#,
    )
    .await
}

/// Initialize `stage_runs`
///
/// Append-only; the application never issues UPDATE against it.
async fn init_stage_runs_table(pool: &PgPool) -> Result<()> {
    debug!("Initializing stage_runs table");
    run_ddl(
        pool,
        "stage_runs",
        r#"
        CREATE TABLE IF NOT EXISTS stage_runs (
            id               BIGSERIAL PRIMARY KEY,
            run_id           TEXT NOT NULL,
            stage            TEXT NOT NULL,
            started_at       TIMESTAMPTZ NOT NULL,
            finished_at      TIMESTAMPTZ NOT NULL,
            records_read     BIGINT NOT NULL DEFAULT 0,
            records_written  BIGINT NOT NULL DEFAULT 0,
            records_skipped  BIGINT NOT NULL DEFAULT 0,
            input_digest     TEXT,
            success          BOOLEAN NOT NULL,
            error            TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_stage_runs_started ON stage_runs (started_at DESC);
        "#,
    )
    .await
}

async fn run_ddl(pool: &PgPool, table: &str, sql: &str) -> Result<()> {
    sqlx::raw_sql(sql)
        .execute(pool)
        .await
        .map_err(|e| StoreError::SchemaSetup(format!("{table}: {e}")))?;
    Ok(())
}
