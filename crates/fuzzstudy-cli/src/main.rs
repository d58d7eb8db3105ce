//! fuzzstudy - OSS-Fuzz fuzzing effectiveness replication package
//!
//! One subcommand per step of the study.
//!
//! ## Commands
//!
//! - `db init`: create (or reset) the PostgreSQL schema
//! - `collect`: fetch raw projects, build-log listings, log analyses, issues
//! - `transform`: load raw files into the canonical store
//! - `coverage`: attach coverage samples to coverage builds
//! - `pipeline`: transform and coverage with one ledger run id
//! - `rq1` / `rq2` / `rq3`: research questions, written as JSON + Markdown
//! - `history`: recent stage runs from the ledger

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use fuzzstudy_collect::raw::read_jsonl;
use fuzzstudy_collect::{
    BuildlogAnalyzer, BuildlogLister, CoverageReportFetcher, FetchClient, HttpConfig,
    IssueCollector, ListingConfig, ProjectCollector, RawBuildlogMeta,
};
use fuzzstudy_pipeline::config::DEFAULT_DATA_DIR;
use fuzzstudy_pipeline::{
    init_tracing, CoverageExtractor, DataLayout, Pipeline, PipelineStage, Transformer,
};
use fuzzstudy_research::report::{write_rq1, write_rq2, write_rq3};
use fuzzstudy_research::{rq1, rq2, rq3, StudyParams};
use fuzzstudy_store::{DuplicatePolicy, PgStore, StudyStore};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "fuzzstudy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "OSS-Fuzz fuzzing effectiveness study", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Root of the data directory
    #[arg(
        long,
        global = true,
        env = "FUZZSTUDY_DATA_DIR",
        default_value = DEFAULT_DATA_DIR
    )]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database administration
    Db {
        #[command(subcommand)]
        action: DbAction,
    },

    /// Collect raw data into the data directory
    Collect {
        #[command(subcommand)]
        source: CollectSource,

        /// Attempts per HTTP request
        #[arg(long, default_value = "5")]
        max_attempts: u32,
    },

    /// Normalise raw files and load them into the store
    Transform {
        /// How rows whose key already exists are treated
        #[arg(long, default_value = "keep-first")]
        policy: DuplicatePolicy,
    },

    /// Fetch coverage for coverage builds without a sample
    Coverage {
        #[command(flatten)]
        opts: CoverageOpts,
    },

    /// Run stages in order under one run id
    Pipeline {
        /// Stages to run (comma separated)
        #[arg(long, value_delimiter = ',', default_value = "transform,coverage")]
        stages: Vec<PipelineStage>,

        #[arg(long, default_value = "keep-first")]
        policy: DuplicatePolicy,

        #[command(flatten)]
        opts: CoverageOpts,
    },

    /// RQ1: detection rate per fuzzing iteration
    Rq1 {
        #[command(flatten)]
        study: StudyArgs,
    },

    /// RQ2: coverage trend
    Rq2 {
        #[command(flatten)]
        study: StudyArgs,
    },

    /// RQ3: coverage change at detection
    Rq3 {
        #[command(flatten)]
        study: StudyArgs,
    },

    /// Show recent stage runs
    History {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum DbAction {
    /// Create missing tables
    Init {
        /// Drop all tables first
        #[arg(long)]
        reset: bool,
    },
}

#[derive(Subcommand)]
enum CollectSource {
    /// project.yaml metadata from an OSS-Fuzz checkout
    Projects,

    /// Build-log listing from the GCS bucket
    Buildlogs {
        /// Pause between listing pages, in seconds
        #[arg(long, default_value = "5")]
        page_delay: u64,

        /// Stop after this many pages
        #[arg(long)]
        max_pages: Option<usize>,
    },

    /// Download and classify listed build logs
    AnalyzeBuildlogs {
        /// Analyse at most this many new logs
        #[arg(long)]
        limit: Option<usize>,

        /// Pause between downloads, in milliseconds
        #[arg(long, default_value = "0")]
        pause_ms: u64,
    },

    /// Daily coverage reports for coverage builds (same as `coverage`)
    CoverageReports {
        #[command(flatten)]
        opts: CoverageOpts,
    },

    /// Parse exported issue pages
    Issues {
        /// Directory of exported pages (default: <data-dir>/collect_data/issue_pages)
        #[arg(long)]
        input: Option<PathBuf>,
    },
}

#[derive(Args, Clone, Debug)]
struct CoverageOpts {
    /// Process at most this many builds
    #[arg(long)]
    limit: Option<usize>,

    /// Pause between report requests, in milliseconds
    #[arg(long, default_value = "500")]
    delay_ms: u64,

    /// Attempts per HTTP request
    #[arg(long, default_value = "5")]
    max_attempts: u32,
}

#[derive(Args, Clone, Debug)]
struct StudyArgs {
    /// Ignore data on or after this date (YYYY-MM-DD)
    #[arg(long)]
    cutoff: Option<NaiveDate>,

    /// Positive coverage samples a project needs to be eligible
    #[arg(long)]
    min_coverage_reports: Option<u64>,

    /// Drop iterations and sessions seen in fewer projects
    #[arg(long)]
    min_projects: Option<usize>,

    /// Maximum hours between the fuzzing and coverage build of a detection
    #[arg(long)]
    detection_window_hours: Option<i64>,

    /// Output directory (default: <data-dir>/result_data/<question>)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl StudyArgs {
    fn params(&self) -> StudyParams {
        let mut params = StudyParams::default();
        if let Some(cutoff) = self.cutoff {
            params = params.with_cutoff(cutoff);
        }
        if let Some(n) = self.min_coverage_reports {
            params = params.with_min_coverage_reports(n);
        }
        if let Some(n) = self.min_projects {
            params = params.with_min_projects(n);
        }
        if let Some(h) = self.detection_window_hours {
            params = params.with_detection_window_hours(h);
        }
        params
    }

    fn output_dir(&self, layout: &DataLayout, question: &str) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| layout.result_dir(question))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let layout = DataLayout::new(&cli.data_dir);

    match cli.command {
        Commands::Db { action } => match action {
            DbAction::Init { reset } => cmd_db_init(reset).await,
        },
        Commands::Collect {
            source,
            max_attempts,
        } => cmd_collect(&layout, source, max_attempts).await,
        Commands::Transform { policy } => {
            let store = connect().await?;
            cmd_transform(&store, &layout, policy).await
        }
        Commands::Coverage { opts } => {
            let store = connect().await?;
            cmd_coverage(&store, &layout, &opts).await
        }
        Commands::Pipeline {
            stages,
            policy,
            opts,
        } => {
            let store = connect().await?;
            cmd_pipeline(&store, &layout, &stages, policy, &opts).await
        }
        Commands::Rq1 { study } => {
            let store = connect().await?;
            cmd_rq1(&store, &study.params(), &study.output_dir(&layout, "rq1")).await
        }
        Commands::Rq2 { study } => {
            let store = connect().await?;
            cmd_rq2(&store, &study.params(), &study.output_dir(&layout, "rq2")).await
        }
        Commands::Rq3 { study } => {
            let store = connect().await?;
            cmd_rq3(&store, &study.params(), &study.output_dir(&layout, "rq3")).await
        }
        Commands::History { limit } => {
            let store = connect().await?;
            cmd_history(&store, limit).await
        }
    }
}

async fn connect() -> Result<PgStore> {
    PgStore::from_env()
        .await
        .context("Failed to connect to the study database (check POSTGRES_* variables)")
}

fn http_client(max_attempts: u32) -> Result<FetchClient> {
    FetchClient::new(HttpConfig::default().with_max_attempts(max_attempts))
        .context("Failed to build HTTP client")
}

/// Create the schema, optionally dropping existing tables first
async fn cmd_db_init(reset: bool) -> Result<()> {
    let store = connect().await?;
    if reset {
        store
            .reset_schema()
            .await
            .context("Failed to reset schema")?;
        println!("Schema reset");
    } else {
        store
            .init_schema()
            .await
            .context("Failed to create schema")?;
        println!("Schema ready");
    }
    Ok(())
}

async fn cmd_collect(layout: &DataLayout, source: CollectSource, max_attempts: u32) -> Result<()> {
    layout
        .ensure_dirs()
        .context("Failed to create data directories")?;

    match source {
        CollectSource::Projects => {
            let n = ProjectCollector::new(layout.oss_fuzz_repo())
                .collect_to(&layout.projects_file())
                .context("Project collection failed")?;
            println!("Collected {} projects -> {}", n, layout.projects_file().display());
        }
        CollectSource::Buildlogs {
            page_delay,
            max_pages,
        } => {
            let client = http_client(max_attempts)?;
            let config = ListingConfig {
                page_delay: Duration::from_secs(page_delay),
                max_pages,
                ..Default::default()
            };
            let out = layout.buildlog_metadata_file();
            let n = BuildlogLister::new(&client, config)
                .collect_to(&out)
                .await
                .context("Build-log listing failed")?;
            println!("Listed {} build logs -> {}", n, out.display());
        }
        CollectSource::AnalyzeBuildlogs { limit, pause_ms } => {
            let client = http_client(max_attempts)?;
            let metas: Vec<RawBuildlogMeta> = read_jsonl(&layout.buildlog_metadata_file())
                .context("Failed to read build-log listing (run `collect buildlogs` first)")?;
            let out = layout.buildlog_analysis_file();
            let n = BuildlogAnalyzer::new(&client)
                .with_pause(Duration::from_millis(pause_ms))
                .with_limit(limit)
                .run(&metas, &out)
                .await
                .context("Build-log analysis failed")?;
            println!("Analysed {} build logs -> {}", n, out.display());
        }
        CollectSource::Issues { input } => {
            let input = input.unwrap_or_else(|| layout.issue_pages_dir());
            let out = layout.issues_file();
            let n = IssueCollector::collect_to(&input, &out)
                .with_context(|| format!("Issue collection from {} failed", input.display()))?;
            println!("Collected {} new issues -> {}", n, out.display());
        }
        CollectSource::CoverageReports { opts } => {
            let store = connect().await?;
            cmd_coverage(&store, layout, &opts).await?;
        }
    }
    Ok(())
}

async fn cmd_transform(
    store: &dyn StudyStore,
    layout: &DataLayout,
    policy: DuplicatePolicy,
) -> Result<()> {
    let pipeline = Pipeline::new(store, layout.clone(), Transformer::new(policy));
    let report = pipeline
        .run_transform()
        .await
        .context("Transform failed")?;

    println!("Run:        {}", pipeline.run_id());
    println!("Projects:   {}", report.projects);
    println!("Builds:     {}", report.builds);
    println!("Detections: {}", report.detections);
    println!("Written:    {}", report.written.total());
    println!("Skipped:    {}", report.stats.records_skipped());
    Ok(())
}

async fn cmd_coverage(
    store: &dyn StudyStore,
    layout: &DataLayout,
    opts: &CoverageOpts,
) -> Result<()> {
    let client = http_client(opts.max_attempts)?;
    let extractor = CoverageExtractor::new(CoverageReportFetcher::new(&client))
        .with_delay(Duration::from_millis(opts.delay_ms))
        .with_limit(opts.limit);
    let pipeline = Pipeline::new(store, layout.clone(), Transformer::default());
    let stats = pipeline
        .run_coverage(&extractor)
        .await
        .context("Coverage extraction failed")?;

    println!("Run:      {}", pipeline.run_id());
    println!("Pending:  {}", stats.pending);
    println!("Measured: {}", stats.measured);
    println!("Missing:  {}", stats.missing);
    println!("Rejected: {}", stats.rejected);
    println!("Failed:   {}", stats.failed);
    Ok(())
}

async fn cmd_pipeline(
    store: &dyn StudyStore,
    layout: &DataLayout,
    stages: &[PipelineStage],
    policy: DuplicatePolicy,
    opts: &CoverageOpts,
) -> Result<()> {
    let client = http_client(opts.max_attempts)?;
    let extractor = CoverageExtractor::new(CoverageReportFetcher::new(&client))
        .with_delay(Duration::from_millis(opts.delay_ms))
        .with_limit(opts.limit);
    let pipeline = Pipeline::new(store, layout.clone(), Transformer::new(policy));
    let result = pipeline
        .run(stages, &extractor)
        .await
        .context("Pipeline run failed")?;

    println!("Run: {} ({} ms)", result.run_id, result.duration_ms);
    for stage in &result.stages {
        println!(
            "  {:<10} {:<4} read={} written={} skipped={} {}ms",
            stage.stage,
            if stage.success { "ok" } else { "FAIL" },
            stage.records_read,
            stage.records_written,
            stage.records_skipped,
            stage.duration_ms()
        );
    }
    if let Some(failed) = result.failed_stage() {
        bail!(
            "stage '{}' failed: {}",
            failed.stage,
            failed.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_artifacts(paths: &[PathBuf]) {
    for p in paths {
        println!("Wrote {}", p.display());
    }
}

async fn cmd_rq1(store: &dyn StudyStore, params: &StudyParams, out: &Path) -> Result<()> {
    let report = rq1::run(store, params).await.context("RQ1 query failed")?;
    info!(iterations = report.iterations.len(), "RQ1 finished");
    if let Some(late) = &report.late_stage {
        println!(
            "Iterations {}+: min {:.4}%, max {:.4}%, p25 {:.4}%, p75 {:.4}%",
            late.from_iteration, late.min, late.max, late.p25, late.p75
        );
    }
    let paths = write_rq1(out, &report).context("Failed to write RQ1 artifacts")?;
    print_artifacts(&paths);
    Ok(())
}

async fn cmd_rq2(store: &dyn StudyStore, params: &StudyParams, out: &Path) -> Result<()> {
    let report = rq2::run(store, params).await.context("RQ2 query failed")?;
    println!(
        "{} projects, {} with a strong trend, {} sessions",
        report.projects.len(),
        report.strong_trends.len(),
        report.sessions.len()
    );
    let paths = write_rq2(out, &report).context("Failed to write RQ2 artifacts")?;
    print_artifacts(&paths);
    Ok(())
}

async fn cmd_rq3(store: &dyn StudyStore, params: &StudyParams, out: &Path) -> Result<()> {
    let report = rq3::run(store, params).await.context("RQ3 query failed")?;
    println!(
        "{} detected changes, {} non-detected changes",
        report.detected.len(),
        report.non_detected.len()
    );
    if let Some(mw) = report.comparison.mann_whitney {
        println!("Mann-Whitney U = {:.1}, p = {:.6}", mw.u, mw.p_value);
    }
    let paths = write_rq3(out, &report).context("Failed to write RQ3 artifacts")?;
    print_artifacts(&paths);
    Ok(())
}

async fn cmd_history(store: &dyn StudyStore, limit: usize) -> Result<()> {
    let runs = store
        .list_stage_runs(limit)
        .await
        .context("Failed to read stage history")?;

    if runs.is_empty() {
        println!("No stage runs recorded");
        return Ok(());
    }

    for run in runs {
        println!(
            "{}  {:<10} {}  {}",
            run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            run.stage,
            if run.success { "ok  " } else { "FAIL" },
            run.run_id
        );
        println!(
            "    read={} written={} skipped={} duration={}ms digest={}",
            run.records_read,
            run.records_written,
            run.records_skipped,
            run.duration_ms(),
            run.input_digest.as_ref().map(|d| d.short()).unwrap_or("-")
        );
        if let Some(err) = &run.error {
            println!("    error: {}", err);
        }
    }
    Ok(())
}
