//! Sequential stage orchestration and stage-run recording.

use std::future::Future;
use std::time::Instant;

use chrono::Utc;
use fuzzstudy_store::{RunId, StageRunRecord, StudyStore};
use tracing::{error, info, instrument};

use crate::config::DataLayout;
use crate::coverage_stage::{CoverageExtractor, CoverageStats};
use crate::error::PipelineError;
use crate::obs::{emit_ledger_error, emit_stage_finished, emit_stage_started};
use crate::stage::{digest_files, PipelineStage, StageOutcome};
use crate::transform::{RawInputs, TransformReport, Transformer};
use crate::Result;

/// Result of a complete pipeline execution
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub run_id: RunId,

    /// Whether every requested stage succeeded
    pub success: bool,

    /// Ledger rows of the stages that ran, in order
    pub stages: Vec<StageRunRecord>,

    pub duration_ms: u64,
}

impl PipelineResult {
    pub fn failed_stage(&self) -> Option<&StageRunRecord> {
        self.stages.iter().find(|s| !s.success)
    }
}

/// Runs stages against one store, recording a ledger row per stage.
///
/// Every stage invoked through the same `Pipeline` shares its run id.
pub struct Pipeline<'a> {
    store: &'a dyn StudyStore,
    layout: DataLayout,
    transformer: Transformer,
    run_id: RunId,
}

impl<'a> Pipeline<'a> {
    pub fn new(store: &'a dyn StudyStore, layout: DataLayout, transformer: Transformer) -> Self {
        Self {
            store,
            layout,
            transformer,
            run_id: RunId::new(),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Read the raw files, normalise and write one batch.
    ///
    /// Unreadable raw input fails the stage before the store is touched.
    pub async fn run_transform(&self) -> Result<TransformReport> {
        self.transform_stage().await.0
    }

    /// Attach coverage samples to coverage builds that lack one.
    pub async fn run_coverage(&self, extractor: &CoverageExtractor<'_>) -> Result<CoverageStats> {
        self.coverage_stage(extractor).await.0
    }

    /// Run `stages` in order, stopping at the first failure.
    ///
    /// A failing stage is recorded in the ledger and reported through
    /// [`PipelineResult::success`] rather than as an error.
    #[instrument(name = "fuzzstudy.run", skip_all, fields(run_id = %self.run_id))]
    pub async fn run(
        &self,
        stages: &[PipelineStage],
        extractor: &CoverageExtractor<'_>,
    ) -> Result<PipelineResult> {
        let start = Instant::now();
        info!(stages = stages.len(), "Starting pipeline");

        let mut records = Vec::with_capacity(stages.len());
        let mut success = true;
        for stage in stages {
            let (outcome, record) = match stage {
                PipelineStage::Transform => {
                    let (r, rec) = self.transform_stage().await;
                    (r.map(|_| ()), rec)
                }
                PipelineStage::Coverage => {
                    let (r, rec) = self.coverage_stage(extractor).await;
                    (r.map(|_| ()), rec)
                }
            };
            records.push(record);
            if let Err(e) = outcome {
                error!(stage = %stage, error = %e, "Stage failed, stopping pipeline");
                success = false;
                break;
            }
        }

        Ok(PipelineResult {
            run_id: self.run_id.clone(),
            success,
            stages: records,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn transform_stage(&self) -> (Result<TransformReport>, StageRunRecord) {
        self.recorded(PipelineStage::Transform, async {
            let digest = digest_files(&self.layout.transform_inputs())?;
            let raw = RawInputs::load(&self.layout)?;
            let report = self.transformer.run(self.store, &raw).await?;
            let outcome = StageOutcome {
                records_read: report.stats.records_read() as i64,
                records_written: report.written.total() as i64,
                records_skipped: report.stats.records_skipped() as i64,
                input_digest: Some(digest),
            };
            Ok((report, outcome))
        })
        .await
    }

    async fn coverage_stage(
        &self,
        extractor: &CoverageExtractor<'_>,
    ) -> (Result<CoverageStats>, StageRunRecord) {
        self.recorded(PipelineStage::Coverage, async {
            let digest = extractor.pending_digest(self.store).await?;
            let stats = extractor.run(self.store).await?;
            let outcome = StageOutcome {
                records_read: stats.pending as i64,
                records_written: stats.written() as i64,
                records_skipped: stats.failed as i64,
                input_digest: Some(digest),
            };
            Ok((stats, outcome))
        })
        .await
    }

    /// Run one stage body and append its ledger row, success or not.
    ///
    /// A ledger write failure after a successful body fails the stage.
    async fn recorded<T, F>(&self, stage: PipelineStage, body: F) -> (Result<T>, StageRunRecord)
    where
        F: Future<Output = Result<(T, StageOutcome)>>,
    {
        let started_at = Utc::now();
        emit_stage_started(&self.run_id.0, stage.name());

        let result = body.await;
        let finished_at = Utc::now();

        let (outcome, error) = match &result {
            Ok((_, outcome)) => (outcome.clone(), None),
            Err(e) => (StageOutcome::default(), Some(e.to_string())),
        };
        let record = StageRunRecord {
            run_id: self.run_id.clone(),
            stage: stage.name().to_string(),
            started_at,
            finished_at,
            records_read: outcome.records_read,
            records_written: outcome.records_written,
            records_skipped: outcome.records_skipped,
            input_digest: outcome.input_digest,
            success: error.is_none(),
            error,
        };
        emit_stage_finished(
            &self.run_id.0,
            stage.name(),
            record.duration_ms(),
            record.records_written,
            record.records_skipped,
            record.success,
        );

        let ledger = self.store.record_stage_run(&record).await;
        let result = match (result, ledger) {
            (Ok((value, _)), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(PipelineError::from(e)),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(ledger_err)) => {
                emit_ledger_error(&self.run_id.0, &ledger_err);
                Err(e)
            }
        };
        (result, record)
    }
}
