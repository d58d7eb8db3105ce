//! Structured lifecycle events for pipeline stages.
//!
//! Events are emitted at `info!` level with an `event` field so they can be
//! filtered out of JSON logs (`--json`).

use tracing::info;

/// Emit event: stage started.
pub fn emit_stage_started(run_id: &str, stage: &str) {
    info!(event = "stage.started", run_id = %run_id, stage = %stage);
}

/// Emit event: stage finished with its record counts.
pub fn emit_stage_finished(
    run_id: &str,
    stage: &str,
    duration_ms: i64,
    written: i64,
    skipped: i64,
    success: bool,
) {
    info!(
        event = "stage.finished",
        run_id = %run_id,
        stage = %stage,
        duration_ms = duration_ms,
        written = written,
        skipped = skipped,
        success = success,
    );
}

/// Emit event: a raw record was rejected during normalisation.
pub fn emit_record_skipped(stage: &str, key: &str, reason: &str) {
    tracing::debug!(event = "record.skipped", stage = %stage, key = %key, reason = %reason);
}

/// Emit event: the stage ledger could not be written (warning level).
pub fn emit_ledger_error(run_id: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "ledger.error", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitters_do_not_panic_without_subscriber() {
        emit_stage_started("test-run-id", "transform");
        emit_stage_finished("test-run-id", "transform", 12, 6, 0, true);
        emit_record_skipped("transform", "log-1", "unknown project");
    }
}
