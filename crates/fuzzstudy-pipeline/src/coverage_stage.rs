//! Coverage extraction: one sample per coverage build
//!
//! Each coverage build without a sample gets the daily report of its
//! project for the build's creation date. Absent or unreadable reports and
//! unsupported languages are stored as samples without a measurement.
//! Transport failures leave the build without a sample so a later run
//! retries it.

use std::collections::HashMap;
use std::time::Duration;

use fuzzstudy_collect::{CoverageReportFetcher, LanguageFamily};
use fuzzstudy_store::{BuildRecord, CoverageSample, InputDigest, StudyStore};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::Result;

pub const DEFAULT_REQUEST_DELAY: Duration = Duration::from_millis(500);

/// Counters of one extraction run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoverageStats {
    /// Coverage builds that had no sample
    pub pending: usize,
    pub measured: usize,
    /// Report absent, unreadable or language unsupported
    pub missing: usize,
    /// Report read but its numbers were out of range
    pub rejected: usize,
    /// Fetch failed; no sample written
    pub failed: usize,
}

impl CoverageStats {
    pub fn written(&self) -> usize {
        self.measured + self.missing + self.rejected
    }
}

pub struct CoverageExtractor<'a> {
    fetcher: CoverageReportFetcher<'a>,
    delay: Duration,
    limit: Option<usize>,
}

impl<'a> CoverageExtractor<'a> {
    pub fn new(fetcher: CoverageReportFetcher<'a>) -> Self {
        Self {
            fetcher,
            delay: DEFAULT_REQUEST_DELAY,
            limit: None,
        }
    }

    /// Pause between report requests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Process at most `limit` builds per run.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Digest over the ids of the builds still waiting for a sample.
    pub async fn pending_digest(&self, store: &dyn StudyStore) -> Result<InputDigest> {
        let ids: Vec<String> = store
            .builds_missing_coverage()
            .await?
            .into_iter()
            .map(|b| b.build_id)
            .collect();
        Ok(InputDigest::from_bytes(ids.join("\n").as_bytes()))
    }

    #[instrument(skip_all)]
    pub async fn run(&self, store: &dyn StudyStore) -> Result<CoverageStats> {
        let mut pending = store.builds_missing_coverage().await?;
        if let Some(limit) = self.limit {
            pending.truncate(limit);
        }
        let languages: HashMap<String, Option<String>> = store
            .list_projects()
            .await?
            .into_iter()
            .map(|p| (p.name, p.language))
            .collect();

        let mut stats = CoverageStats {
            pending: pending.len(),
            ..Default::default()
        };
        info!(pending = stats.pending, "Extracting coverage");

        let mut first_request = true;
        for build in &pending {
            let language = languages.get(&build.project).cloned().flatten();
            if LanguageFamily::from_language(language.as_deref()) != LanguageFamily::Unsupported {
                if !first_request && !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                first_request = false;
            }

            let Some(sample) = self.sample_for(build, language.as_deref(), &mut stats).await
            else {
                continue;
            };
            store.insert_coverage(&sample).await?;
        }

        info!(
            measured = stats.measured,
            missing = stats.missing,
            rejected = stats.rejected,
            failed = stats.failed,
            "Coverage extraction complete"
        );
        Ok(stats)
    }

    async fn sample_for(
        &self,
        build: &BuildRecord,
        language: Option<&str>,
        stats: &mut CoverageStats,
    ) -> Option<CoverageSample> {
        let date = build.created_at.date_naive();
        let missing = || CoverageSample::missing(&build.build_id, &build.project, date);

        let counts = match self.fetcher.fetch(&build.project, language, date).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(build_id = %build.build_id, project = %build.project, error = %e, "Coverage fetch failed");
                stats.failed += 1;
                return None;
            }
        };

        let Some(counts) = counts else {
            debug!(build_id = %build.build_id, "No coverage data");
            stats.missing += 1;
            return Some(missing());
        };

        match CoverageSample::measured(
            &build.build_id,
            &build.project,
            date,
            counts.covered,
            counts.total,
        ) {
            Ok(sample) => {
                stats.measured += 1;
                Some(sample)
            }
            Err(e) => {
                warn!(build_id = %build.build_id, error = %e, "Rejecting coverage value");
                stats.rejected += 1;
                Some(missing())
            }
        }
    }
}
