//! Build-log listing from the public GCS bucket
//!
//! Pages through the JSON API object listing, keeping only objects named
//! `log-<uuid>.txt`, and flushes to disk every few pages so a long listing
//! survives an interrupted session.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::http::FetchClient;
use crate::raw::{append_jsonl, RawBuildlogMeta};
use crate::Result;

pub const GCS_API_BASE: &str = "https://storage.googleapis.com/storage/v1/b";
pub const BUILDLOG_BUCKET: &str = "oss-fuzz-gcb-logs";

/// Length of `log-<uuid>.txt`
pub const LOG_NAME_LEN: usize = "log-6259f647-370a-40e2-916b-8f4aaf105697.txt".len();

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    #[serde(default)]
    items: Vec<RawBuildlogMeta>,
    next_page_token: Option<String>,
}

/// Paging settings for the listing
#[derive(Debug, Clone)]
pub struct ListingConfig {
    pub api_base: String,
    pub bucket: String,
    pub pages_per_flush: usize,
    pub page_delay: Duration,
    /// Stop after this many pages (default: no limit)
    pub max_pages: Option<usize>,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            api_base: GCS_API_BASE.to_string(),
            bucket: BUILDLOG_BUCKET.to_string(),
            pages_per_flush: 10,
            page_delay: Duration::from_secs(5),
            max_pages: None,
        }
    }
}

impl ListingConfig {
    fn objects_url(&self) -> String {
        format!("{}/{}/o", self.api_base.trim_end_matches('/'), self.bucket)
    }
}

pub struct BuildlogLister<'a> {
    client: &'a FetchClient,
    config: ListingConfig,
}

impl<'a> BuildlogLister<'a> {
    pub fn new(client: &'a FetchClient, config: ListingConfig) -> Self {
        Self { client, config }
    }

    /// List the bucket into `out_path`. Returns the number of records written.
    ///
    /// A request error ends paging; records already gathered are kept.
    #[instrument(skip(self), fields(bucket = %self.config.bucket))]
    pub async fn collect_to(&self, out_path: &Path) -> Result<usize> {
        let url = self.config.objects_url();
        let mut pending: Vec<RawBuildlogMeta> = Vec::new();
        let mut written = 0usize;
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            pages += 1;
            let query: Vec<(&str, &str)> = page_token
                .as_deref()
                .map(|t| vec![("pageToken", t)])
                .unwrap_or_default();

            let page = match self.client.get_json::<ListPage>(&url, &query).await {
                Ok(Some(page)) => page,
                Ok(None) => {
                    warn!(page = pages, "Listing endpoint returned 404, stopping");
                    break;
                }
                Err(e) => {
                    warn!(page = pages, error = %e, "Request error, stopping collection");
                    break;
                }
            };

            pending.extend(
                page.items
                    .into_iter()
                    .filter(|item| item.name.len() == LOG_NAME_LEN),
            );

            if pages % self.config.pages_per_flush.max(1) == 0 && !pending.is_empty() {
                append_jsonl(out_path, &pending)?;
                written += pending.len();
                info!(page = pages, flushed = pending.len(), total = written, "Flushed batch");
                pending.clear();
            }

            let reached_limit = self.config.max_pages.is_some_and(|max| pages >= max);
            match page.next_page_token {
                Some(token) if !reached_limit => {
                    page_token = Some(token);
                    tokio::time::sleep(self.config.page_delay).await;
                }
                _ => break,
            }
        }

        if !pending.is_empty() {
            append_jsonl(out_path, &pending)?;
            written += pending.len();
        }
        info!(pages, total = written, "Build log listing complete");
        Ok(written)
    }
}
