//! Shared HTTP client with retry and exponential backoff
//!
//! 5xx responses and transport errors are retried; a 404 means the
//! resource is absent and yields `Ok(None)`.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::CollectError;
use crate::Result;

/// HTTP client settings
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Total attempts per request, including the first (default: 5)
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterwards (default: 1 s)
    pub backoff_base: Duration,
    /// Per-request timeout (default: 30 s)
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            user_agent: concat!("fuzzstudy/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpConfig {
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delay slept after the given failed attempt (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Retrying GET client shared by every collector
#[derive(Debug, Clone)]
pub struct FetchClient {
    client: reqwest::Client,
    config: HttpConfig,
}

impl FetchClient {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// GET `url` and return the body, or `None` on 404.
    pub async fn get_text(&self, url: &str) -> Result<Option<String>> {
        match self.send(url, &[]).await? {
            Some(resp) => Ok(Some(resp.text().await?)),
            None => Ok(None),
        }
    }

    /// GET `url` with query parameters and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>> {
        match self.send(url, query).await? {
            Some(resp) => Ok(Some(resp.json::<T>().await?)),
            None => Ok(None),
        }
    }

    async fn send(&self, url: &str, query: &[(&str, &str)]) -> Result<Option<reqwest::Response>> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.client.get(url).query(query).send().await {
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                    debug!(url, "Resource absent (404)");
                    return Ok(None);
                }
                Ok(resp) if resp.status().is_success() => return Ok(Some(resp)),
                Ok(resp) if resp.status().is_server_error() => {
                    last_error = format!("HTTP {}", resp.status().as_u16());
                }
                Ok(resp) => {
                    return Err(CollectError::HttpStatus {
                        url: url.to_string(),
                        status: resp.status().as_u16(),
                    });
                }
                Err(e) => last_error = e.to_string(),
            }

            if attempt < attempts {
                let delay = self.config.backoff_delay(attempt);
                warn!(url, attempt, error = %last_error, ?delay, "Request failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }

        Err(CollectError::Http(format!(
            "{url}: giving up after {attempts} attempts: {last_error}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let cfg = HttpConfig::default().with_backoff_base(Duration::from_millis(100));
        assert_eq!(cfg.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn defaults_match_study_settings() {
        let cfg = HttpConfig::default();
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.backoff_base, Duration::from_secs(1));
        assert!(cfg.user_agent.starts_with("fuzzstudy/"));
        assert_eq!(HttpConfig::default().with_max_attempts(0).max_attempts, 1);
    }
}
