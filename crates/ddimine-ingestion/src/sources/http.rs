//! Rate-limited, retrying GET helper shared by the extractors.

use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, warn};

use ddimine_common::error::{is_retryable_status, DdiError, Result};
use ddimine_common::evidence::EvidenceSource;
use ddimine_common::mining_config::MiningConfig;
use ddimine_common::sandbox::SandboxClient;

use crate::rate_limit::SourceRateLimiter;

const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Exponential backoff for transient transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &MiningConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    pub fn none() -> Self {
        Self { max_retries: 0, base_delay: Duration::ZERO }
    }

    /// Delay before retry number `attempt` (0-based): base * 2^attempt, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Per-extractor HTTP access: sandboxed client, rate limiter, retry policy.
#[derive(Debug, Clone)]
pub struct SourceHttp {
    origin: EvidenceSource,
    client: SandboxClient,
    limiter: SourceRateLimiter,
    retry: RetryPolicy,
}

impl SourceHttp {
    pub fn new(origin: EvidenceSource, config: &MiningConfig, limiter: SourceRateLimiter) -> Result<Self> {
        Ok(Self {
            origin,
            client: SandboxClient::new(config.extractor_timeout())?,
            limiter,
            retry: RetryPolicy::from_config(config),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// GET returning parsed JSON, or `None` on 404.
    pub async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Option<serde_json::Value>> {
        let Some(resp) = self.send(url, query).await? else {
            return Ok(None);
        };
        let value = resp
            .json::<serde_json::Value>()
            .await
            .map_err(|e| DdiError::parse(self.origin, format!("invalid JSON from {url}: {e}")))?;
        Ok(Some(value))
    }

    /// GET returning the body text, or `None` on 404.
    pub async fn get_text(&self, url: &str, query: &[(&str, String)]) -> Result<Option<String>> {
        let Some(resp) = self.send(url, query).await? else {
            return Ok(None);
        };
        let text = resp
            .text()
            .await
            .map_err(|e| DdiError::transport(self.origin, e))?;
        Ok(Some(text))
    }

    async fn send(&self, url: &str, query: &[(&str, String)]) -> Result<Option<reqwest::Response>> {
        let mut attempt = 0u32;
        loop {
            self.limiter.until_ready().await;

            let err = match self.client.get(url)?.query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::NOT_FOUND {
                        debug!(source = %self.origin, url, "404, treating as empty result");
                        return Ok(None);
                    }
                    if status.is_success() {
                        return Ok(Some(resp));
                    }
                    let code = status.as_u16();
                    DdiError::Transport {
                        origin: self.origin,
                        message: format!("HTTP {code} from {url}"),
                        status: Some(code),
                        retryable: is_retryable_status(code),
                    }
                }
                Err(e) => DdiError::transport(self.origin, e),
            };

            if !err.is_retryable() || attempt >= self.retry.max_retries {
                return Err(err);
            }
            let delay = self.retry.delay_for(attempt);
            warn!(source = %self.origin, attempt, ?delay, error = %err, "transient failure, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
