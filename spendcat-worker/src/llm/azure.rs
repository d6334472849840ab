//! Azure OpenAI chat-completions client
//!
//! Descriptions are split into sub-batches of `batch_size`, sent with at most
//! `max_concurrent_batches` requests in flight, paced by a process-wide rate
//! limiter. Retryable failures (timeouts, 429, 5xx) back off exponentially,
//! honouring `Retry-After` when the service sends one. A sub-batch that still
//! fails yields placeholders; the call as a whole never errors.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::prompt;
use super::{LlmClassifier, LlmContext, LlmGuess, LlmTransportError};
use crate::config::LlmConfig;
use crate::error::{WorkerError, WorkerResult};

type DirectLimiter = governor::RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Longest `Retry-After` we are willing to sleep
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

pub struct AzureOpenAiClassifier {
    client: reqwest::Client,
    url: String,
    api_key: String,
    config: LlmConfig,
    rate_limiter: DirectLimiter,
}

impl std::fmt::Debug for AzureOpenAiClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureOpenAiClassifier")
            .field("url", &self.url)
            .field("batch_size", &self.config.batch_size)
            .finish()
    }
}

impl AzureOpenAiClassifier {
    /// Build from settings; fails when endpoint or key is missing
    pub fn new(config: &LlmConfig) -> WorkerResult<Self> {
        if !config.is_configured() {
            return Err(spendcat_common::Error::Config(
                "LLM endpoint or API key not configured".to_string(),
            )
            .into());
        }
        let endpoint = config.endpoint.as_deref().unwrap_or_default();
        let api_key = config.api_key.as_deref().unwrap_or_default().trim().to_string();

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| WorkerError::Other(anyhow::anyhow!("Failed to build HTTP client: {}", e)))?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = governor::RateLimiter::direct(governor::Quota::per_second(per_second));

        Ok(Self {
            client,
            url: completions_url(endpoint, &config.deployment, &config.api_version),
            api_key,
            config: config.clone(),
            rate_limiter,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One request, no retry
    async fn send_once(&self, items: &[String], context: &LlmContext) -> Result<Vec<LlmGuess>, LlmTransportError> {
        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .post(&self.url)
            .header("api-key", &self.api_key)
            .json(&prompt::request_body(items, context))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmTransportError::RateLimited {
                retry_after: retry_after(response.headers()),
            });
        }
        if !status.is_success() {
            let retry_hint = retry_after(response.headers());
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            if status.is_server_error() && retry_hint.is_some() {
                return Err(LlmTransportError::RateLimited { retry_after: retry_hint });
            }
            return Err(LlmTransportError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().await.map_err(transport_error)?;
        let content = prompt::extract_content(&body)?;
        Ok(prompt::parse_guesses(content, items, self.config.default_confidence))
    }

    /// One sub-batch with retries; placeholders on final failure
    async fn send_batch(&self, items: &[String], context: &LlmContext) -> Vec<LlmGuess> {
        let mut attempt = 0u32;
        loop {
            match self.send_once(items, context).await {
                Ok(guesses) => return guesses,
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = match &e {
                        LlmTransportError::RateLimited { retry_after: Some(d) } => (*d).min(MAX_RETRY_AFTER),
                        _ => retry_backoff(attempt),
                    };
                    warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "LLM request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(error = %e, items = items.len(), attempts = attempt + 1, "LLM request failed");
                    return prompt::placeholders(items, &format!("Erro na API: {}", e));
                }
            }
        }
    }
}

#[async_trait]
impl LlmClassifier for AzureOpenAiClassifier {
    async fn classify(&self, descriptions: &[String], context: &LlmContext) -> Vec<LlmGuess> {
        if descriptions.is_empty() {
            return Vec::new();
        }
        let batch_size = self.config.batch_size.max(1);
        let batches: Vec<&[String]> = descriptions.chunks(batch_size).collect();
        debug!(
            items = descriptions.len(),
            batches = batches.len(),
            sector = %context.sector,
            "Sending LLM batches"
        );

        let pending: Vec<_> = batches
            .into_iter()
            .enumerate()
            .map(|(idx, batch)| async move { (idx, self.send_batch(batch, context).await) })
            .collect();
        let mut answered: Vec<(usize, Vec<LlmGuess>)> = stream::iter(pending)
            .buffer_unordered(self.config.max_concurrent_batches.max(1))
            .collect()
            .await;
        answered.sort_by_key(|(idx, _)| *idx);

        answered.into_iter().flat_map(|(_, guesses)| guesses).collect()
    }
}

fn completions_url(endpoint: &str, deployment: &str, api_version: &str) -> String {
    format!(
        "{}/openai/deployments/{}/chat/completions?api-version={}",
        endpoint.trim().trim_end_matches('/'),
        deployment,
        api_version
    )
}

fn transport_error(err: reqwest::Error) -> LlmTransportError {
    if err.is_timeout() {
        LlmTransportError::Timeout
    } else if err.is_decode() {
        LlmTransportError::Malformed(err.to_string())
    } else {
        LlmTransportError::Network(err.to_string())
    }
}

/// `Retry-After` in seconds, when present and numeric
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// 500ms, 1s, 2s ... capped at 16s
fn retry_backoff(attempt: u32) -> Duration {
    let capped = attempt.min(5);
    Duration::from_millis(500 * (1 << capped))
}
