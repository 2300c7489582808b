use crate::config::FetchOptions;
use crate::error::IngestError;
use crate::metrics::PipelineMetrics;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use url::Url;

/// Body and response metadata for one successfully fetched URL.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

/// Per-URL outcome. A failed URL never aborts the batch; callers inspect
/// `outcome` and keep going.
#[derive(Debug)]
pub struct FetchResult {
    pub url: String,
    pub outcome: Result<FetchedPayload, IngestError>,
}

/// Polite HTTP fetcher: allow-listed sources only, bounded in-flight
/// requests, retried transient failures, and per-host request spacing.
pub struct RateLimitedFetcher {
    client: reqwest::Client,
    options: FetchOptions,
    metrics: Arc<PipelineMetrics>,
    permits: Arc<Semaphore>,
    host_gate: Mutex<HashMap<String, Instant>>,
}

impl RateLimitedFetcher {
    pub fn new(options: FetchOptions, metrics: Arc<PipelineMetrics>) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(options.request_timeout_ms))
            .user_agent(concat!("corpus-qa/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| IngestError::InvalidArgument(format!("http client: {err}")))?;

        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(options.max_in_flight)),
            options,
            metrics,
            host_gate: Mutex::new(HashMap::new()),
        })
    }

    /// Fetches a set of URLs with bounded concurrency. The input is sorted
    /// and deduplicated first, so the result sequence is deterministic for a
    /// given set.
    pub async fn fetch(&self, urls: &[String]) -> Vec<FetchResult> {
        let mut unique: Vec<String> = urls.to_vec();
        unique.sort();
        unique.dedup();

        let tasks = unique.into_iter().map(|url| async move {
            FetchResult {
                outcome: self.fetch_one(&url).await,
                url,
            }
        });
        futures::future::join_all(tasks).await
    }

    async fn fetch_one(&self, raw_url: &str) -> Result<FetchedPayload, IngestError> {
        let url = Url::parse(raw_url).map_err(|err| IngestError::InvalidSource {
            url: raw_url.to_string(),
            reason: format!("malformed url: {err}"),
        })?;
        self.options
            .check_allowed(&url)
            .map_err(|reason| IngestError::InvalidSource {
                url: raw_url.to_string(),
                reason,
            })?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| IngestError::InvalidArgument("fetch gate closed".to_string()))?;

        let host = url.host_str().unwrap_or_default().to_string();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            PipelineMetrics::bump(&self.metrics.fetch_attempts);
            if attempt > 1 {
                PipelineMetrics::bump(&self.metrics.fetch_retries);
            }
            self.reserve_host_slot(&host).await;

            let started = Instant::now();
            let outcome = self.client.get(url.clone()).send().await;
            PipelineMetrics::add(
                &self.metrics.fetch_latency_ms,
                started.elapsed().as_millis() as u64,
            );

            let failure = match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let content_type = response
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|value| value.to_str().ok())
                            .map(|value| value.to_string());
                        match response.text().await {
                            Ok(body) => {
                                PipelineMetrics::bump(&self.metrics.fetch_successes);
                                return Ok(FetchedPayload {
                                    url: raw_url.to_string(),
                                    status: status.as_u16(),
                                    content_type,
                                    body,
                                    fetched_at: Utc::now(),
                                });
                            }
                            // Body reads hit the same transient faults as
                            // the request itself.
                            Err(err) => err.to_string(),
                        }
                    } else if retryable_status(status) {
                        format!("http status {status}")
                    } else {
                        PipelineMetrics::bump(&self.metrics.fetch_failures);
                        return Err(IngestError::InvalidSource {
                            url: raw_url.to_string(),
                            reason: format!("http status {status}"),
                        });
                    }
                }
                Err(err) if transient_error(&err) => err.to_string(),
                Err(err) => {
                    PipelineMetrics::bump(&self.metrics.fetch_failures);
                    return Err(IngestError::InvalidSource {
                        url: raw_url.to_string(),
                        reason: format!("unretryable http error: {err}"),
                    });
                }
            };

            if attempt >= self.options.max_attempts {
                PipelineMetrics::bump(&self.metrics.fetch_failures);
                return Err(IngestError::Transient {
                    url: raw_url.to_string(),
                    attempts: attempt,
                    last_error: failure,
                });
            }
            tracing::debug!(url = raw_url, attempt, error = %failure, "retrying fetch");
            self.backoff(attempt).await;
        }
    }

    /// Reserves the next send slot for `host`, keeping concurrent requests
    /// to one host at least `per_host_min_interval_ms` apart.
    async fn reserve_host_slot(&self, host: &str) {
        let interval = Duration::from_millis(self.options.per_host_min_interval_ms);
        if interval.is_zero() || host.is_empty() {
            return;
        }
        let wait = {
            let mut gate = self.host_gate.lock().await;
            let now = Instant::now();
            let start_at = gate
                .get(host)
                .copied()
                .map_or(now, |reserved| reserved.max(now));
            gate.insert(host.to_string(), start_at + interval);
            start_at.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    async fn backoff(&self, attempt: u32) {
        let exp = self
            .options
            .base_backoff_ms
            .saturating_mul(1u64 << (attempt - 1).min(16));
        let capped = exp.min(self.options.max_backoff_ms);
        let jitter = (capped as f64 * 0.5 * rand::random::<f64>()) as u64;
        tokio::time::sleep(Duration::from_millis(capped + jitter)).await;
    }
}

fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
