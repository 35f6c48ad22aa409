//! C8: process-wide rate-limited HTTP sender to the downstream ingestion
//! API, with per-item partial success reporting.
//!
//! `OutputBatch` (C9) may interleave outputs from several tenants, but the
//! ingestion API is scoped `POST /v1/{tenant}/alert/entity_extraction`. The
//! uploader groups a batch by tenant before issuing requests and merges the
//! per-group results back into one `BulkIngestionResult`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::dispatcher::{Output, OutputBatch};
use crate::error::DispatchResult;
use crate::resilience::RateLimiter;

/// A terminal or exhausted failure for a single output, carried back to
/// the caller so it can be routed to the DLQ.
#[derive(Debug, Clone)]
pub struct UploadFailure {
    pub output: Output,
    pub error: String,
    /// `true` if retrying would never help (e.g. a permanent 4xx).
    pub permanent: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BulkIngestionResult {
    pub success_count: usize,
    pub failed: Vec<UploadFailure>,
}

impl BulkIngestionResult {
    fn merge(&mut self, other: BulkIngestionResult) {
        self.success_count += other.success_count;
        self.failed.extend(other.failed);
    }
}

/// `{status, error_code, detail, instance}` response body from the
/// ingestion API.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct IngestionResponseBody {
    pub status: Option<String>,
    pub error_code: Option<String>,
    pub detail: Option<String>,
    pub instance: Option<String>,
}

/// One HTTP error code the ingestion API is documented to return for
/// input that can never succeed on retry.
const PERMANENT_ERROR_CODE: &str = "invalid_alert_schema";

pub struct IngestionResponse {
    pub http_status: u16,
    pub body: IngestionResponseBody,
    pub retry_after: Option<Duration>,
}

/// The downstream ingestion API, injected so tests can substitute a fake
/// without standing up an HTTP server.
#[async_trait]
pub trait IngestionClient: Send + Sync {
    async fn post_alerts(&self, tenant: &str, alerts: &[Value]) -> DispatchResult<IngestionResponse>;
}

pub struct HttpIngestionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpIngestionClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, request_timeout: Duration) -> DispatchResult<Self> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl IngestionClient for HttpIngestionClient {
    async fn post_alerts(&self, tenant: &str, alerts: &[Value]) -> DispatchResult<IngestionResponse> {
        let url = format!("{}/v1/{tenant}/alert/entity_extraction", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("X-API-KEY", &self.api_key)
            .header("Tenant", tenant)
            .json(&serde_json::json!({ "alerts": alerts }))
            .send()
            .await?;

        let http_status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = response.json::<IngestionResponseBody>().await.unwrap_or_default();
        Ok(IngestionResponse {
            http_status,
            body,
            retry_after,
        })
    }
}

pub struct UploaderConfig {
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Singleton-flavored rate-limited uploader: one `RateLimiter` shared by
/// every caller, constructed once from configuration (default 10 req/s,
/// burst 20).
pub struct RateLimitedUploader {
    client: Arc<dyn IngestionClient>,
    limiter: Arc<RateLimiter>,
    config: UploaderConfig,
}

impl RateLimitedUploader {
    pub fn new(client: Arc<dyn IngestionClient>, rate_limit: u32, burst_limit: u32, config: UploaderConfig) -> Self {
        Self {
            client,
            limiter: Arc::new(RateLimiter::with_window((rate_limit + burst_limit).max(1), 1000)),
            config,
        }
    }

    /// Upload an entire batch, grouping by tenant and merging results.
    pub async fn upload(&self, batch: &OutputBatch) -> BulkIngestionResult {
        let mut by_tenant: std::collections::HashMap<&str, Vec<&Output>> = std::collections::HashMap::new();
        for item in &batch.items {
            by_tenant.entry(item.tenant.as_str()).or_default().push(item);
        }

        let mut result = BulkIngestionResult::default();
        for (tenant, items) in by_tenant {
            result.merge(self.upload_tenant_group(tenant, items).await);
        }
        result
    }

    async fn upload_tenant_group(&self, tenant: &str, items: Vec<&Output>) -> BulkIngestionResult {
        let alerts: Vec<Value> = items.iter().map(|o| o.alert.clone()).collect();

        let mut attempt = 0u32;
        loop {
            self.limiter.acquire().await;

            match self.client.post_alerts(tenant, &alerts).await {
                Ok(response) => match self.classify(&response) {
                    Outcome::Success => {
                        return BulkIngestionResult {
                            success_count: items.len(),
                            failed: Vec::new(),
                        };
                    }
                    Outcome::Permanent(reason) => {
                        warn!(tenant, reason = %reason, "upload rejected permanently");
                        return self.all_failed(items, reason, true);
                    }
                    Outcome::RetryAfter(delay) => {
                        if attempt >= self.config.max_retries {
                            return self.all_failed(items, "rate limited, retries exhausted".into(), false);
                        }
                        attempt += 1;
                        debug!(tenant, attempt, delay = ?delay, "upload rate limited, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    Outcome::RetryableServerError(reason) => {
                        if attempt >= self.config.max_retries {
                            return self.all_failed(items, reason, false);
                        }
                        attempt += 1;
                        debug!(tenant, attempt, "upload failed with 5xx, retrying");
                        tokio::time::sleep(self.config.retry_interval).await;
                    }
                    Outcome::Terminal(reason) => {
                        return self.all_failed(items, reason, false);
                    }
                },
                Err(e) => {
                    if attempt >= self.config.max_retries {
                        return self.all_failed(items, e.to_string(), false);
                    }
                    attempt += 1;
                    debug!(tenant, attempt, error = %e, "upload transport error, retrying");
                    tokio::time::sleep(self.config.retry_interval).await;
                }
            }
        }
    }

    fn classify(&self, response: &IngestionResponse) -> Outcome {
        match response.http_status {
            200 | 201 => Outcome::Success,
            400 if response.body.error_code.as_deref() == Some(PERMANENT_ERROR_CODE) => {
                Outcome::Permanent(response.body.detail.clone().unwrap_or_else(|| "permanent error".into()))
            }
            429 => Outcome::RetryAfter(response.retry_after.unwrap_or(self.config.retry_interval)),
            500..=599 => Outcome::RetryableServerError(
                response.body.detail.clone().unwrap_or_else(|| "server error".into()),
            ),
            other => Outcome::Terminal(format!("unexpected status {other}")),
        }
    }

    fn all_failed(&self, items: Vec<&Output>, reason: String, permanent: bool) -> BulkIngestionResult {
        BulkIngestionResult {
            success_count: 0,
            failed: items
                .into_iter()
                .map(|o| UploadFailure {
                    output: o.clone(),
                    error: reason.clone(),
                    permanent,
                })
                .collect(),
        }
    }
}

enum Outcome {
    Success,
    Permanent(String),
    RetryAfter(Duration),
    RetryableServerError(String),
    Terminal(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn output(tenant: &str, n: usize) -> Output {
        Output {
            tenant: tenant.to_string(),
            datafeed_id: "df-1".into(),
            job_id: format!("job-{n}"),
            alert: Value::Null,
        }
    }

    struct ScriptedClient {
        responses: std::sync::Mutex<Vec<IngestionResponse>>,
        calls: AtomicUsize,
    }

    fn response(status: u16, body: IngestionResponseBody) -> IngestionResponse {
        IngestionResponse {
            http_status: status,
            body,
            retry_after: None,
        }
    }

    #[async_trait]
    impl IngestionClient for ScriptedClient {
        async fn post_alerts(&self, _tenant: &str, _alerts: &[Value]) -> DispatchResult<IngestionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                panic!("no scripted response left");
            }
            Ok(responses.remove(0))
        }
    }

    #[tokio::test]
    async fn success_reports_full_success_count() {
        let client = Arc::new(ScriptedClient {
            responses: std::sync::Mutex::new(vec![response(200, IngestionResponseBody::default())]),
            calls: AtomicUsize::new(0),
        });
        let uploader = RateLimitedUploader::new(client, 10, 20, UploaderConfig::default());
        let batch = OutputBatch {
            items: vec![output("acme", 1), output("acme", 2)],
            first_enq_at: Instant::now(),
        };

        let result = uploader.upload(&batch).await;
        assert_eq!(result.success_count, 2);
        assert!(result.failed.is_empty());
    }

    #[tokio::test]
    async fn permanent_error_fails_without_retry() {
        let client = Arc::new(ScriptedClient {
            responses: std::sync::Mutex::new(vec![response(
                400,
                IngestionResponseBody {
                    error_code: Some(PERMANENT_ERROR_CODE.to_string()),
                    detail: Some("bad schema".to_string()),
                    ..Default::default()
                },
            )]),
            calls: AtomicUsize::new(0),
        });
        let uploader = RateLimitedUploader::new(client.clone(), 10, 20, UploaderConfig::default());
        let batch = OutputBatch {
            items: vec![output("acme", 1)],
            first_enq_at: Instant::now(),
        };

        let result = uploader.upload(&batch).await;
        assert_eq!(result.success_count, 0);
        assert_eq!(result.failed.len(), 1);
        assert!(result.failed[0].permanent);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_error_retries_then_exhausts() {
        let client = Arc::new(ScriptedClient {
            responses: std::sync::Mutex::new(vec![
                response(500, IngestionResponseBody::default()),
                response(500, IngestionResponseBody::default()),
                response(500, IngestionResponseBody::default()),
                response(500, IngestionResponseBody::default()),
            ]),
            calls: AtomicUsize::new(0),
        });
        let uploader = RateLimitedUploader::new(
            client.clone(),
            10,
            20,
            UploaderConfig {
                max_retries: 3,
                retry_interval: Duration::from_millis(1),
            },
        );
        let batch = OutputBatch {
            items: vec![output("acme", 1)],
            first_enq_at: Instant::now(),
        };

        let result = uploader.upload(&batch).await;
        assert_eq!(result.failed.len(), 1);
        assert!(!result.failed[0].permanent);
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn groups_batch_by_tenant_before_posting() {
        let client = Arc::new(ScriptedClient {
            responses: std::sync::Mutex::new(vec![
                response(200, IngestionResponseBody::default()),
                response(200, IngestionResponseBody::default()),
            ]),
            calls: AtomicUsize::new(0),
        });
        let uploader = RateLimitedUploader::new(client.clone(), 10, 20, UploaderConfig::default());
        let batch = OutputBatch {
            items: vec![output("acme", 1), output("globex", 1)],
            first_enq_at: Instant::now(),
        };

        let result = uploader.upload(&batch).await;
        assert_eq!(result.success_count, 2);
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    /// The ingestion API's response body has no per-record result list, so
    /// a tenant's own group is all-or-nothing; the only partial-success
    /// granularity this design can produce is across tenants within one
    /// batch, exercised here.
    struct PerTenantClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IngestionClient for PerTenantClient {
        async fn post_alerts(&self, tenant: &str, _alerts: &[Value]) -> DispatchResult<IngestionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if tenant == "acme" {
                Ok(response(200, IngestionResponseBody::default()))
            } else {
                Ok(response(
                    400,
                    IngestionResponseBody {
                        error_code: Some(PERMANENT_ERROR_CODE.to_string()),
                        detail: Some("bad schema".to_string()),
                        ..Default::default()
                    },
                ))
            }
        }
    }

    #[tokio::test]
    async fn one_tenant_group_can_succeed_while_another_fails_in_the_same_batch() {
        let client = Arc::new(PerTenantClient {
            calls: AtomicUsize::new(0),
        });
        let uploader = RateLimitedUploader::new(client.clone(), 10, 20, UploaderConfig::default());
        let batch = OutputBatch {
            items: vec![output("acme", 1), output("acme", 2), output("globex", 1)],
            first_enq_at: Instant::now(),
        };

        let result = uploader.upload(&batch).await;
        assert_eq!(result.success_count, 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].output.tenant, "globex");
        assert!(result.failed[0].permanent);
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }
}
