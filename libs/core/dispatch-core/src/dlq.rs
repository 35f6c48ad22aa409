//! `FailedRecord` and the quarantine store that C7 writes to and C10
//! reads from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::broker::Broker;
use crate::error::DispatchResult;

/// Immutable except for `retry_count` and `failed_at`, which advance on
/// every re-queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRecord {
    pub original_alert: Value,
    pub tenant: String,
    pub error: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
    pub job_id: String,
    pub datafeed_id: String,
}

impl FailedRecord {
    pub fn new(
        original_alert: Value,
        tenant: impl Into<String>,
        error: impl Into<String>,
        job_id: impl Into<String>,
        datafeed_id: impl Into<String>,
    ) -> Self {
        Self {
            original_alert,
            tenant: tenant.into(),
            error: error.into(),
            retry_count: 0,
            failed_at: Utc::now(),
            job_id: job_id.into(),
            datafeed_id: datafeed_id.into(),
        }
    }

    pub fn requeued(mut self, error: impl Into<String>) -> Self {
        self.retry_count += 1;
        self.failed_at = Utc::now();
        self.error = error.into();
        self
    }

    /// `backoff(n) = retry_base * 2^n`.
    pub fn backoff(&self, retry_base: std::time::Duration) -> std::time::Duration {
        let factor = 1u64 << self.retry_count.min(20);
        retry_base.saturating_mul(factor as u32)
    }

    pub fn ready_at(&self, retry_base: std::time::Duration) -> DateTime<Utc> {
        self.failed_at + chrono::Duration::from_std(self.backoff(retry_base)).unwrap_or_default()
    }
}

/// Writes quarantined records onto the broker's DLQ topic.
pub struct DlqWriter {
    broker: Arc<dyn Broker>,
}

impl DlqWriter {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    pub async fn push(&self, record: &FailedRecord) -> DispatchResult<()> {
        let payload = serde_json::to_value(record)?;
        self.broker.publish_dlq(&payload).await
    }
}
