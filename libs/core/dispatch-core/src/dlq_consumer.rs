//! C10: drains the DLQ topic on its own consumer group, retries each
//! record on an exponential backoff schedule, and drops records that
//! exhaust `max_retries`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::broker::{Broker, BrokerRecord};
use crate::dispatcher::{Output, OutputBatch};
use crate::dlq::{DlqWriter, FailedRecord};
use crate::uploader::RateLimitedUploader;

pub struct DlqConsumerConfig {
    pub batch_size: usize,
    pub read_timeout: Duration,
    pub retry_base: Duration,
    pub max_retries: u32,
}

impl Default for DlqConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            read_timeout: Duration::from_secs(5),
            retry_base: Duration::from_secs(60),
            max_retries: 5,
        }
    }
}

pub struct DlqConsumer {
    broker: Arc<dyn Broker>,
    config: DlqConsumerConfig,
    uploader: Arc<RateLimitedUploader>,
    dlq: DlqWriter,
}

impl DlqConsumer {
    pub fn new(broker: Arc<dyn Broker>, config: DlqConsumerConfig, uploader: Arc<RateLimitedUploader>) -> Self {
        Self {
            dlq: DlqWriter::new(broker.clone()),
            broker,
            config,
            uploader,
        }
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = tokio::select! {
                result = self.broker.read_dlq_batch(self.config.batch_size, self.config.read_timeout) => result,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let records = match batch {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, "dlq read failed");
                    continue;
                }
            };

            for record in records {
                self.process_record(record).await;
            }
        }

        info!("dlq consumer stopped");
    }

    /// Decode, retry-or-drop, then ack unconditionally: a decode failure or
    /// a repeated upload failure is not itself grounds for the record to
    /// stay unacked and be redelivered by the broker's own PEL mechanics —
    /// this consumer owns retry scheduling via `requeued`/`push`, not the
    /// broker's redelivery.
    async fn process_record(&self, record: BrokerRecord) {
        let failed: FailedRecord = match decode_failed_record(&record.raw) {
            Ok(f) => f,
            Err(e) => {
                warn!(offset = %record.offset, error = %e, "undecodable dlq record, dropping");
                self.ack(&record.offset).await;
                return;
            }
        };

        if failed.retry_count >= self.config.max_retries {
            warn!(
                job_id = %failed.job_id,
                tenant = %failed.tenant,
                retry_count = failed.retry_count,
                "dlq record exhausted retries, dropping"
            );
            self.ack(&record.offset).await;
            return;
        }

        if Utc::now() < failed.ready_at(self.config.retry_base) {
            // Not due yet. Requeue unchanged (same retry_count) so it is
            // picked up again on a later pass once the backoff elapses.
            if let Err(e) = self.dlq.push(&failed).await {
                warn!(error = %e, "failed to requeue not-yet-due dlq record");
            }
            self.ack(&record.offset).await;
            return;
        }

        let batch = OutputBatch {
            items: vec![Output {
                tenant: failed.tenant.clone(),
                datafeed_id: failed.datafeed_id.clone(),
                job_id: failed.job_id.clone(),
                alert: failed.original_alert.clone(),
            }],
            first_enq_at: std::time::Instant::now(),
        };

        let result = self.uploader.upload(&batch).await;
        if result.success_count > 0 {
            info!(job_id = %failed.job_id, tenant = %failed.tenant, "dlq record recovered");
            self.ack(&record.offset).await;
            return;
        }

        let error = result
            .failed
            .into_iter()
            .next()
            .map(|f| f.error)
            .unwrap_or_else(|| "upload failed".to_string());
        let requeued = failed.requeued(error);
        if let Err(e) = self.dlq.push(&requeued).await {
            warn!(error = %e, "failed to requeue dlq record");
        }
        self.ack(&record.offset).await;
    }

    async fn ack(&self, offset: &str) {
        if let Err(e) = self.broker.ack_dlq(offset).await {
            warn!(offset, error = %e, "failed to ack dlq record");
        }
    }
}

/// `publish_dlq` writes a single `data` field containing the serialized
/// record; unwrap it the same way `broker_consumer::decode_alert` does.
fn decode_failed_record(raw: &Value) -> Result<FailedRecord, serde_json::Error> {
    if let Some(inner) = raw.get("data").and_then(Value::as_str) {
        return serde_json::from_str(inner);
    }
    serde_json::from_value(raw.clone())
}
