//! C7: batch-reads the broker's input topic, decodes records into
//! `Alert`s, forwards them to the uploader, and commits offsets only
//! after the batch has been acknowledged downstream (by upload success or
//! by a DLQ write — DLQ counts as acknowledgment, P5/P6 scenario 6).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::alert::Alert;
use crate::broker::{Broker, BrokerRecord};
use crate::dispatcher::Output;
use crate::dlq::{DlqWriter, FailedRecord};
use crate::error::DispatchResult;
use crate::uploader::RateLimitedUploader;

pub struct BrokerConsumerConfig {
    pub batch_size: usize,
    pub read_timeout: Duration,
    pub max_commit_retries: u32,
    pub commit_retry_interval: Duration,
}

impl Default for BrokerConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            read_timeout: Duration::from_secs(5),
            max_commit_retries: 5,
            commit_retry_interval: Duration::from_millis(500),
        }
    }
}

pub struct BrokerConsumer {
    broker: Arc<dyn Broker>,
    config: BrokerConsumerConfig,
    uploader: Arc<RateLimitedUploader>,
    dlq: DlqWriter,
}

impl BrokerConsumer {
    pub fn new(broker: Arc<dyn Broker>, config: BrokerConsumerConfig, uploader: Arc<RateLimitedUploader>) -> Self {
        Self {
            dlq: DlqWriter::new(broker.clone()),
            broker,
            config,
            uploader,
        }
    }

    /// Main loop. Reads a batch, processes it to completion (upload or
    /// DLQ for every record), and only then reads the next batch — so
    /// there is never more than one batch's worth of offsets uncommitted
    /// at a time.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = tokio::select! {
                result = self.broker.read_batch(self.config.batch_size, self.config.read_timeout) => result,
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
                    error!(error = %e, "broker read failed");
                    continue;
                }
            };

            if records.is_empty() {
                continue;
            }

            if let Err(e) = self.process_batch(records).await {
                error!(error = %e, "batch processing failed");
            }
        }

        info!("broker consumer stopped");
        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "error closing broker client");
        }
    }

    /// Decode every record, route invalid ones straight to the DLQ, upload
    /// the valid set, route upload failures to the DLQ, then commit the
    /// largest offset in the batch exactly once.
    async fn process_batch(&self, records: Vec<BrokerRecord>) -> DispatchResult<()> {
        let last_offset = records.last().map(|r| r.offset.clone());

        let mut alerts = Vec::with_capacity(records.len());
        for record in &records {
            match decode_alert(&record.raw) {
                Ok(alert) => alerts.push(alert),
                Err(e) => {
                    warn!(offset = %record.offset, error = %e, "undecodable record, routing to DLQ");
                    let failed = FailedRecord::new(record.raw.clone(), "unknown", e.to_string(), "unknown", "unknown");
                    self.dlq.push(&failed).await?;
                }
            }
        }

        if !alerts.is_empty() {
            let outputs: Vec<Output> = alerts
                .iter()
                .map(|a| Output {
                    tenant: a.tenant.clone(),
                    datafeed_id: a.datafeed_id.clone(),
                    job_id: a.job_id.clone(),
                    alert: a.alert.clone(),
                })
                .collect();
            let batch = crate::dispatcher::OutputBatch {
                items: outputs,
                first_enq_at: std::time::Instant::now(),
            };

            let result = self.uploader.upload(&batch).await;
            if result.success_count > 0 {
                info!(count = result.success_count, "batch uploaded successfully");
            }
            for failure in result.failed {
                let failed = FailedRecord::new(
                    failure.output.alert.clone(),
                    failure.output.tenant.clone(),
                    failure.error.clone(),
                    failure.output.job_id.clone(),
                    failure.output.datafeed_id.clone(),
                );
                self.dlq.push(&failed).await?;
            }
        }

        if let Some(offset) = last_offset {
            self.commit_with_retries(&offset).await;
        }

        Ok(())
    }

    async fn commit_with_retries(&self, offset: &str) {
        for attempt in 0..=self.config.max_commit_retries {
            match self.broker.commit(offset).await {
                Ok(()) => return,
                Err(e) => {
                    if attempt == self.config.max_commit_retries {
                        error!(offset, error = %e, "commit exhausted retries, surrendering batch");
                        return;
                    }
                    warn!(offset, attempt, error = %e, "commit failed, retrying");
                    tokio::time::sleep(self.config.commit_retry_interval).await;
                }
            }
        }
    }
}

fn decode_alert(raw: &Value) -> Result<Alert, serde_json::Error> {
    if let Some(inner) = raw.get("data").and_then(Value::as_str) {
        return serde_json::from_str(inner);
    }
    serde_json::from_value(raw.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::{IngestionClient, IngestionResponse, IngestionResponseBody, UploaderConfig};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingBroker {
        batches: Mutex<Vec<Vec<BrokerRecord>>>,
        committed: Mutex<Vec<String>>,
        dlq: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Broker for RecordingBroker {
        async fn read_batch(&self, _batch_size: usize, _read_timeout: Duration) -> DispatchResult<Vec<BrokerRecord>> {
            Ok(self.batches.lock().unwrap().pop().unwrap_or_default())
        }
        async fn commit(&self, offset: &str) -> DispatchResult<()> {
            self.committed.lock().unwrap().push(offset.to_string());
            Ok(())
        }
        async fn publish_dlq(&self, payload: &Value) -> DispatchResult<()> {
            self.dlq.lock().unwrap().push(payload.clone());
            Ok(())
        }
        async fn publish_state(&self, _payload: &Value) -> DispatchResult<()> {
            Ok(())
        }
        async fn read_dlq_batch(&self, _batch_size: usize, _read_timeout: Duration) -> DispatchResult<Vec<BrokerRecord>> {
            Ok(Vec::new())
        }
        async fn ack_dlq(&self, _offset: &str) -> DispatchResult<()> {
            Ok(())
        }
        async fn close(&self) -> DispatchResult<()> {
            Ok(())
        }
    }

    struct AlwaysOkClient;
    #[async_trait]
    impl IngestionClient for AlwaysOkClient {
        async fn post_alerts(&self, _tenant: &str, _alerts: &[Value]) -> DispatchResult<IngestionResponse> {
            Ok(IngestionResponse {
                http_status: 200,
                body: IngestionResponseBody::default(),
                retry_after: None,
            })
        }
    }

    struct AlwaysFailClient;
    #[async_trait]
    impl IngestionClient for AlwaysFailClient {
        async fn post_alerts(&self, _tenant: &str, _alerts: &[Value]) -> DispatchResult<IngestionResponse> {
            Ok(IngestionResponse {
                http_status: 400,
                body: IngestionResponseBody {
                    error_code: Some("invalid_alert_schema".to_string()),
                    ..Default::default()
                },
                retry_after: None,
            })
        }
    }

    fn record(offset: &str) -> BrokerRecord {
        BrokerRecord {
            offset: offset.to_string(),
            raw: serde_json::json!({
                "tenant": "acme",
                "datafeed_id": "df-1",
                "job_id": "j1",
                "alert": {"x": 1},
            }),
        }
    }

    #[tokio::test]
    async fn successful_batch_commits_largest_offset() {
        let broker = Arc::new(RecordingBroker {
            batches: Mutex::new(vec![vec![record("100"), record("101")]]),
            committed: Mutex::new(Vec::new()),
            dlq: Mutex::new(Vec::new()),
        });
        let uploader = Arc::new(RateLimitedUploader::new(
            Arc::new(AlwaysOkClient),
            10,
            20,
            UploaderConfig::default(),
        ));
        let consumer = BrokerConsumer::new(
            broker.clone(),
            BrokerConsumerConfig::default(),
            uploader,
        );

        consumer
            .process_batch(vec![record("100"), record("101")])
            .await
            .unwrap();

        assert_eq!(broker.committed.lock().unwrap().as_slice(), ["101"]);
        assert!(broker.dlq.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_failure_routes_to_dlq_and_still_commits() {
        let broker = Arc::new(RecordingBroker {
            batches: Mutex::new(Vec::new()),
            committed: Mutex::new(Vec::new()),
            dlq: Mutex::new(Vec::new()),
        });
        let uploader = Arc::new(RateLimitedUploader::new(
            Arc::new(AlwaysFailClient),
            10,
            20,
            UploaderConfig::default(),
        ));
        let consumer = BrokerConsumer::new(
            broker.clone(),
            BrokerConsumerConfig::default(),
            uploader,
        );

        consumer.process_batch(vec![record("104")]).await.unwrap();

        assert_eq!(broker.committed.lock().unwrap().as_slice(), ["104"]);
        assert_eq!(broker.dlq.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn undecodable_record_goes_straight_to_dlq() {
        let broker = Arc::new(RecordingBroker {
            batches: Mutex::new(Vec::new()),
            committed: Mutex::new(Vec::new()),
            dlq: Mutex::new(Vec::new()),
        });
        let uploader = Arc::new(RateLimitedUploader::new(
            Arc::new(AlwaysOkClient),
            10,
            20,
            UploaderConfig::default(),
        ));
        let consumer = BrokerConsumer::new(
            broker.clone(),
            BrokerConsumerConfig::default(),
            uploader,
        );

        let bad = BrokerRecord {
            offset: "1".to_string(),
            raw: serde_json::json!({"not": "an alert"}),
        };
        consumer.process_batch(vec![bad]).await.unwrap();

        assert_eq!(broker.dlq.lock().unwrap().len(), 1);
        assert_eq!(broker.committed.lock().unwrap().as_slice(), ["1"]);
    }
}
