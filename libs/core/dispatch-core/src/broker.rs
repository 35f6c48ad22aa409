//! The broker client itself is a non-goal: this module defines the
//! `Broker` trait the consumer (C7) and DLQ consumer (C10) orchestrate
//! against, plus a Redis Streams implementation since that is the
//! concrete transport this deployment uses elsewhere.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, DispatchResult};

/// One record read from the broker, still opaque at this layer: decoding
/// into a `Job` or `Alert` happens in the consumer.
#[derive(Debug, Clone)]
pub struct BrokerRecord {
    pub offset: String,
    pub raw: Value,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Block up to `read_timeout` for up to `batch_size` records.
    async fn read_batch(&self, batch_size: usize, read_timeout: Duration) -> DispatchResult<Vec<BrokerRecord>>;
    /// Commit a monotonically non-decreasing offset for this consumer group.
    async fn commit(&self, offset: &str) -> DispatchResult<()>;
    /// Append a raw JSON document to the DLQ topic.
    async fn publish_dlq(&self, payload: &Value) -> DispatchResult<()>;
    /// Append a state-change message to the job state topic.
    async fn publish_state(&self, payload: &Value) -> DispatchResult<()>;
    /// Block up to `read_timeout` for up to `batch_size` DLQ records, under
    /// the DLQ consumer's own group so it never competes with `read_batch`.
    async fn read_dlq_batch(&self, batch_size: usize, read_timeout: Duration) -> DispatchResult<Vec<BrokerRecord>>;
    /// Acknowledge a DLQ record, whether it was resolved, requeued (the
    /// requeue is a fresh `publish_dlq` append), or dropped after exhausting
    /// retries.
    async fn ack_dlq(&self, offset: &str) -> DispatchResult<()>;
    async fn close(&self) -> DispatchResult<()>;
}

pub struct RedisStreamsBrokerConfig {
    pub input_stream: String,
    pub state_stream: String,
    pub dlq_stream: String,
    pub consumer_group: String,
    pub consumer_id: String,
    pub dlq_consumer_group: String,
    pub dlq_consumer_id: String,
    pub dlq_max_length: i64,
}

pub struct RedisStreamsBroker {
    redis: Arc<ConnectionManager>,
    config: RedisStreamsBrokerConfig,
}

impl RedisStreamsBroker {
    pub async fn new(redis: ConnectionManager, config: RedisStreamsBrokerConfig) -> DispatchResult<Self> {
        let broker = Self {
            redis: Arc::new(redis),
            config,
        };
        broker.ensure_consumer_group().await?;
        Ok(broker)
    }

    async fn ensure_consumer_group(&self) -> DispatchResult<()> {
        self.ensure_group(&self.config.input_stream, &self.config.consumer_group)
            .await?;
        self.ensure_group(&self.config.dlq_stream, &self.config.dlq_consumer_group)
            .await
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> DispatchResult<()> {
        let mut conn = (*self.redis).clone();
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                info!(group, "created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(DispatchError::Redis(e)),
        }
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    async fn read_batch(&self, batch_size: usize, read_timeout: Duration) -> DispatchResult<Vec<BrokerRecord>> {
        let mut conn = (*self.redis).clone();
        let opts = StreamReadOptions::default()
            .group(&self.config.consumer_group, &self.config.consumer_id)
            .count(batch_size)
            .block(read_timeout.as_millis() as usize);

        let result: Result<StreamReadReply, _> = conn
            .xread_options(&[&self.config.input_stream], &[">"], &opts)
            .await;

        match result {
            Ok(reply) => Ok(parse_records(reply)),
            Err(e) => {
                let text = e.to_string().to_lowercase();
                if text.contains("timeout") || text.contains("nil") {
                    Ok(Vec::new())
                } else {
                    Err(DispatchError::Redis(e))
                }
            }
        }
    }

    async fn commit(&self, offset: &str) -> DispatchResult<()> {
        let mut conn = (*self.redis).clone();
        let _: () = conn
            .xack(&self.config.input_stream, &self.config.consumer_group, &[offset])
            .await?;
        Ok(())
    }

    async fn publish_dlq(&self, payload: &Value) -> DispatchResult<()> {
        let mut conn = (*self.redis).clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.config.dlq_stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.dlq_max_length)
            .arg("*")
            .arg("data")
            .arg(payload.to_string())
            .query_async(&mut conn)
            .await?;
        warn!(stream = %self.config.dlq_stream, "record routed to DLQ");
        Ok(())
    }

    async fn publish_state(&self, payload: &Value) -> DispatchResult<()> {
        let mut conn = (*self.redis).clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.config.state_stream)
            .arg("*")
            .arg("data")
            .arg(payload.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_dlq_batch(&self, batch_size: usize, read_timeout: Duration) -> DispatchResult<Vec<BrokerRecord>> {
        let mut conn = (*self.redis).clone();
        let opts = StreamReadOptions::default()
            .group(&self.config.dlq_consumer_group, &self.config.dlq_consumer_id)
            .count(batch_size)
            .block(read_timeout.as_millis() as usize);

        let result: Result<StreamReadReply, _> = conn
            .xread_options(&[&self.config.dlq_stream], &[">"], &opts)
            .await;

        match result {
            Ok(reply) => Ok(parse_records(reply)),
            Err(e) => {
                let text = e.to_string().to_lowercase();
                if text.contains("timeout") || text.contains("nil") {
                    Ok(Vec::new())
                } else {
                    Err(DispatchError::Redis(e))
                }
            }
        }
    }

    async fn ack_dlq(&self, offset: &str) -> DispatchResult<()> {
        let mut conn = (*self.redis).clone();
        let _: () = conn
            .xack(&self.config.dlq_stream, &self.config.dlq_consumer_group, &[offset])
            .await?;
        Ok(())
    }

    async fn close(&self) -> DispatchResult<()> {
        Ok(())
    }
}

fn parse_records(reply: StreamReadReply) -> Vec<BrokerRecord> {
    let mut records = Vec::new();
    for stream_key in reply.keys {
        for message in stream_key.ids {
            let mut fields = serde_json::Map::new();
            for (field, value) in message.map.iter() {
                if let redis::Value::BulkString(bytes) = value {
                    if let Ok(text) = String::from_utf8(bytes.clone()) {
                        fields.insert(field.clone(), Value::String(text));
                    }
                }
            }
            records.push(BrokerRecord {
                offset: message.id,
                raw: Value::Object(fields),
            });
        }
    }
    records
}
