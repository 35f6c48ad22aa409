//! The record shape read off the broker's input topic by `BrokerConsumer`
//! (C7) and written to the downstream ingestion API by `RateLimitedUploader`
//! (C8). The core does not own this schema beyond the fields it reads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub tenant: String,
    pub datafeed_id: String,
    pub job_id: String,
    pub alert: Value,
}
