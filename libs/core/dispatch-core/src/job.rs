//! The execution unit that flows Broker -> Router -> WorkerPool -> Sandbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tenant credentials held by the `TokenStore` and injected into a
/// sandbox's environment immediately before it is lent out.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantTokens {
    pub api_token: String,
    pub datafeed_token: String,
}

/// Lifecycle states for a job, per the session glossary:
/// `QUEUED -> COMPLETING -> COMPLETED | TERMINATED | DLQ_ROUTED`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Completing,
    Completed,
    Terminated,
    DlqRouted,
}

/// Free-form preprocess options recognized when composing the sandbox
/// context. Every field is optional; unrecognized keys are ignored by the
/// sandbox.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobOptions {
    pub script: Option<String>,
    pub command: Option<String>,
    pub integrationid: Option<String>,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub params: serde_json::Value,
    pub workflowinstance: Option<String>,
    /// Comma-separated `k=v` pairs applied as environment before executing,
    /// restored on exit.
    pub env_vars: Option<String>,
    /// One-shot (sandbox exits after this execution) vs. looping.
    #[serde(default)]
    pub native: bool,
}

impl JobOptions {
    /// Parse `env_vars` into a map, tolerating malformed entries by skipping
    /// them rather than failing the whole job.
    pub fn parsed_env_vars(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        let Some(raw) = &self.env_vars else {
            return map;
        };
        for pair in raw.split(',') {
            if let Some((k, v)) = pair.split_once('=') {
                map.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
        map
    }
}

/// An execution unit decoded from a broker record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub tenant: String,
    pub datafeed_id: String,
    pub task_id: String,
    pub request_id: String,
    pub options: JobOptions,
    #[serde(default)]
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Queued
    }
}

impl Job {
    /// The routing key: jobs sharing this key land on the same shard.
    pub fn routing_key(&self) -> String {
        format!("{}-{}", self.tenant, self.datafeed_id)
    }
}

/// Envelope used when a job's state change is emitted onto the broker's
/// state topic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KafkaMessage<T> {
    #[serde(rename = "type")]
    pub message_type: String,
    pub target_type: String,
    pub target_id: String,
    pub data: T,
}

impl<T> KafkaMessage<T> {
    pub fn job_state_change(message_type: impl Into<String>, job_id: impl Into<String>, data: T) -> Self {
        Self {
            message_type: message_type.into(),
            target_type: "job".to_string(),
            target_id: job_id.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_combines_tenant_and_datafeed() {
        let job = Job {
            job_id: "j1".into(),
            tenant: "acme".into(),
            datafeed_id: "df-1".into(),
            task_id: "t1".into(),
            request_id: "r1".into(),
            options: JobOptions::default(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
        };
        assert_eq!(job.routing_key(), "acme-df-1");
    }

    #[test]
    fn env_vars_parse_and_tolerate_garbage() {
        let opts = JobOptions {
            env_vars: Some("A=1,B=2,garbage,C=3".to_string()),
            ..Default::default()
        };
        let map = opts.parsed_env_vars();
        assert_eq!(map.get("A").unwrap(), "1");
        assert_eq!(map.get("B").unwrap(), "2");
        assert_eq!(map.get("C").unwrap(), "3");
        assert_eq!(map.len(), 3);
    }
}
