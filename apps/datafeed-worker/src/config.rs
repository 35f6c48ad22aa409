//! Recognized configuration keys, loaded from the environment the way
//! `core_config::FromEnv` implementations elsewhere in this workspace do:
//! dotted keys become `SCREAMING_SNAKE_CASE` env vars with underscores in
//! place of dots (`worker.minimum_containers` -> `WORKER_MINIMUM_CONTAINERS`).

use core_config::{env_or_default, env_parse_or_default, ConfigError, FromEnv};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub minimum_containers: usize,
    pub maximum_containers: usize,
    pub container_idle_timeout: Duration,
    pub workers_per_shard: usize,
    pub number_of_shards: usize,
    pub image: String,
    pub python_base_image: String,
    pub debug_key: String,

    pub network_name: String,
    pub network_dns: String,
    pub network_dns_search: String,
    pub network_hosts: String,
    pub dns_opt: String,
    pub environments: String,
    pub agent_cert_path: String,
    pub agent_mode: AgentMode,

    pub kafka_topic_job_state: String,
    pub kafka_topic_alert_dlq: String,
    pub kafka_topic_alert_retry: String,
    pub kafka_batch_size: usize,
    pub kafka_message_read_timeout: Duration,

    pub soar_api_base_url: String,
    pub soar_api_api_key: String,
    pub soar_api_rate_limit: u32,
    pub soar_api_burst_limit: u32,
    pub soar_api_max_retries: u32,
    pub soar_api_retry_interval: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentMode {
    Server,
    Agent,
}

impl FromEnv for WorkerSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let agent_mode = match env_or_default("AGENT_MODE", "server").as_str() {
            "agent" => AgentMode::Agent,
            _ => AgentMode::Server,
        };

        Ok(Self {
            minimum_containers: env_parse_or_default("WORKER_MINIMUM_CONTAINERS", 2),
            maximum_containers: env_parse_or_default("WORKER_MAXIMUM_CONTAINERS", 10),
            container_idle_timeout: Duration::from_secs(env_parse_or_default("WORKER_CONTAINER_IDLE_TIMEOUT", 300)),
            workers_per_shard: env_parse_or_default("WORKER_NUMBER_OF_WORKERS_PER_SHARD", 4),
            number_of_shards: env_parse_or_default("WORKER_NUMBER_OF_SHARDS", 8),
            image: env_or_default("WORKER_IMAGE", "datafeed-sandbox:latest"),
            python_base_image: env_or_default("WORKER_PYTHON_BASE_IMAGE", "python:3.11-slim"),
            debug_key: env_or_default("WORKER_DEBUG_KEY", "debug"),

            network_name: env_or_default("NETWORK_NAME", "bridge"),
            network_dns: env_or_default("NETWORK_DNS", ""),
            network_dns_search: env_or_default("NETWORK_DNS_SEARCH", ""),
            network_hosts: env_or_default("NETWORK_HOSTS", ""),
            dns_opt: env_or_default("DNS_OPT", ""),
            environments: env_or_default("ENVIRONMENTS", ""),
            agent_cert_path: env_or_default("AGENT_CERT_PATH", "/etc/datafeed/agent.pem"),
            agent_mode,

            kafka_topic_job_state: env_or_default("KAFKA_TOPIC_JOB_STATE", "job-state"),
            kafka_topic_alert_dlq: env_or_default("KAFKA_TOPIC_ALERT_DLQ", "alert-dlq"),
            kafka_topic_alert_retry: env_or_default("KAFKA_TOPIC_ALERT_RETRY", "alert-retry"),
            kafka_batch_size: env_parse_or_default("KAFKA_BATCH_SIZE", 10),
            kafka_message_read_timeout: Duration::from_secs(env_parse_or_default("KAFKA_MESSAGE_READ_TIMEOUT", 5)),

            soar_api_base_url: env_or_default("SOAR_API_BASE_URL", "http://localhost:8443"),
            soar_api_api_key: env_or_default("SOAR_API_API_KEY", ""),
            soar_api_rate_limit: env_parse_or_default("SOAR_API_RATE_LIMIT", 10),
            soar_api_burst_limit: env_parse_or_default("SOAR_API_BURST_LIMIT", 20),
            soar_api_max_retries: env_parse_or_default("SOAR_API_MAX_RETRIES", 3),
            soar_api_retry_interval: Duration::from_secs(env_parse_or_default("SOAR_API_RETRY_INTERVAL", 5)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied_when_unset() {
        temp_env::with_vars(
            [
                ("WORKER_MINIMUM_CONTAINERS", None::<&str>),
                ("AGENT_MODE", None::<&str>),
            ],
            || {
                let settings = WorkerSettings::from_env().unwrap();
                assert_eq!(settings.minimum_containers, 2);
                assert_eq!(settings.agent_mode, AgentMode::Server);
            },
        );
    }

    #[test]
    fn agent_mode_parses_agent_value() {
        temp_env::with_var("AGENT_MODE", Some("agent"), || {
            let settings = WorkerSettings::from_env().unwrap();
            assert_eq!(settings.agent_mode, AgentMode::Agent);
        });
    }
}
