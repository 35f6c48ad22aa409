//! C6: per-job preprocess (compose sandbox context) and postprocess
//! (classify assembled output, advance job status, emit the downstream
//! state-change message).

use serde_json::{json, Value};

use crate::job::{Job, JobStatus, KafkaMessage, TenantTokens};

/// Assembled output from a worker's drain of a sandbox, built up from the
/// `result`/`ignored_exception`/`error`/`completed` records.
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub success: bool,
    pub message: Option<String>,
    pub fetched_data: Vec<Value>,
    pub payload: Option<Value>,
}

pub struct JobHandler;

impl JobHandler {
    pub fn new() -> Self {
        Self
    }

    /// Build the JSON context written to the sandbox's stdin, merging the
    /// job's recognized options with the tenant's credentials.
    pub fn preprocess(&self, job: &Job, tokens: &TenantTokens) -> String {
        let env_vars = job.options.parsed_env_vars();
        let context = json!({
            "job_id": job.job_id,
            "task_id": job.task_id,
            "request_id": job.request_id,
            "script": job.options.script,
            "command": job.options.command,
            "integrationid": job.options.integrationid,
            "args": job.options.args,
            "params": job.options.params,
            "workflowinstance": job.options.workflowinstance,
            "env_vars": env_vars,
            "native": job.options.native,
            "api_token": tokens.api_token,
            "datafeed_token": tokens.datafeed_token,
        });
        context.to_string()
    }

    /// Classify the assembled output, derive the job's terminal status,
    /// and build the state-change messages to emit onto the broker's
    /// state topic. Fetched-data jobs emit one message per element (1-based
    /// order, total count, `last_message` on the last one) followed by a
    /// terminal `COMPLETED` message with an empty payload.
    pub fn postprocess(&self, mut job: Job, outcome: JobOutcome) -> (Job, Vec<KafkaMessage<Value>>) {
        let mut messages = Vec::new();

        if !outcome.fetched_data.is_empty() {
            job.status = JobStatus::Completing;
            let total = outcome.fetched_data.len();
            for (idx, item) in outcome.fetched_data.iter().enumerate() {
                let order = idx + 1;
                let data = json!({
                    "order": order,
                    "total": total,
                    "last_message": order == total,
                    "item": item,
                });
                messages.push(KafkaMessage::job_state_change("job_state_change", &job.job_id, data));
            }
            job.status = JobStatus::Completed;
            messages.push(KafkaMessage::job_state_change(
                "job_state_change",
                &job.job_id,
                json!({}),
            ));
            return (job, messages);
        }

        job.status = if outcome.success {
            JobStatus::Completed
        } else {
            JobStatus::Terminated
        };

        let data = serde_json::to_value(&job).unwrap_or(Value::Null);
        messages.push(KafkaMessage::job_state_change("job_state_change", &job.job_id, data));
        (job, messages)
    }

    pub fn mark_dlq_routed(&self, mut job: Job) -> (Job, KafkaMessage<Value>) {
        job.status = JobStatus::DlqRouted;
        let data = serde_json::to_value(&job).unwrap_or(Value::Null);
        let msg = KafkaMessage::job_state_change("job_state_change", &job.job_id, data);
        (job, msg)
    }
}

impl Default for JobHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use chrono::Utc;

    fn job() -> Job {
        Job {
            job_id: "j1".into(),
            tenant: "acme".into(),
            datafeed_id: "df-1".into(),
            task_id: "t1".into(),
            request_id: "r1".into(),
            options: JobOptions {
                script: Some("print('hi')".into()),
                env_vars: Some("A=1,B=2".into()),
                ..Default::default()
            },
            status: JobStatus::Queued,
            created_at: Utc::now(),
        }
    }

    fn tokens() -> TenantTokens {
        TenantTokens {
            api_token: "api".into(),
            datafeed_token: "df".into(),
        }
    }

    #[test]
    fn preprocess_merges_tenant_credentials_into_context() {
        let handler = JobHandler::new();
        let context = handler.preprocess(&job(), &tokens());
        let parsed: Value = serde_json::from_str(&context).unwrap();
        assert_eq!(parsed["api_token"], "api");
        assert_eq!(parsed["env_vars"]["A"], "1");
    }

    #[test]
    fn postprocess_success_marks_completed() {
        let handler = JobHandler::new();
        let outcome = JobOutcome {
            success: true,
            ..Default::default()
        };
        let (job, messages) = handler.postprocess(job(), outcome);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn postprocess_failure_marks_terminated() {
        let handler = JobHandler::new();
        let outcome = JobOutcome {
            success: false,
            ..Default::default()
        };
        let (job, _) = handler.postprocess(job(), outcome);
        assert_eq!(job.status, JobStatus::Terminated);
    }

    #[test]
    fn fetched_data_emits_one_message_per_element_plus_terminal() {
        let handler = JobHandler::new();
        let outcome = JobOutcome {
            success: true,
            fetched_data: vec![json!({"a": 1}), json!({"a": 2}), json!({"a": 3})],
            ..Default::default()
        };
        let (job, messages) = handler.postprocess(job(), outcome);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].data["order"], 1);
        assert_eq!(messages[2].data["last_message"], true);
        assert_eq!(messages[3].data, json!({}));
    }
}
