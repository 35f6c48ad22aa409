//! C5: per-shard worker pools that drain `ShardQueue`s, drive a sandbox
//! through one execution, and hand the assembled output to the dispatcher.
//! A work-stealing steward absorbs imbalance across shards, deliberately
//! relaxing per-datafeed ordering (see the routing design notes) when it
//! does.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, warn};

use crate::container_pool::ContainerPool;
use crate::dispatcher::Output;
use crate::job::Job;
use crate::job_handler::{JobHandler, JobOutcome};
use crate::resilience::CircuitBreakerRegistry;
use crate::sandbox::SandboxRecord;
use crate::token_store::TokenStore;

/// How long a single job may occupy a sandbox before the worker gives up
/// and treats it as a sandbox fault.
const RECORD_READ_TIMEOUT: Duration = Duration::from_secs(300);

struct Shard {
    id: usize,
    queue: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    idle_workers: Arc<AtomicUsize>,
    worker_count: usize,
}

pub struct WorkerPoolConfig {
    pub workers_per_shard: usize,
    pub steal_check_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers_per_shard: 4,
            steal_check_interval: Duration::from_millis(100),
        }
    }
}

pub struct WorkerPool {
    shards: Vec<Shard>,
    config: WorkerPoolConfig,
    container_pool: Arc<ContainerPool>,
    token_store: Arc<TokenStore>,
    breakers: Arc<CircuitBreakerRegistry>,
    job_handler: Arc<JobHandler>,
    output_tx: mpsc::Sender<Output>,
    state_tx: mpsc::Sender<Value>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queues: Vec<mpsc::Receiver<Job>>,
        config: WorkerPoolConfig,
        container_pool: Arc<ContainerPool>,
        token_store: Arc<TokenStore>,
        breakers: Arc<CircuitBreakerRegistry>,
        job_handler: Arc<JobHandler>,
        output_tx: mpsc::Sender<Output>,
        state_tx: mpsc::Sender<Value>,
    ) -> Self {
        let shards = queues
            .into_iter()
            .enumerate()
            .map(|(id, rx)| Shard {
                id,
                queue: Arc::new(AsyncMutex::new(rx)),
                idle_workers: Arc::new(AtomicUsize::new(0)),
                worker_count: config.workers_per_shard,
            })
            .collect();

        Self {
            shards,
            config,
            container_pool,
            token_store,
            breakers,
            job_handler,
            output_tx,
            state_tx,
        }
    }

    /// Spawn every shard's workers plus the cross-shard stealing steward.
    /// Returns the join handles so the caller can await graceful shutdown.
    pub fn spawn(self: Arc<Self>, shutdown: tokio::sync::watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        for shard_idx in 0..self.shards.len() {
            for _ in 0..self.shards[shard_idx].worker_count {
                let pool = Arc::clone(&self);
                let shutdown_rx = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    pool.run_shard_worker(shard_idx, shutdown_rx).await;
                }));
            }
        }

        let steward_pool = Arc::clone(&self);
        handles.push(tokio::spawn(async move {
            steward_pool.run_steward(shutdown.clone()).await;
        }));

        handles
    }

    async fn run_shard_worker(&self, shard_idx: usize, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let shard = &self.shards[shard_idx];
        loop {
            shard.idle_workers.fetch_add(1, Ordering::SeqCst);
            let received = tokio::select! {
                job = async {
                    let mut queue = shard.queue.lock().await;
                    queue.recv().await
                } => job,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        shard.idle_workers.fetch_sub(1, Ordering::SeqCst);
                        return;
                    }
                    None
                }
            };
            shard.idle_workers.fetch_sub(1, Ordering::SeqCst);

            match received {
                Some(job) => self.execute(job, shard.id, false).await,
                None => return,
            }
        }
    }

    async fn run_steward(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.steal_check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for idx in 0..self.shards.len() {
                        if self.shards[idx].idle_workers.load(Ordering::SeqCst) < self.shards[idx].worker_count {
                            continue;
                        }
                        self.try_steal_for(idx).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Try a non-blocking dequeue from every sibling shard on behalf of an
    /// idle shard. Deliberately relaxes per-datafeed stickiness.
    async fn try_steal_for(&self, idle_shard_idx: usize) {
        for (idx, sibling) in self.shards.iter().enumerate() {
            if idx == idle_shard_idx {
                continue;
            }
            let stolen = {
                let mut guard = match sibling.queue.try_lock() {
                    Ok(guard) => guard,
                    Err(_) => continue,
                };
                guard.try_recv().ok()
            };
            if let Some(job) = stolen {
                debug!(from_shard = idx, to_shard = idle_shard_idx, job_id = %job.job_id, "work stolen");
                metrics::counter!("dispatch_worker_stolen_total").increment(1);
                self.execute(job, idle_shard_idx, true).await;
                return;
            }
        }
    }

    async fn execute(&self, job: Job, shard_id: usize, stolen: bool) {
        let datafeed_id = job.datafeed_id.clone();
        let tenant = job.tenant.clone();
        let (tokens, exists) = self.token_store.get(&tenant);
        let tokens = match tokens {
            Some(t) => t,
            None => {
                warn!(tenant = %tenant, exists, "no credentials for tenant, synthesizing failure");
                self.finish_with_failure(job, shard_id, "no tenant credentials configured".into())
                    .await;
                return;
            }
        };

        let mut lease = match self.container_pool.get(&tenant, &tokens).await {
            Ok(lease) => lease,
            Err(e) => {
                error!(error = %e, shard_id, stolen, "failed to acquire sandbox");
                self.breakers.report_failure(&datafeed_id);
                self.finish_with_failure(job, shard_id, e.to_string()).await;
                return;
            }
        };

        let context = self.job_handler.preprocess(&job, &tokens);
        let outcome = if let Err(e) = lease.io().write_context(&context).await {
            error!(error = %e, "failed to write sandbox context");
            self.breakers.report_failure(&datafeed_id);
            JobOutcome {
                success: false,
                message: Some(e.to_string()),
                ..Default::default()
            }
        } else {
            self.drain_sandbox(lease.io()).await
        };

        self.container_pool.release(lease);

        if outcome.success {
            self.breakers.report_success(&datafeed_id);
        } else {
            self.breakers.report_failure(&datafeed_id);
        }

        self.emit_output(&job, &outcome).await;

        let (_, messages) = self.job_handler.postprocess(job, outcome);
        self.emit_state_changes(messages).await;
    }

    async fn drain_sandbox(&self, io: &mut (dyn crate::sandbox::SandboxIo + 'static)) -> JobOutcome {
        let mut outcome = JobOutcome::default();
        loop {
            match io.read_record(RECORD_READ_TIMEOUT).await {
                Ok(Some(record)) => match record {
                    SandboxRecord::Result { payload, fetched_data } => {
                        outcome.success = true;
                        outcome.payload = Some(payload);
                        if let Some(items) = fetched_data {
                            outcome.fetched_data.extend(items);
                        }
                    }
                    SandboxRecord::IgnoredException { message } => {
                        outcome.success = true;
                        outcome.message = Some(message);
                    }
                    SandboxRecord::Failure { message } => {
                        outcome.success = false;
                        outcome.message = Some(message);
                    }
                    SandboxRecord::Pending => {
                        continue;
                    }
                    SandboxRecord::Log { message } => {
                        debug!(sandbox_log = %message, "sandbox log line");
                        continue;
                    }
                    SandboxRecord::Completed => {
                        break;
                    }
                    SandboxRecord::AliveAck => continue,
                    SandboxRecord::Unknown { raw_type, .. } => {
                        debug!(raw_type = %raw_type, "unrecognized sandbox record type");
                        continue;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "sandbox read failed, treating as fault");
                    outcome.success = false;
                    outcome.message = Some(e.to_string());
                    break;
                }
            }
        }
        outcome
    }

    async fn finish_with_failure(&self, job: Job, _shard_id: usize, message: String) {
        let outcome = JobOutcome {
            success: false,
            message: Some(message),
            ..Default::default()
        };
        self.emit_output(&job, &outcome).await;
        let (_, messages) = self.job_handler.postprocess(job, outcome);
        self.emit_state_changes(messages).await;
    }

    async fn emit_state_changes(&self, messages: Vec<crate::job::KafkaMessage<Value>>) {
        for message in messages {
            let payload = match serde_json::to_value(&message) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "failed to serialize job state change");
                    continue;
                }
            };
            if self.state_tx.send(payload).await.is_err() {
                warn!("state change channel closed, message dropped");
            }
        }
    }

    async fn emit_output(&self, job: &Job, outcome: &JobOutcome) {
        let alert = outcome.payload.clone().unwrap_or_else(|| {
            Value::String(outcome.message.clone().unwrap_or_default())
        });
        let output = Output {
            tenant: job.tenant.clone(),
            datafeed_id: job.datafeed_id.clone(),
            job_id: job.job_id.clone(),
            alert,
        };
        if self.output_tx.send(output).await.is_err() {
            warn!(job_id = %job.job_id, "output dispatcher gone, output dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container_pool::{ContainerPoolConfig, SandboxFactory};
    use crate::job::{JobOptions, JobStatus};
    use crate::resilience::CircuitBreakerConfig;
    use crate::sandbox::SandboxIo;
    use async_trait::async_trait;
    use chrono::Utc;

    struct ScriptedSandbox {
        records: Vec<SandboxRecord>,
    }

    #[async_trait]
    impl SandboxIo for ScriptedSandbox {
        async fn write_context(&mut self, _context: &str) -> crate::error::DispatchResult<()> {
            Ok(())
        }

        async fn read_record(&mut self, _timeout: Duration) -> crate::error::DispatchResult<Option<SandboxRecord>> {
            if self.records.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.records.remove(0)))
            }
        }

        async fn kill(&mut self) -> crate::error::DispatchResult<()> {
            Ok(())
        }
    }

    struct ScriptedFactory;

    #[async_trait]
    impl SandboxFactory for ScriptedFactory {
        async fn create(&self) -> crate::error::DispatchResult<Box<dyn SandboxIo>> {
            Ok(Box::new(ScriptedSandbox {
                records: vec![
                    SandboxRecord::AliveAck,
                    SandboxRecord::Result {
                        payload: Value::String("ok".into()),
                        fetched_data: None,
                    },
                    SandboxRecord::Completed,
                ],
            }))
        }
    }

    fn job(tenant: &str, datafeed_id: &str) -> Job {
        Job {
            job_id: uuid::Uuid::new_v4().to_string(),
            tenant: tenant.to_string(),
            datafeed_id: datafeed_id.to_string(),
            task_id: "t".into(),
            request_id: "r".into(),
            options: JobOptions::default(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn successful_job_reports_breaker_success_and_emits_output() {
        let container_pool = Arc::new(
            ContainerPool::initialize(
                Box::new(ScriptedFactory),
                ContainerPoolConfig {
                    min: 1,
                    max: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap(),
        );
        let token_store = Arc::new(TokenStore::new());
        token_store.set(
            "acme",
            crate::job::TenantTokens {
                api_token: "a".into(),
                datafeed_token: "b".into(),
            },
        );
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let job_handler = Arc::new(JobHandler::new());
        let (output_tx, mut output_rx) = mpsc::channel(8);
        let (state_tx, mut state_rx) = mpsc::channel(8);
        let (_queue_tx, queue_rx) = mpsc::channel(8);

        let pool = WorkerPool::new(
            vec![queue_rx],
            WorkerPoolConfig::default(),
            container_pool,
            token_store,
            breakers.clone(),
            job_handler,
            output_tx,
            state_tx,
        );

        pool.execute(job("acme", "df-1"), 0, false).await;
        assert!(state_rx.try_recv().is_ok());

        let output = output_rx.try_recv().unwrap();
        assert_eq!(output.tenant, "acme");
        assert_eq!(breakers.state_of("df-1"), crate::resilience::CircuitState::Closed);
    }

    #[tokio::test]
    async fn missing_tenant_credentials_reports_failure() {
        let container_pool = Arc::new(
            ContainerPool::initialize(
                Box::new(ScriptedFactory),
                ContainerPoolConfig {
                    min: 1,
                    max: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap(),
        );
        let token_store = Arc::new(TokenStore::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        }));
        let job_handler = Arc::new(JobHandler::new());
        let (output_tx, mut output_rx) = mpsc::channel(8);
        let (state_tx, _state_rx) = mpsc::channel(8);
        let (_queue_tx, queue_rx) = mpsc::channel(8);

        let pool = WorkerPool::new(
            vec![queue_rx],
            WorkerPoolConfig::default(),
            container_pool,
            token_store,
            breakers.clone(),
            job_handler,
            output_tx,
            state_tx,
        );

        pool.execute(job("ghost-tenant", "df-2"), 0, false).await;
        let _ = output_rx.try_recv().unwrap();
        assert_eq!(breakers.state_of("df-2"), crate::resilience::CircuitState::Open);
    }
}
