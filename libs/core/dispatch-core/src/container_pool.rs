//! C2: a bounded set of warm, reusable sandboxes with idle eviction and
//! liveness probing.
//!
//! Invariants (P1, P2): `min <= |all| <= max` at every observation point
//! after initialization, and every sandbox is in exactly one of `Free`
//! (in `available`) or `Busy` (held by exactly one caller, which is
//! enforced structurally: a busy sandbox's `SandboxEntry` simply does not
//! exist in the pool's bookkeeping until it is released).

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DispatchError, DispatchResult};
use crate::job::TenantTokens;
use crate::sandbox::{SandboxIo, ALIVE_MARKER};

/// Builds a fresh sandbox. Implemented by whatever owns the container
/// platform client (non-goal of this crate; injected here).
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    async fn create(&self) -> DispatchResult<Box<dyn SandboxIo>>;
}

struct SandboxEntry {
    id: Uuid,
    io: Box<dyn SandboxIo>,
}

/// A leased, Busy sandbox. Held by exactly one worker until released.
pub struct Lease {
    pub id: Uuid,
    io: Box<dyn SandboxIo>,
}

impl Lease {
    pub fn io(&mut self) -> &mut (dyn SandboxIo + 'static) {
        self.io.as_mut()
    }
}

struct PoolInner {
    available: VecDeque<SandboxEntry>,
    all_ids: std::collections::HashSet<Uuid>,
    last_used_at: HashMap<Uuid, Instant>,
}

pub struct ContainerPoolConfig {
    pub min: usize,
    pub max: usize,
    pub idle_timeout: Duration,
    pub eviction_period: Duration,
    pub acquire_timeout: Duration,
    pub liveness_timeout: Duration,
}

impl Default for ContainerPoolConfig {
    fn default() -> Self {
        Self {
            min: 2,
            max: 10,
            idle_timeout: Duration::from_secs(300),
            eviction_period: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(2),
        }
    }
}

pub struct ContainerPool {
    factory: Box<dyn SandboxFactory>,
    config: ContainerPoolConfig,
    inner: Mutex<PoolInner>,
    notify: Notify,
    stopped: AtomicBool,
}

impl ContainerPool {
    /// Create exactly `min` sandboxes eagerly; fail startup if any cannot
    /// be created.
    pub async fn initialize(
        factory: Box<dyn SandboxFactory>,
        config: ContainerPoolConfig,
    ) -> DispatchResult<Self> {
        let pool = Self {
            factory,
            config,
            inner: Mutex::new(PoolInner {
                available: VecDeque::new(),
                all_ids: std::collections::HashSet::new(),
                last_used_at: HashMap::new(),
            }),
            notify: Notify::new(),
            stopped: AtomicBool::new(false),
        };

        for _ in 0..pool.config.min {
            let entry = pool.create_and_register().await?;
            let mut inner = pool.lock_inner();
            inner.last_used_at.insert(entry.id, Instant::now());
            inner.available.push_back(entry);
        }

        info!(min = pool.config.min, max = pool.config.max, "container pool initialized");
        Ok(pool)
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().expect("container pool mutex poisoned")
    }

    async fn create_and_register(&self) -> DispatchResult<SandboxEntry> {
        let io = self.factory.create().await?;
        let id = Uuid::new_v4();
        self.lock_inner().all_ids.insert(id);
        Ok(SandboxEntry { id, io })
    }

    /// Lend a Free sandbox, verifying liveness first and injecting the
    /// requesting tenant's credentials.
    pub async fn get(&self, tenant: &str, tokens: &TenantTokens) -> DispatchResult<Lease> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DispatchError::PoolStopped);
        }

        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(DispatchError::PoolStopped);
            }

            let popped = {
                let mut inner = self.lock_inner();
                inner.available.pop_front()
            };

            let mut entry = match popped {
                Some(entry) => entry,
                None => {
                    let can_create = self.lock_inner().all_ids.len() < self.config.max;
                    if can_create {
                        match self.create_and_register().await {
                            Ok(entry) => entry,
                            Err(e) => {
                                warn!(error = %e, "sandbox creation failed while acquiring");
                                if Instant::now() >= deadline {
                                    return Err(DispatchError::ResourceExhausted(self.config.acquire_timeout));
                                }
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                continue;
                            }
                        }
                    } else {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            return Err(DispatchError::ResourceExhausted(self.config.acquire_timeout));
                        }
                        let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
                        continue;
                    }
                }
            };

            if !self.probe_alive(&mut entry).await {
                self.discard(&entry);
                self.maybe_replace_to_floor().await;
                continue;
            }

            self.inject_tenant_env(&mut entry, tenant, tokens).await?;

            return Ok(Lease {
                id: entry.id,
                io: entry.io,
            });
        }
    }

    /// Return a leased sandbox to the available pool.
    pub fn release(&self, lease: Lease) {
        let mut inner = self.lock_inner();
        inner.last_used_at.insert(lease.id, Instant::now());
        inner.available.push_back(SandboxEntry {
            id: lease.id,
            io: lease.io,
        });
        drop(inner);
        self.notify.notify_one();
    }

    async fn probe_alive(&self, entry: &mut SandboxEntry) -> bool {
        if entry.io.write_context("{\"probe\":\"is_alive\"}").await.is_err() {
            return false;
        }
        match entry.io.read_record(self.config.liveness_timeout).await {
            Ok(Some(record)) => matches!(record, crate::sandbox::SandboxRecord::AliveAck),
            _ => false,
        }
    }

    fn discard(&self, entry: &SandboxEntry) {
        let mut inner = self.lock_inner();
        inner.all_ids.remove(&entry.id);
        inner.last_used_at.remove(&entry.id);
        debug!(sandbox_id = %entry.id, "discarded dead sandbox");
    }

    async fn maybe_replace_to_floor(&self) {
        let below_min = self.lock_inner().all_ids.len() < self.config.min;
        if below_min {
            if let Ok(entry) = self.create_and_register().await {
                let mut inner = self.lock_inner();
                inner.last_used_at.insert(entry.id, Instant::now());
                inner.available.push_back(entry);
            }
        }
    }

    async fn inject_tenant_env(
        &self,
        entry: &mut SandboxEntry,
        tenant: &str,
        tokens: &TenantTokens,
    ) -> DispatchResult<()> {
        let context = serde_json::json!({
            "type": "set_env",
            "tenant": tenant,
            "api_token": tokens.api_token,
            "datafeed_token": tokens.datafeed_token,
        });
        entry.io.write_context(&context.to_string()).await
    }

    /// Stop and remove every sandbox. Idempotent.
    pub async fn stop_all(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained = {
            let mut inner = self.lock_inner();
            let drained: Vec<_> = inner.available.drain(..).collect();
            inner.all_ids.clear();
            inner.last_used_at.clear();
            drained
        };
        for mut entry in drained {
            let _ = entry.io.kill().await;
        }
        info!("container pool stopped");
    }

    /// Evict idle Free sandboxes beyond `min`, oldest-idle first. Never
    /// takes `|all|` below `min`.
    pub async fn evict_idle(&self) {
        let now = Instant::now();
        let mut to_kill = Vec::new();

        {
            let mut inner = self.lock_inner();

            let mut expired: Vec<(Uuid, Instant)> = inner
                .available
                .iter()
                .filter_map(|entry| {
                    inner.last_used_at.get(&entry.id).map(|t| (entry.id, *t))
                })
                .filter(|(_, last_used)| now.duration_since(*last_used) > self.config.idle_timeout)
                .collect();
            // Oldest-idle first: ascending by last_used_at, then cap at how
            // many can be removed without taking `|all|` below `min`.
            expired.sort_by_key(|&(_, last_used)| last_used);
            let allowed = inner.all_ids.len().saturating_sub(self.config.min);
            let evict_ids: std::collections::HashSet<Uuid> =
                expired.into_iter().take(allowed).map(|(id, _)| id).collect();

            // Partition `available` by id rather than by position: removing
            // by index while iterating shifts every later index, which
            // silently evicts the wrong entries.
            let mut kept = VecDeque::with_capacity(inner.available.len());
            while let Some(entry) = inner.available.pop_front() {
                if evict_ids.contains(&entry.id) {
                    inner.all_ids.remove(&entry.id);
                    inner.last_used_at.remove(&entry.id);
                    to_kill.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            inner.available = kept;
        }

        for mut entry in to_kill {
            debug!(sandbox_id = %entry.id, "evicting idle sandbox");
            let _ = entry.io.kill().await;
        }
    }

    /// Spawn the background idle-eviction ticker. Runs until `shutdown`
    /// fires.
    pub fn spawn_eviction_ticker(
        self: std::sync::Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let period = self.config.eviction_period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.evict_idle().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn total(&self) -> usize {
        self.lock_inner().all_ids.len()
    }

    pub fn available_count(&self) -> usize {
        self.lock_inner().available.len()
    }
}
