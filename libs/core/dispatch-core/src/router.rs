//! C4: tenant-aware consistent-hash routing onto shard queues, gated by
//! the per-datafeed circuit breaker.

use std::collections::BTreeMap;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::job::Job;
use crate::resilience::CircuitBreakerRegistry;

/// Number of points on the hash ring. Matches the partition count of the
/// upstream broker topic this platform consumes from, so shard locality
/// lines up with partition locality.
pub const PARTITION_COUNT: usize = 271;
/// Virtual nodes placed per shard, smoothing the distribution across
/// shards as shard count varies.
pub const REPLICATION_FACTOR: usize = 20;
/// Bounds how far a shard's share of vnodes may drift above a perfectly
/// even split across the ring. Governs ring construction, not shard-queue
/// depth (a bounded `mpsc` channel's used slots can never exceed its
/// capacity, so a load factor above 1.0 would make any depth-based check
/// unreachable).
pub const MAX_LOAD_FACTOR: f64 = 1.25;
/// Queue depth at or above this fraction of capacity is considered
/// saturated for monitoring/logging purposes only (admission still
/// blocks rather than drops; see `route`).
pub const QUEUE_SATURATION_RATIO: f64 = 0.8;

pub type ShardId = usize;

/// Consistent-hash ring over shard identifiers. Rebalancing on shard
/// count changes is not supported: the ring is built once at startup.
///
/// The same `hasher` instance is used both to place vnodes and to locate
/// keys later: `RandomState::new()` reseeds on every call, so a fresh
/// instance per `locate` would hash the same key to a different point
/// each time and break routing stickiness (P3).
struct HashRing {
    hasher: RandomState,
    ring: BTreeMap<u64, ShardId>,
}

impl HashRing {
    fn new(shard_count: usize) -> Self {
        let hasher = RandomState::new();
        let mut ring = BTreeMap::new();
        for shard in 0..shard_count {
            for vnode in 0..REPLICATION_FACTOR {
                let point = hasher.hash_one((shard, vnode));
                ring.insert(point, shard);
            }
        }
        Self { hasher, ring }
    }

    fn locate(&self, key: &str) -> ShardId {
        let point = self.hasher.hash_one(key);
        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, shard)| *shard)
            .expect("ring is never empty for shard_count > 0")
    }
}

/// A single shard's inbound queue. Bounded: a full queue applies
/// backpressure to the caller of `route` rather than dropping work.
pub struct ShardQueue {
    pub id: ShardId,
    sender: mpsc::Sender<Job>,
}

impl ShardQueue {
    pub fn capacity(&self) -> usize {
        self.sender.capacity()
    }

    pub fn max_capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    /// `true` once queued depth reaches `QUEUE_SATURATION_RATIO` of
    /// capacity. A bounded channel's used slots never exceed its capacity,
    /// so this compares against a soft ceiling below 100%, not above it.
    pub fn is_saturated(&self) -> bool {
        let depth = self.max_capacity() - self.capacity();
        (depth as f64) >= (self.max_capacity() as f64) * QUEUE_SATURATION_RATIO
    }
}

pub struct TenantRouter {
    ring: HashRing,
    queues: Vec<ShardQueue>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl TenantRouter {
    /// Build a router with `shard_count` shards, each queue bounded to
    /// `queue_capacity`. Returns the router plus the receiver half of
    /// every shard queue, for the worker pool to drain.
    pub fn new(
        shard_count: usize,
        queue_capacity: usize,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> (Self, Vec<mpsc::Receiver<Job>>) {
        let mut queues = Vec::with_capacity(shard_count);
        let mut receivers = Vec::with_capacity(shard_count);
        for id in 0..shard_count {
            let (tx, rx) = mpsc::channel(queue_capacity);
            queues.push(ShardQueue { id, sender: tx });
            receivers.push(rx);
        }

        (
            Self {
                ring: HashRing::new(shard_count),
                queues,
                breakers,
            },
            receivers,
        )
    }

    pub fn shard_count(&self) -> usize {
        self.queues.len()
    }

    fn shard_for(&self, job: &Job) -> ShardId {
        self.ring.locate(&job.routing_key())
    }

    /// Route a job: admit through the breaker, then enqueue onto the
    /// shard located by consistent hashing. Blocks the caller if the
    /// target shard's queue is full; never drops a job silently.
    pub async fn route(&self, job: Job) {
        if !self.breakers.admit(&job.datafeed_id) {
            warn!(
                datafeed_id = %job.datafeed_id,
                tenant = %job.tenant,
                "circuit open, dropping job"
            );
            metrics::counter!("dispatch_router_dropped_total").increment(1);
            return;
        }

        let shard_id = self.shard_for(&job);
        let shard = &self.queues[shard_id];
        if shard.is_saturated() {
            debug!(shard_id, job_id = %job.job_id, "shard saturated, applying backpressure");
        }
        if shard.sender.send(job).await.is_err() {
            warn!(shard_id, "shard queue closed, job could not be routed");
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobOptions, JobStatus};
    use crate::resilience::CircuitBreakerConfig;
    use chrono::Utc;

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

    #[test]
    fn same_routing_key_always_lands_on_same_shard() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let (router, _rx) = TenantRouter::new(8, 16, breakers);
        let j1 = job("acme", "df-1");
        let j2 = job("acme", "df-1");
        assert_eq!(router.shard_for(&j1), router.shard_for(&j2));
    }

    #[tokio::test]
    async fn open_circuit_drops_job_without_enqueueing() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: std::time::Duration::from_secs(60),
        }));
        breakers.report_failure("df-down");
        let (router, mut rx) = TenantRouter::new(4, 4, breakers);

        router.route(job("acme", "df-down")).await;
        tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv())
            .await
            .expect_err("nothing should have been enqueued");
    }

    #[tokio::test]
    async fn admitted_job_reaches_its_shard_receiver() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let (router, mut rxs) = TenantRouter::new(4, 4, breakers);
        let j = job("acme", "df-1");
        let shard_id = router.shard_for(&j);
        router.route(j.clone()).await;
        let received = rxs[shard_id].recv().await.expect("job delivered");
        assert_eq!(received.job_id, j.job_id);
    }

    #[tokio::test]
    async fn shard_queue_reports_saturated_past_soft_ceiling() {
        let (sender, _rx) = mpsc::channel::<Job>(10);
        let shard = ShardQueue { id: 0, sender };
        assert!(!shard.is_saturated());

        for _ in 0..8 {
            shard.sender.send(job("acme", "df-1")).await.unwrap();
        }
        assert!(shard.is_saturated());
    }
}
