//! Core of the multi-tenant datafeed execution platform: tenant token
//! storage (C1), warm sandbox pool (C2), per-datafeed circuit breakers
//! (C3), tenant-aware routing (C4), sharded worker pools (C5), job
//! pre/postprocessing (C6), broker consumption (C7), rate-limited
//! upload (C8), output batching (C9) and the DLQ consumer (C10).
//!
//! `apps/datafeed-worker` wires these into a running process; this crate
//! only provides the components and their unit tests.

pub mod alert;
pub mod broker;
pub mod broker_consumer;
pub mod container_pool;
pub mod dispatcher;
pub mod dlq;
pub mod dlq_consumer;
pub mod error;
pub mod job;
pub mod job_handler;
pub mod resilience;
pub mod router;
pub mod sandbox;
pub mod token_store;
pub mod uploader;
pub mod worker_pool;

pub use alert::Alert;
pub use broker::{Broker, BrokerRecord, RedisStreamsBroker, RedisStreamsBrokerConfig};
pub use broker_consumer::{BrokerConsumer, BrokerConsumerConfig};
pub use container_pool::{ContainerPool, ContainerPoolConfig, Lease, SandboxFactory};
pub use dispatcher::{Output, OutputBatch, OutputDispatcher, OutputDispatcherConfig};
pub use dlq::{DlqWriter, FailedRecord};
pub use dlq_consumer::{DlqConsumer, DlqConsumerConfig};
pub use error::{DispatchError, DispatchResult, ErrorCategory, RetryStrategy};
pub use job::{Job, JobOptions, JobStatus, KafkaMessage, TenantTokens};
pub use job_handler::{JobHandler, JobOutcome};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, RateLimiter};
pub use router::{ShardId, ShardQueue, TenantRouter};
pub use sandbox::{FramedReader, PipeSandboxIo, SandboxIo, SandboxRecord};
pub use token_store::TokenStore;
pub use uploader::{
    BulkIngestionResult, HttpIngestionClient, IngestionClient, IngestionResponse, IngestionResponseBody,
    RateLimitedUploader, UploadFailure, UploaderConfig,
};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
