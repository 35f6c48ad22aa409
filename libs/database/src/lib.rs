//! Database connectors shared by the datafeed platform.
//!
//! Trimmed to the Redis connector: the broker transport, the tenant
//! token store, and the DLQ are all Redis-backed in this deployment.
//! Postgres/Mongo/Cassandra connectors are not needed here.

pub mod common;
pub mod redis;

pub use common::{DatabaseError, DatabaseResult};
