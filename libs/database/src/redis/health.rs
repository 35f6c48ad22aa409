use redis::aio::ConnectionManager;
use tracing::debug;

use crate::common::DatabaseError;

/// Run a `PING` against Redis. Used for readiness probes.
pub async fn check_health(conn: &mut ConnectionManager) -> Result<(), DatabaseError> {
    debug!("running redis health check");

    let response: String = redis::cmd("PING")
        .query_async(conn)
        .await
        .map_err(|e| DatabaseError::HealthCheckFailed(format!("redis health check failed: {}", e)))?;

    if response != "PONG" {
        return Err(DatabaseError::HealthCheckFailed(format!(
            "redis PING returned unexpected response: {}",
            response
        )));
    }

    debug!("redis health check passed");
    Ok(())
}

/// Health check result with response time, for monitoring surfaces.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: Option<String>,
    pub response_time_ms: u64,
}

impl HealthStatus {
    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            healthy: true,
            message: None,
            response_time_ms,
        }
    }

    pub fn unhealthy(message: String, response_time_ms: u64) -> Self {
        Self {
            healthy: false,
            message: Some(message),
            response_time_ms,
        }
    }
}

pub async fn check_health_detailed(conn: &mut ConnectionManager) -> HealthStatus {
    let start = std::time::Instant::now();

    match check_health(conn).await {
        Ok(_) => HealthStatus::healthy(start.elapsed().as_millis() as u64),
        Err(e) => HealthStatus::unhealthy(e.to_string(), start.elapsed().as_millis() as u64),
    }
}
