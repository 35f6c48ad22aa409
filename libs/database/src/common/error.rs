/// Unified database error type.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    Generic(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;
