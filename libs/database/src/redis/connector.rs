use redis::aio::ConnectionManager;
use redis::Client;
use tracing::info;

use super::RedisConfig;
use crate::common::{retry, retry_with_backoff, RetryConfig};

/// Connect to Redis and return a ConnectionManager.
///
/// The ConnectionManager automatically handles connection failures and reconnections.
pub async fn connect(url: &str) -> redis::RedisResult<ConnectionManager> {
    info!("attempting to connect to redis at {}", url);

    let client = Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!("successfully connected to redis");
    Ok(manager)
}

/// Connect using a RedisConfig.
pub async fn connect_from_config(config: RedisConfig) -> redis::RedisResult<ConnectionManager> {
    connect(&config.url).await
}

/// Connect to Redis with automatic retry on failure.
pub async fn connect_with_retry(
    url: &str,
    retry_config: Option<RetryConfig>,
) -> redis::RedisResult<ConnectionManager> {
    let url_owned = url.to_string();

    match retry_config {
        Some(config) => retry_with_backoff(|| connect(&url_owned), config).await,
        None => retry(|| connect(&url_owned)).await,
    }
}

/// Connect from config with automatic retry on failure.
pub async fn connect_from_config_with_retry(
    config: RedisConfig,
    retry_config: Option<RetryConfig>,
) -> redis::RedisResult<ConnectionManager> {
    connect_with_retry(&config.url, retry_config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // requires a running Redis
    async fn test_connect() {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let result = connect(&redis_url).await;
        assert!(result.is_ok());
    }
}
