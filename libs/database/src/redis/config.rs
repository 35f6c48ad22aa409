use core_config::{ConfigError, FromEnv};

/// Redis connection settings, used both for the broker transport and the
/// token store / DLQ storage.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
    pub database: Option<u8>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: None,
            username: None,
            password: None,
        }
    }

    pub fn with_auth(
        url: impl Into<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            url: url.into(),
            database: None,
            username,
            password,
        }
    }

    pub fn with_database(url: impl Into<String>, database: u8) -> Self {
        Self {
            url: url.into(),
            database: Some(database),
            username: None,
            password: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            database: None,
            username: None,
            password: None,
        }
    }
}

impl FromEnv for RedisConfig {
    /// REDIS_URL (falls back to REDIS_HOST) is required; REDIS_DATABASE,
    /// REDIS_USERNAME, REDIS_PASSWORD are optional.
    fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("REDIS_URL")
            .or_else(|_| std::env::var("REDIS_HOST"))
            .map_err(|_| ConfigError::MissingEnvVar("REDIS_URL or REDIS_HOST".to_string()))?;

        let database = if let Ok(db_str) = std::env::var("REDIS_DATABASE") {
            Some(db_str.parse().map_err(|e| ConfigError::ParseError {
                key: "REDIS_DATABASE".to_string(),
                details: format!("{}", e),
            })?)
        } else {
            None
        };

        let username = std::env::var("REDIS_USERNAME").ok();
        let password = std::env::var("REDIS_PASSWORD").ok();

        Ok(Self {
            url,
            database,
            username,
            password,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_new() {
        let config = RedisConfig::new("redis://localhost:6379");
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.database, None);
    }

    #[test]
    fn test_redis_config_with_database() {
        let config = RedisConfig::with_database("redis://localhost:6379", 2);
        assert_eq!(config.database, Some(2));
    }

    #[test]
    fn test_redis_config_default() {
        assert_eq!(RedisConfig::default().url, "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_redis_config_from_env_with_redis_url() {
        temp_env::with_var("REDIS_URL", Some("redis://localhost:6379"), || {
            let config = RedisConfig::from_env().unwrap();
            assert_eq!(config.url, "redis://localhost:6379");
        });
    }

    #[test]
    fn test_redis_config_from_env_with_redis_host_fallback() {
        temp_env::with_vars(
            [
                ("REDIS_URL", None::<&str>),
                ("REDIS_HOST", Some("redis://prod:6379")),
            ],
            || {
                let config = RedisConfig::from_env().unwrap();
                assert_eq!(config.url, "redis://prod:6379");
            },
        );
    }

    #[test]
    fn test_redis_config_from_env_missing() {
        temp_env::with_vars(
            [("REDIS_URL", None::<&str>), ("REDIS_HOST", None::<&str>)],
            || {
                let err = RedisConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("REDIS"));
            },
        );
    }

    #[test]
    fn test_redis_config_from_env_invalid_database() {
        temp_env::with_vars(
            [
                ("REDIS_URL", Some("redis://localhost:6379")),
                ("REDIS_DATABASE", Some("invalid")),
            ],
            || {
                let err = RedisConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("REDIS_DATABASE"));
            },
        );
    }
}
