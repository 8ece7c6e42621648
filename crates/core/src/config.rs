//! Configuration loading for recommdo services
//!
//! Every setting is read from environment variables with the `RECOMMDO_`
//! prefix (a few fall back to the conventional unprefixed names such as
//! `DATABASE_URL`). Values are parsed eagerly and validated before any
//! connection is opened.
//!
//! Override hierarchy: defaults < .env < environment
//!
//! # Example
//!
//! ```no_run
//! use recommdo_core::config::{load_dotenv, ConfigLoader, DatabaseConfig, PipelineConfig};
//!
//! # fn example() -> Result<(), recommdo_core::CoreError> {
//! load_dotenv();
//!
//! let db_config = DatabaseConfig::from_env()?;
//! db_config.validate()?;
//!
//! let pipeline = PipelineConfig::from_env()?;
//! pipeline.validate()?;
//! # Ok(())
//! # }
//! ```

use crate::error::CoreError;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Configuration loader trait
///
/// Provides standardized methods for loading and validating configuration from
/// environment variables.
pub trait ConfigLoader: Sized {
    /// Load configuration from environment variables, using defaults for
    /// missing optional values.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` if a required variable is missing or a
    /// value cannot be parsed.
    fn from_env() -> Result<Self, CoreError>;

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` if any validation check fails.
    fn validate(&self) -> Result<(), CoreError>;
}

/// Database configuration
///
/// # Environment Variables
///
/// - `RECOMMDO_DATABASE_URL` (required, falls back to `DATABASE_URL`)
/// - `RECOMMDO_DATABASE_MAX_CONNECTIONS` (default: 10)
/// - `RECOMMDO_DATABASE_MIN_CONNECTIONS` (default: 2)
/// - `RECOMMDO_DATABASE_ACQUIRE_TIMEOUT` seconds (default: 30)
/// - `RECOMMDO_DATABASE_IDLE_TIMEOUT` seconds (default: 600)
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    pub min_connections: u32,
    /// Time to wait for a free connection
    pub acquire_timeout: Duration,
    /// Idle connection timeout duration
    pub idle_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/recommdo".to_string(),
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl ConfigLoader for DatabaseConfig {
    fn from_env() -> Result<Self, CoreError> {
        let url = std::env::var("RECOMMDO_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| CoreError::ConfigurationError {
                message: "DATABASE_URL or RECOMMDO_DATABASE_URL must be set".to_string(),
                key: Some("RECOMMDO_DATABASE_URL".to_string()),
            })?;

        let defaults = DatabaseConfig::default();

        let max_connections =
            parse_env_var("RECOMMDO_DATABASE_MAX_CONNECTIONS", defaults.max_connections)?;
        let min_connections =
            parse_env_var("RECOMMDO_DATABASE_MIN_CONNECTIONS", defaults.min_connections)?;
        let acquire_timeout_secs = parse_env_var("RECOMMDO_DATABASE_ACQUIRE_TIMEOUT", 30u64)?;
        let idle_timeout_secs = parse_env_var("RECOMMDO_DATABASE_IDLE_TIMEOUT", 600u64)?;

        Ok(Self {
            url,
            max_connections,
            min_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
            idle_timeout: Duration::from_secs(idle_timeout_secs),
        })
    }

    fn validate(&self) -> Result<(), CoreError> {
        Url::parse(&self.url).map_err(|e| CoreError::ConfigurationError {
            message: format!("Invalid DATABASE_URL: {}", e),
            key: Some("RECOMMDO_DATABASE_URL".to_string()),
        })?;

        if self.max_connections == 0 {
            return Err(CoreError::ConfigurationError {
                message: "max_connections must be greater than 0".to_string(),
                key: Some("RECOMMDO_DATABASE_MAX_CONNECTIONS".to_string()),
            });
        }

        if self.min_connections > self.max_connections {
            return Err(CoreError::ConfigurationError {
                message: format!(
                    "min_connections ({}) cannot exceed max_connections ({})",
                    self.min_connections, self.max_connections
                ),
                key: Some("RECOMMDO_DATABASE_MIN_CONNECTIONS".to_string()),
            });
        }

        if self.acquire_timeout.as_secs() == 0 {
            return Err(CoreError::ConfigurationError {
                message: "acquire_timeout must be greater than 0 seconds".to_string(),
                key: Some("RECOMMDO_DATABASE_ACQUIRE_TIMEOUT".to_string()),
            });
        }

        Ok(())
    }
}

/// Redis configuration for the job queue
///
/// # Environment Variables
///
/// - `RECOMMDO_REDIS_URL` (required, falls back to `REDIS_URL`)
/// - `RECOMMDO_QUEUE_PREFIX` (default: "recommdo:jobs")
/// - `RECOMMDO_QUEUE_CONSUMER_GROUP` (default: "recommdo-workers")
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Prefix of every stream key used by the job queue
    pub queue_prefix: String,
    /// Consumer group shared by all workers
    pub consumer_group: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
            queue_prefix: "recommdo:jobs".to_string(),
            consumer_group: "recommdo-workers".to_string(),
        }
    }
}

impl ConfigLoader for RedisConfig {
    fn from_env() -> Result<Self, CoreError> {
        let url = std::env::var("RECOMMDO_REDIS_URL")
            .or_else(|_| std::env::var("REDIS_URL"))
            .map_err(|_| CoreError::ConfigurationError {
                message: "REDIS_URL or RECOMMDO_REDIS_URL must be set".to_string(),
                key: Some("RECOMMDO_REDIS_URL".to_string()),
            })?;

        let defaults = RedisConfig::default();

        Ok(Self {
            url,
            queue_prefix: std::env::var("RECOMMDO_QUEUE_PREFIX").unwrap_or(defaults.queue_prefix),
            consumer_group: std::env::var("RECOMMDO_QUEUE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
        })
    }

    fn validate(&self) -> Result<(), CoreError> {
        Url::parse(&self.url).map_err(|e| CoreError::ConfigurationError {
            message: format!("Invalid REDIS_URL: {}", e),
            key: Some("RECOMMDO_REDIS_URL".to_string()),
        })?;

        if self.queue_prefix.trim().is_empty() {
            return Err(CoreError::ConfigurationError {
                message: "queue_prefix must not be empty".to_string(),
                key: Some("RECOMMDO_QUEUE_PREFIX".to_string()),
            });
        }

        Ok(())
    }
}

/// Service configuration for the worker process
///
/// # Environment Variables
///
/// - `RECOMMDO_SERVICE_HOST` (default: "0.0.0.0")
/// - `RECOMMDO_SERVICE_PORT` (default: 8090)
/// - `RECOMMDO_SERVICE_LOG_LEVEL` (default: "info", falls back to `RUST_LOG`)
/// - `RECOMMDO_WORKER_NAME` (default: "worker-<pid>")
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Health endpoint bind host
    pub host: String,
    /// Health endpoint bind port
    pub port: u16,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Consumer name of this worker inside the queue's consumer group
    pub worker_name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            log_level: "info".to_string(),
            worker_name: format!("worker-{}", std::process::id()),
        }
    }
}

impl ConfigLoader for ServiceConfig {
    fn from_env() -> Result<Self, CoreError> {
        let defaults = ServiceConfig::default();

        let host = std::env::var("RECOMMDO_SERVICE_HOST").unwrap_or(defaults.host);
        let port = parse_env_var("RECOMMDO_SERVICE_PORT", defaults.port)?;
        let log_level = std::env::var("RECOMMDO_SERVICE_LOG_LEVEL")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(defaults.log_level);
        let worker_name = std::env::var("RECOMMDO_WORKER_NAME").unwrap_or(defaults.worker_name);

        Ok(Self {
            host,
            port,
            log_level,
            worker_name,
        })
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.port == 0 {
            return Err(CoreError::ConfigurationError {
                message: "port must be greater than 0".to_string(),
                key: Some("RECOMMDO_SERVICE_PORT".to_string()),
            });
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(CoreError::ConfigurationError {
                message: format!(
                    "Invalid log_level '{}'. Must be one of: {}",
                    self.log_level,
                    valid_log_levels.join(", ")
                ),
                key: Some("RECOMMDO_SERVICE_LOG_LEVEL".to_string()),
            });
        }

        Ok(())
    }
}

/// Recommendation pipeline tuning
///
/// # Environment Variables
///
/// - `RECOMMDO_ALS_FACTORS` (default: 64)
/// - `RECOMMDO_ALS_REGULARIZATION` (default: 0.01)
/// - `RECOMMDO_ALS_ITERATIONS` (default: 15)
/// - `RECOMMDO_ALS_ALPHA` (default: 40.0)
/// - `RECOMMDO_ALS_SEED` (default: 42)
/// - `RECOMMDO_TOP_N` (default: 10)
/// - `RECOMMDO_MAX_SHARDS` (default: 8)
/// - `RECOMMDO_CHUNK_SIZE` rows per ingestion chunk (default: 1000000)
/// - `RECOMMDO_MAX_ATTEMPTS` deliveries per job (default: 3)
/// - `RECOMMDO_RECLAIM_IDLE` seconds before a pending job is redelivered (default: 300)
/// - `RECOMMDO_UPLOAD_ROOT` directory holding project files (default: "./uploads")
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub als_factors: usize,
    pub als_regularization: f32,
    pub als_iterations: usize,
    pub als_alpha: f32,
    pub als_seed: u64,
    pub top_n: usize,
    pub max_shards: usize,
    pub chunk_size: usize,
    pub max_attempts: u32,
    pub reclaim_idle: Duration,
    pub upload_root: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            als_factors: 64,
            als_regularization: 0.01,
            als_iterations: 15,
            als_alpha: 40.0,
            als_seed: 42,
            top_n: 10,
            max_shards: 8,
            chunk_size: 1_000_000,
            max_attempts: 3,
            reclaim_idle: Duration::from_secs(300),
            upload_root: PathBuf::from("./uploads"),
        }
    }
}

impl ConfigLoader for PipelineConfig {
    fn from_env() -> Result<Self, CoreError> {
        let defaults = PipelineConfig::default();

        let reclaim_idle_secs =
            parse_env_var("RECOMMDO_RECLAIM_IDLE", defaults.reclaim_idle.as_secs())?;

        Ok(Self {
            als_factors: parse_env_var("RECOMMDO_ALS_FACTORS", defaults.als_factors)?,
            als_regularization: parse_env_var(
                "RECOMMDO_ALS_REGULARIZATION",
                defaults.als_regularization,
            )?,
            als_iterations: parse_env_var("RECOMMDO_ALS_ITERATIONS", defaults.als_iterations)?,
            als_alpha: parse_env_var("RECOMMDO_ALS_ALPHA", defaults.als_alpha)?,
            als_seed: parse_env_var("RECOMMDO_ALS_SEED", defaults.als_seed)?,
            top_n: parse_env_var("RECOMMDO_TOP_N", defaults.top_n)?,
            max_shards: parse_env_var("RECOMMDO_MAX_SHARDS", defaults.max_shards)?,
            chunk_size: parse_env_var("RECOMMDO_CHUNK_SIZE", defaults.chunk_size)?,
            max_attempts: parse_env_var("RECOMMDO_MAX_ATTEMPTS", defaults.max_attempts)?,
            reclaim_idle: Duration::from_secs(reclaim_idle_secs),
            upload_root: std::env::var("RECOMMDO_UPLOAD_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_root),
        })
    }

    fn validate(&self) -> Result<(), CoreError> {
        let positive = [
            (self.als_factors, "RECOMMDO_ALS_FACTORS"),
            (self.als_iterations, "RECOMMDO_ALS_ITERATIONS"),
            (self.top_n, "RECOMMDO_TOP_N"),
            (self.max_shards, "RECOMMDO_MAX_SHARDS"),
            (self.chunk_size, "RECOMMDO_CHUNK_SIZE"),
        ];
        for (value, key) in positive {
            if value == 0 {
                return Err(CoreError::ConfigurationError {
                    message: format!("{} must be greater than 0", key),
                    key: Some(key.to_string()),
                });
            }
        }

        if !(self.als_regularization > 0.0) {
            return Err(CoreError::ConfigurationError {
                message: "regularization must be a positive number".to_string(),
                key: Some("RECOMMDO_ALS_REGULARIZATION".to_string()),
            });
        }

        if !(self.als_alpha > 0.0) {
            return Err(CoreError::ConfigurationError {
                message: "alpha must be a positive number".to_string(),
                key: Some("RECOMMDO_ALS_ALPHA".to_string()),
            });
        }

        if self.max_attempts == 0 {
            return Err(CoreError::ConfigurationError {
                message: "max_attempts must be at least 1".to_string(),
                key: Some("RECOMMDO_MAX_ATTEMPTS".to_string()),
            });
        }

        Ok(())
    }
}

/// Parse an environment variable, falling back to `default` when unset
///
/// # Errors
///
/// Returns a `ConfigurationError` if the value cannot be parsed
fn parse_env_var<T>(key: &str, default: T) -> Result<T, CoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(key)
        .ok()
        .map(|v| {
            v.parse::<T>().map_err(|e| CoreError::ConfigurationError {
                message: format!("Failed to parse {}: {}", key, e),
                key: Some(key.to_string()),
            })
        })
        .unwrap_or(Ok(default))
}

/// Load .env file if present
pub fn load_dotenv() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_database_config_default() {
        let config = DatabaseConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_database_config_validation_invalid_url() {
        let config = DatabaseConfig {
            url: "not-a-valid-url".to_string(),
            ..Default::default()
        };

        let result = config.validate();
        assert!(matches!(
            result.unwrap_err(),
            CoreError::ConfigurationError { .. }
        ));
    }

    #[test]
    fn test_database_config_validation_min_exceeds_max() {
        let config = DatabaseConfig {
            min_connections: 30,
            max_connections: 20,
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redis_config_validation() {
        assert!(RedisConfig::default().validate().is_ok());

        let config = RedisConfig {
            queue_prefix: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_service_config_validation_invalid_log_level() {
        let config = ServiceConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };

        match config.validate().unwrap_err() {
            CoreError::ConfigurationError { message, .. } => {
                assert!(message.contains("Invalid log_level"));
            }
            other => panic!("Expected ConfigurationError, got {other:?}"),
        }
    }

    #[test]
    fn test_pipeline_config_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_shards, 8);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.top_n, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pipeline_config_rejects_zero_factors() {
        let config = PipelineConfig {
            als_factors: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pipeline_config_rejects_zero_regularization() {
        let config = PipelineConfig {
            als_regularization: 0.0,
            ..Default::default()
        };
        match config.validate() {
            Err(CoreError::ConfigurationError { key, .. }) => {
                assert_eq!(key.as_deref(), Some("RECOMMDO_ALS_REGULARIZATION"));
            }
            other => panic!("expected a configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_pipeline_config_from_env() {
        env::set_var("RECOMMDO_ALS_ITERATIONS", "7");
        env::set_var("RECOMMDO_TOP_N", "25");

        let config = PipelineConfig::from_env().unwrap();
        assert_eq!(config.als_iterations, 7);
        assert_eq!(config.top_n, 25);

        env::remove_var("RECOMMDO_ALS_ITERATIONS");
        env::remove_var("RECOMMDO_TOP_N");
    }

    #[test]
    fn test_parse_env_var_invalid_value() {
        env::set_var("RECOMMDO_TEST_INVALID_VAR", "not-a-number");
        let result: Result<u32, _> = parse_env_var("RECOMMDO_TEST_INVALID_VAR", 42);
        assert!(result.is_err());
        env::remove_var("RECOMMDO_TEST_INVALID_VAR");
    }

    #[test]
    fn test_parse_env_var_with_default() {
        let result: u32 = parse_env_var("RECOMMDO_NON_EXISTENT_VAR", 42).unwrap();
        assert_eq!(result, 42);
    }
}
