//! Structured logging setup
//!
//! Services log through `tracing`. Production deployments emit JSON lines,
//! local runs use the human-readable formatter.

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Invalid log filter '{0}'")]
    InvalidFilter(String),

    #[error("Failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "pretty" | "text" => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `recommdo_engine=debug,sqlx=warn`
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogConfig {
    /// - `RUST_LOG`: filter directive (default: the given level)
    /// - `RECOMMDO_LOG_FORMAT`: `json` (default) or `pretty`
    pub fn from_env(default_level: &str) -> Self {
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
        let format = std::env::var("RECOMMDO_LOG_FORMAT")
            .map(|v| LogFormat::parse(&v))
            .unwrap_or(LogFormat::Json);

        Self { filter, format }
    }
}

/// Install the global tracing subscriber. Call once at startup.
pub fn init_logging(config: &LogConfig) -> Result<(), ObservabilityError> {
    let env_filter = EnvFilter::try_new(&config.filter)
        .map_err(|_| ObservabilityError::InvalidFilter(config.filter.clone()))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_target(true))
            .try_init(),
    };

    result.map_err(|e| ObservabilityError::SubscriberInit(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("TEXT"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Json);
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config = LogConfig {
            filter: "recommdo=verbose".to_string(),
            format: LogFormat::Pretty,
        };
        assert!(matches!(
            init_logging(&config),
            Err(ObservabilityError::InvalidFilter(_))
        ));
    }
}
