//! Server configuration.
//!
//! A plain struct with defaults, environment loading, validation, and
//! builder methods. The Redis URL is resolved through one level of
//! environment indirection: `REDIS_PROVIDER` names the variable that holds
//! the URL (defaulting to `REDIS_URL`), which lets deployments point at a
//! platform-assigned variable without code changes.

use std::time::Duration;

use thiserror::Error;

/// Fallback Redis URL when no environment variable provides one.
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Variable naming the variable that holds the Redis URL.
const REDIS_PROVIDER_VAR: &str = "REDIS_PROVIDER";

/// Default variable holding the Redis URL.
const DEFAULT_REDIS_URL_VAR: &str = "REDIS_URL";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A named environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an unparsable value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the job server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of processors to run.
    pub concurrency: usize,
    /// Queues to fetch from, highest priority first.
    pub queues: Vec<String>,
    /// Blocking fetch timeout; also the shutdown observation latency.
    pub fetch_timeout: Duration,
    /// How long `run` waits for processors to finish after a stop request.
    pub shutdown_timeout: Duration,
    /// Redis connection URL.
    pub redis_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: vec!["default".to_string()],
            fetch_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(25),
            redis_url: DEFAULT_REDIS_URL.to_string(),
        }
    }
}

impl ServerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `JOBFORGE_CONCURRENCY`: number of processors (default: 10)
    /// - `JOBFORGE_QUEUES`: comma-separated queue names in priority order
    /// - `JOBFORGE_FETCH_TIMEOUT_SECS`: blocking fetch timeout (default: 2)
    /// - `JOBFORGE_SHUTDOWN_TIMEOUT_SECS`: quiesce deadline (default: 25)
    /// - `REDIS_PROVIDER`: name of the variable holding the Redis URL
    /// - `REDIS_URL`: Redis URL when no provider is named
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a value fails to parse, the named
    /// provider variable is unset, or validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("JOBFORGE_CONCURRENCY") {
            config.concurrency = parse_env_value(&val, "JOBFORGE_CONCURRENCY")?;
        }

        if let Ok(val) = std::env::var("JOBFORGE_QUEUES") {
            config.queues = val
                .split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect();
        }

        if let Ok(val) = std::env::var("JOBFORGE_FETCH_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "JOBFORGE_FETCH_TIMEOUT_SECS")?;
            config.fetch_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("JOBFORGE_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "JOBFORGE_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        config.redis_url = resolve_redis_url(|key| std::env::var(key).ok())?;

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "concurrency must be greater than 0".to_string(),
            ));
        }

        if self.queues.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one queue must be configured".to_string(),
            ));
        }

        if self.queues.iter().any(|name| name.is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "queue names cannot be empty".to_string(),
            ));
        }

        if self.fetch_timeout.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "fetch_timeout must be at least one second".to_string(),
            ));
        }

        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the processor count.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Builder method to set the queue list, highest priority first.
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    /// Builder method to set the blocking fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Builder method to set the shutdown deadline.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }
}

/// Resolves the Redis URL through the provider indirection.
///
/// `lookup` abstracts the environment so the logic is testable without
/// mutating process state.
fn resolve_redis_url<F>(lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(REDIS_PROVIDER_VAR) {
        Some(provider) => {
            lookup(&provider).ok_or_else(|| ConfigError::MissingEnvVar(provider.clone()))
        }
        None => Ok(lookup(DEFAULT_REDIS_URL_VAR)
            .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string())),
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.concurrency, 10);
        assert_eq!(config.queues, vec!["default"]);
        assert_eq!(config.fetch_timeout, Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(25));
        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ServerConfig::new()
            .with_concurrency(4)
            .with_queues(vec!["critical".to_string(), "default".to_string()])
            .with_fetch_timeout(Duration::from_secs(5))
            .with_shutdown_timeout(Duration::from_secs(60))
            .with_redis_url("redis://cache:6380");

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.queues.len(), 2);
        assert_eq!(config.fetch_timeout, Duration::from_secs(5));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(config.redis_url, "redis://cache:6380");
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let config = ServerConfig::default().with_concurrency(0);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("concurrency"));
    }

    #[test]
    fn test_validation_rejects_empty_queues() {
        let config = ServerConfig::default().with_queues(Vec::new());
        assert!(config.validate().is_err());

        let config = ServerConfig::default().with_queues(vec![String::new()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_fetch_timeout() {
        let config = ServerConfig::default().with_fetch_timeout(Duration::from_secs(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redis_url_defaults_without_env() {
        let url = resolve_redis_url(env(&[])).expect("resolve");
        assert_eq!(url, DEFAULT_REDIS_URL);
    }

    #[test]
    fn test_redis_url_reads_default_var() {
        let url =
            resolve_redis_url(env(&[("REDIS_URL", "redis://direct:6379")])).expect("resolve");
        assert_eq!(url, "redis://direct:6379");
    }

    #[test]
    fn test_redis_url_provider_indirection() {
        let url = resolve_redis_url(env(&[
            ("REDIS_PROVIDER", "REDISTOGO_URL"),
            ("REDISTOGO_URL", "redis://togo:6379"),
            ("REDIS_URL", "redis://ignored:6379"),
        ]))
        .expect("resolve");
        assert_eq!(url, "redis://togo:6379");
    }

    #[test]
    fn test_redis_url_provider_must_be_set() {
        let result = resolve_redis_url(env(&[("REDIS_PROVIDER", "UNSET_VAR")]));
        match result {
            Err(ConfigError::MissingEnvVar(name)) => assert_eq!(name, "UNSET_VAR"),
            other => panic!("expected MissingEnvVar, got {other:?}"),
        }
    }
}
