//! Configuration loader
//!
//! Loads configuration from YAML files, environment variables, or programmatic API.
//! Priority: environment variables > provided config > defaults

use std::env;
use std::str::FromStr;

use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::config::types::InfiniteTracingConfig;
use crate::error::ConfigError;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from YAML file
    pub fn from_yaml(path: impl AsRef<std::path::Path>) -> Result<InfiniteTracingConfig, ConfigError> {
        let path = path.as_ref();
        info!(
            config_path = %path.display(),
            "Loading configuration from YAML file"
        );

        let content = std::fs::read_to_string(path).map_err(|e| {
            warn!(
                config_path = %path.display(),
                error = %e,
                "Failed to read configuration file"
            );
            ConfigError::Parse(format!("Failed to read config file: {}", e))
        })?;

        debug!(
            config_path = %path.display(),
            file_size_bytes = content.len(),
            "Read configuration file"
        );

        let mut config: InfiniteTracingConfig = serde_yaml::from_str(&content).map_err(|e| {
            warn!(
                config_path = %path.display(),
                error = %e,
                "Failed to parse YAML configuration"
            );
            ConfigError::Parse(format!("Failed to parse YAML: {}", e))
        })?;

        Self::apply_env_overrides(&mut config);

        config.validate().map_err(|e| {
            warn!(
                config_path = %path.display(),
                error = %e,
                "Configuration validation failed"
            );
            e
        })?;

        info!(
            config_path = %path.display(),
            host = %config.host,
            port = config.port,
            use_batching = config.use_batching,
            "Configuration loaded and validated successfully"
        );

        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<InfiniteTracingConfig, ConfigError> {
        info!("Loading configuration from environment variables");
        Self::load(None)
    }

    /// Load configuration with priority: environment variables > provided config > defaults
    pub fn load(provided: Option<InfiniteTracingConfig>) -> Result<InfiniteTracingConfig, ConfigError> {
        let mut config = provided.unwrap_or_default();

        Self::apply_env_overrides(&mut config);

        config.validate().map_err(|e| {
            warn!(error = %e, "Configuration validation failed");
            e
        })?;

        info!(
            host = %config.host,
            port = config.port,
            use_plaintext = config.use_plaintext,
            use_batching = config.use_batching,
            max_queue_size = config.max_queue_size,
            "Configuration loaded and validated successfully"
        );

        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(config: &mut InfiniteTracingConfig) {
        if let Ok(host) = env::var("INFINITE_TRACING_HOST") {
            debug!(env_var = "INFINITE_TRACING_HOST", value = %host, "Applying environment variable override");
            config.host = host;
        }

        if let Some(port) = parse_env::<u16>("INFINITE_TRACING_PORT") {
            config.port = port;
        }

        if let Ok(key) = env::var("INFINITE_TRACING_LICENSE_KEY") {
            // Value deliberately not logged
            debug!(env_var = "INFINITE_TRACING_LICENSE_KEY", "Applying environment variable override");
            config.license_key = SecretString::new(key);
        }

        if let Some(plaintext) = parse_env::<bool>("INFINITE_TRACING_USE_PLAINTEXT") {
            config.use_plaintext = plaintext;
        }

        if let Ok(algorithm) = env::var("INFINITE_TRACING_COMPRESSION") {
            config.compression = match algorithm.trim().to_lowercase().as_str() {
                "" | "none" => None,
                other => Some(other.to_string()),
            };
        }

        if let Some(batching) = parse_env::<bool>("INFINITE_TRACING_USE_BATCHING") {
            config.use_batching = batching;
        }

        if let Some(size) = parse_env::<usize>("INFINITE_TRACING_MAX_QUEUE_SIZE") {
            config.max_queue_size = size;
        }

        if let Some(linger) = parse_env::<u64>("INFINITE_TRACING_LINGER_MS") {
            config.linger_ms = linger;
        }

        if let Some(percentage) = parse_env::<f64>("INFINITE_TRACING_FLAKY_PERCENTAGE") {
            config.flaky_percentage = Some(percentage);
        }

        if let Some(code) = parse_env::<i32>("INFINITE_TRACING_FLAKY_CODE") {
            config.flaky_code = Some(code);
        }
    }
}

fn parse_env<T>(name: &'static str) -> Option<T>
where
    T: FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => {
            debug!(env_var = name, value = %value, "Applying environment variable override");
            Some(value)
        }
        Err(e) => {
            warn!(
                env_var = name,
                value = %raw,
                error = %e,
                "Failed to parse environment variable, using default"
            );
            None
        }
    }
}
