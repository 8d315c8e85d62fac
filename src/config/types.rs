//! Configuration type definitions
//!
//! Defines the trace observer connection settings and delivery tuning knobs.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

use crate::error::ConfigError;

/// Largest number of records drained into one batch message.
pub const MAX_BATCH_SIZE: usize = 100;

/// Compression algorithms the ingest endpoint understands.
pub const SUPPORTED_COMPRESSION: [&str; 2] = ["gzip", "zstd"];

/// Main configuration structure for Infinite Tracing
///
/// Holds everything needed to reach the trace observer and to tune the
/// delivery pipeline. Credentials that change while the process runs
/// (agent run token, request metadata) are not part of this structure; they
/// are handed to [`crate::InfiniteTracing::start`].
///
/// # Default Values
///
/// - `port`: `443`
/// - `use_plaintext`: `false`
/// - `compression`: disabled
/// - `use_batching`: `false`
/// - `max_queue_size`: `100000`
/// - `linger_ms`: `5`
/// - `backoff_schedule_secs`: `[15, 15, 30, 60, 120, 300]`
///
/// # Example
///
/// ```no_run
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = infinite_tracing::ConfigBuilder::new()
///     .host("trace-observer.example.com")
///     .license_key("license")
///     .use_batching(true)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct InfiniteTracingConfig {
    /// Trace observer host name (required)
    #[serde(default)]
    pub host: String,

    /// Trace observer port (default: 443)
    #[serde(default = "default_port")]
    pub port: u16,

    /// License key sent with every stream (required)
    #[serde(default = "default_license_key")]
    pub license_key: SecretString,

    /// Disable transport security (default: false)
    #[serde(default)]
    pub use_plaintext: bool,

    /// Outbound compression algorithm, `gzip` or `zstd` (default: disabled)
    #[serde(default)]
    pub compression: Option<String>,

    /// Send spans grouped into batch messages (default: false)
    #[serde(default)]
    pub use_batching: bool,

    /// Capacity of the ingest queue (default: 100000)
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// How long a partial batch may wait for more spans, in milliseconds (default: 5)
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,

    /// Percentage of requests the server should fail on purpose (testing only)
    #[serde(default)]
    pub flaky_percentage: Option<f64>,

    /// gRPC status code the server should fail flaky requests with (testing only)
    #[serde(default)]
    pub flaky_code: Option<i32>,

    /// Reconnect wait ladder in seconds; the last entry repeats
    #[serde(default = "default_backoff_schedule_secs")]
    pub backoff_schedule_secs: Vec<u64>,
}

impl Default for InfiniteTracingConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            license_key: default_license_key(),
            use_plaintext: false,
            compression: None,
            use_batching: false,
            max_queue_size: default_max_queue_size(),
            linger_ms: default_linger_ms(),
            flaky_percentage: None,
            flaky_code: None,
            backoff_schedule_secs: default_backoff_schedule_secs(),
        }
    }
}

impl InfiniteTracingConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingRequiredField("host".to_string()));
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port",
                reason: "must be between 1 and 65535".to_string(),
            });
        }

        if self.license_key.expose_secret().is_empty() {
            return Err(ConfigError::MissingRequiredField("license_key".to_string()));
        }

        if let Some(ref algorithm) = self.compression
            && !SUPPORTED_COMPRESSION.contains(&algorithm.as_str())
        {
            return Err(ConfigError::InvalidValue {
                field: "compression",
                reason: format!(
                    "'{}' is not one of {}",
                    algorithm,
                    SUPPORTED_COMPRESSION.join(", ")
                ),
            });
        }

        if self.max_queue_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_queue_size",
                reason: "must be greater than 0".to_string(),
            });
        }

        if self.linger_ms > 60_000 {
            return Err(ConfigError::InvalidValue {
                field: "linger_ms",
                reason: "must be at most 60000 milliseconds".to_string(),
            });
        }

        if let Some(percentage) = self.flaky_percentage
            && !(0.0..=100.0).contains(&percentage)
        {
            return Err(ConfigError::InvalidValue {
                field: "flaky_percentage",
                reason: format!("{} is outside 0..=100", percentage),
            });
        }

        if self.backoff_schedule_secs.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "backoff_schedule_secs",
                reason: "must contain at least one entry".to_string(),
            });
        }

        if self
            .backoff_schedule_secs
            .windows(2)
            .any(|pair| pair[1] < pair[0])
        {
            return Err(ConfigError::InvalidValue {
                field: "backoff_schedule_secs",
                reason: "entries must be non-decreasing".to_string(),
            });
        }

        Ok(())
    }

    /// Linger interval as a duration
    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    /// Backoff ladder as durations
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        self.backoff_schedule_secs
            .iter()
            .map(|secs| Duration::from_secs(*secs))
            .collect()
    }
}

/// Builder for creating configurations programmatically
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: InfiniteTracingConfig,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            config: InfiniteTracingConfig::default(),
        }
    }

    /// Set trace observer host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set trace observer port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set license key
    pub fn license_key(mut self, key: impl Into<String>) -> Self {
        self.config.license_key = SecretString::new(key.into());
        self
    }

    /// Disable transport security
    pub fn use_plaintext(mut self, plaintext: bool) -> Self {
        self.config.use_plaintext = plaintext;
        self
    }

    /// Set outbound compression algorithm
    pub fn compression(mut self, algorithm: Option<String>) -> Self {
        self.config.compression = algorithm;
        self
    }

    /// Enable or disable batch messages
    pub fn use_batching(mut self, batching: bool) -> Self {
        self.config.use_batching = batching;
        self
    }

    /// Set ingest queue capacity
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.config.max_queue_size = size;
        self
    }

    /// Set batch linger in milliseconds
    pub fn linger_ms(mut self, linger_ms: u64) -> Self {
        self.config.linger_ms = linger_ms;
        self
    }

    /// Ask the server to fail a percentage of requests
    pub fn flaky(mut self, percentage: Option<f64>, code: Option<i32>) -> Self {
        self.config.flaky_percentage = percentage;
        self.config.flaky_code = code;
        self
    }

    /// Set reconnect wait ladder in seconds
    pub fn backoff_schedule_secs(mut self, schedule: Vec<u64>) -> Self {
        self.config.backoff_schedule_secs = schedule;
        self
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<InfiniteTracingConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// Default value functions
fn default_port() -> u16 {
    443
}

fn default_license_key() -> SecretString {
    SecretString::new(String::new())
}

fn default_max_queue_size() -> usize {
    100_000
}

fn default_linger_ms() -> u64 {
    5
}

fn default_backoff_schedule_secs() -> Vec<u64> {
    vec![15, 15, 30, 60, 120, 300]
}
