//! Configuration module
//!
//! Provides configuration management for Infinite Tracing including
//! loading from YAML files, environment variables, and programmatic API.

pub mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::{ConfigBuilder, InfiniteTracingConfig, MAX_BATCH_SIZE, SUPPORTED_COMPRESSION};
