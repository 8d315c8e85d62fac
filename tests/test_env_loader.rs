//! Unit tests for environment variable configuration loading

use std::sync::Mutex;

use infinite_tracing::config::{ConfigBuilder, ConfigLoader};
use secrecy::ExposeSecret;

// Environment variables are process-wide, so parallel tests can interfere with each other
static ENV_MUTEX: Mutex<()> = Mutex::new(());

const ENV_VARS: [&str; 10] = [
    "INFINITE_TRACING_HOST",
    "INFINITE_TRACING_PORT",
    "INFINITE_TRACING_LICENSE_KEY",
    "INFINITE_TRACING_USE_PLAINTEXT",
    "INFINITE_TRACING_COMPRESSION",
    "INFINITE_TRACING_USE_BATCHING",
    "INFINITE_TRACING_MAX_QUEUE_SIZE",
    "INFINITE_TRACING_LINGER_MS",
    "INFINITE_TRACING_FLAKY_PERCENTAGE",
    "INFINITE_TRACING_FLAKY_CODE",
];

fn clear_env_vars() {
    for name in ENV_VARS {
        unsafe { std::env::remove_var(name) };
    }
}

fn set(name: &str, value: &str) {
    unsafe { std::env::set_var(name, value) };
}

#[test]
fn test_load_from_env_with_all_vars() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();

    set("INFINITE_TRACING_HOST", "env-host");
    set("INFINITE_TRACING_PORT", "9443");
    set("INFINITE_TRACING_LICENSE_KEY", "env-license");
    set("INFINITE_TRACING_USE_PLAINTEXT", "true");
    set("INFINITE_TRACING_COMPRESSION", "ZSTD");
    set("INFINITE_TRACING_USE_BATCHING", "true");
    set("INFINITE_TRACING_MAX_QUEUE_SIZE", "42");
    set("INFINITE_TRACING_LINGER_MS", "15");
    set("INFINITE_TRACING_FLAKY_PERCENTAGE", "2.5");
    set("INFINITE_TRACING_FLAKY_CODE", "14");

    let config = ConfigLoader::from_env().unwrap();

    assert_eq!(config.host, "env-host");
    assert_eq!(config.port, 9443);
    assert_eq!(config.license_key.expose_secret(), "env-license");
    assert!(config.use_plaintext);
    assert_eq!(config.compression.as_deref(), Some("zstd"));
    assert!(config.use_batching);
    assert_eq!(config.max_queue_size, 42);
    assert_eq!(config.linger_ms, 15);
    assert_eq!(config.flaky_percentage, Some(2.5));
    assert_eq!(config.flaky_code, Some(14));

    clear_env_vars();
}

#[test]
fn test_load_from_env_requires_host_and_key() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();

    assert!(ConfigLoader::from_env().is_err());

    set("INFINITE_TRACING_HOST", "env-host");
    set("INFINITE_TRACING_LICENSE_KEY", "key");
    let config = ConfigLoader::from_env().unwrap();
    assert_eq!(config.port, 443);

    clear_env_vars();
}

#[test]
fn test_unparseable_values_are_ignored() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();

    set("INFINITE_TRACING_HOST", "env-host");
    set("INFINITE_TRACING_LICENSE_KEY", "key");
    set("INFINITE_TRACING_PORT", "not-a-port");
    set("INFINITE_TRACING_USE_BATCHING", "maybe");

    let config = ConfigLoader::from_env().unwrap();
    assert_eq!(config.port, 443);
    assert!(!config.use_batching);

    clear_env_vars();
}

#[test]
fn test_compression_none_disables_compression() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();

    set("INFINITE_TRACING_COMPRESSION", "none");
    let provided = ConfigBuilder::new()
        .host("localhost")
        .license_key("key")
        .compression(Some("gzip".to_string()))
        .build()
        .unwrap();

    let config = ConfigLoader::load(Some(provided)).unwrap();
    assert!(config.compression.is_none());

    clear_env_vars();
}

#[test]
fn test_env_overrides_provided_config() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clear_env_vars();

    set("INFINITE_TRACING_MAX_QUEUE_SIZE", "7");
    let provided = ConfigBuilder::new()
        .host("localhost")
        .license_key("key")
        .max_queue_size(99)
        .build()
        .unwrap();

    let config = ConfigLoader::load(Some(provided)).unwrap();
    assert_eq!(config.max_queue_size, 7);
    assert_eq!(config.host, "localhost");

    clear_env_vars();
}
