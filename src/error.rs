//! Error types for the Infinite Tracing delivery core
//!
//! Defines all error types used throughout the library with clear error messages
//! and context for debugging.

use thiserror::Error;

/// Main error type for the Infinite Tracing library
#[derive(Error, Debug)]
pub enum InfiniteTracingError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Channel or stream construction errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Span delivery errors
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Missing required configuration field
    #[error("Missing required field: {0}")]
    MissingRequiredField(String),

    /// A field holds a value outside its accepted range or set
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Name of the offending field
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// Configuration file could not be read or parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Channel or stream construction errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// The trace observer endpoint could not be turned into a URI
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// TLS configuration was rejected
    #[error("TLS setup failed: {0}")]
    Tls(String),

    /// A metadata key or value cannot be sent as a gRPC header
    #[error("Invalid request metadata: {0}")]
    InvalidMetadata(String),

    /// Unknown compression algorithm
    #[error("Unsupported compression algorithm: {0}")]
    UnsupportedCompression(String),

    /// Channel build rejected by a test double or collaborator
    #[error("Channel build failed: {0}")]
    ChannelBuild(String),
}

/// Span delivery errors
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The connection was shut down forever
    #[error("Infinite Tracing is permanently disconnected")]
    PermanentlyDisconnected,

    /// A wire item of the wrong shape was sent to a stream
    #[error("Unsupported operation: {stream} stream cannot send a {item}")]
    UnsupportedStreamItem {
        /// Shape the stream accepts
        stream: &'static str,
        /// Shape that was offered
        item: &'static str,
    },

    /// The outbound buffer refused the message
    #[error("Stream rejected message: {0}")]
    StreamRejected(String),

    /// The stream was cancelled or its call ended before the write
    #[error("Stream {0} is closed")]
    StreamClosed(u64),
}
