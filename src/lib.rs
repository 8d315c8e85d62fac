//! Infinite Tracing
//!
//! Streams span records to a remote trace observer over a long-lived,
//! authenticated gRPC stream and recovers from transport failures on its own.
//!
//! # Features
//!
//! - Non-blocking, bounded ingest queue
//! - Single-span or batched streams
//! - Backoff ladder keyed off gRPC status codes, with permanent shutdown for
//!   failures no retry can fix
//! - Configurable via YAML, environment variables, or programmatic API
//! - OpenTelemetry SDK span exporter
//! - Mock transport for testing
//!
//! # Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use infinite_tracing::{ConfigLoader, InfiniteTracing, SpanRecord};
//!
//! # async fn example() -> Result<(), infinite_tracing::InfiniteTracingError> {
//! let config = ConfigLoader::from_env()?;
//! let service = InfiniteTracing::from_config(config)?;
//! service.start("agent-run-token", BTreeMap::new()).await;
//! service.accept(SpanRecord::new("abc123"));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod delivery;
pub mod error;
pub mod exporter;
pub mod metrics;
pub mod mock;
#[allow(missing_docs)]
pub mod proto;
pub mod span;
pub mod transport;

// Re-export public API
pub use api::public::InfiniteTracing;
pub use config::{ConfigBuilder, ConfigLoader, InfiniteTracingConfig, MAX_BATCH_SIZE};
pub use delivery::{ChannelSupervisor, ConnectionStatus, DeliveryLoop, IngestQueue, StreamMode};
pub use error::{ConfigError, DeliveryError, InfiniteTracingError, TransportError};
pub use exporter::InfiniteTracingSpanExporter;
pub use metrics::{MetricSink, NoopMetricSink, OtelMetricSink};
pub use mock::{MockIngestTransport, RecordingMetricSink};
pub use span::SpanRecord;
pub use transport::{ChannelFactory, Credentials, GrpcChannelFactory, IngestChannel};

use tracing_subscriber::EnvFilter;

/// Initialize structured logging
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}
