//! Test doubles
//!
//! A network-free transport and a recording metric sink, used by the crate's
//! own tests and available to hosts that want to exercise their wiring.

pub mod metrics;
pub mod service;

pub use metrics::RecordingMetricSink;
pub use service::MockIngestTransport;
