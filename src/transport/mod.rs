//! Transport seam
//!
//! The delivery core never talks to tonic directly. It asks a
//! [`ChannelFactory`] for an [`IngestChannel`] and opens streams on it, which
//! lets tests swap in [`crate::mock::MockIngestTransport`].

pub mod grpc;

use std::collections::BTreeMap;

use secrecy::SecretString;

use crate::delivery::response::ResponseListener;
use crate::delivery::stream::SpanStream;
use crate::error::InfiniteTracingError;

pub use grpc::GrpcChannelFactory;

/// Authentication material for the next channel build.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Token identifying the current agent run
    pub agent_run_token: SecretString,
    /// Extra key/value pairs sent as request metadata
    pub request_metadata: BTreeMap<String, String>,
}

impl Credentials {
    /// Bundle a run token with request metadata
    pub fn new(agent_run_token: impl Into<String>, request_metadata: BTreeMap<String, String>) -> Self {
        Self {
            agent_run_token: SecretString::new(agent_run_token.into()),
            request_metadata,
        }
    }
}

/// Builds channels to the trace observer.
pub trait ChannelFactory: Send + Sync {
    /// Build a channel authenticated with `credentials`.
    ///
    /// Must not block on the network; connection problems surface later as
    /// stream failures.
    fn build_channel(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn IngestChannel>, InfiniteTracingError>;
}

/// A built channel, able to open ingest streams.
pub trait IngestChannel: Send + Sync {
    /// Open a RecordSpan stream whose inbound events go to `listener`
    fn record_span(&self, listener: ResponseListener) -> Result<SpanStream, InfiniteTracingError>;

    /// Open a RecordSpanBatch stream whose inbound events go to `listener`
    fn record_span_batch(
        &self,
        listener: ResponseListener,
    ) -> Result<SpanStream, InfiniteTracingError>;

    /// Release the channel. Streams still open on it end with an error.
    fn shutdown(&self);
}
