//! Inbound half of an ingest stream
//!
//! The trace observer streams [`RecordStatus`] acknowledgements back on the
//! same call. [`ResponseListener`] counts them and turns terminal events into
//! recovery decisions.

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tonic::{Code, Status};
use tracing::{debug, error, warn};

use crate::delivery::disconnection::DisconnectionHandler;
use crate::delivery::stream::{CancelCause, Cancellation};
use crate::metrics::{self, MetricSink};
use crate::proto::RecordStatus;

/// Substrings of an `INTERNAL` failure that mean the server reset an idle stream.
const IDLE_TIMEOUT_PATTERNS: [&str; 3] = ["rst stream", "rst_stream", "not a result of an error"];

/// Substrings that mean TLS could not negotiate HTTP/2 via ALPN.
const ALPN_PATTERNS: [&str; 2] = ["alpn", "no application protocol"];

/// Terminal error observed on a stream.
#[derive(Debug, Clone)]
pub struct StreamFailure {
    code: Option<Code>,
    message: String,
    cause: Option<CancelCause>,
}

impl StreamFailure {
    /// Failure reported by the transport, with its full source chain as text
    pub fn from_status(status: &Status) -> Self {
        Self {
            code: Some(status.code()),
            message: report(status),
            cause: None,
        }
    }

    /// Failure caused by this side cancelling the call
    pub fn from_cancellation(cancellation: Cancellation) -> Self {
        Self {
            code: Some(Code::Cancelled),
            message: cancellation.reason,
            cause: Some(cancellation.cause),
        }
    }

    /// Failure without a remote status
    pub fn local(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            cause: None,
        }
    }

    /// Status code, if the remote supplied one
    pub fn code(&self) -> Option<Code> {
        self.code
    }

    /// Failure text including nested causes
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this is the expected echo of an intentional channel close
    pub fn is_channel_closing(&self) -> bool {
        matches!(self.cause, Some(CancelCause::ChannelClosing))
    }

    fn is_idle_timeout(&self) -> bool {
        self.code == Some(Code::Internal) && contains_any(&self.message, &IDLE_TIMEOUT_PATTERNS)
    }

    fn is_alpn_failure(&self) -> bool {
        contains_any(&self.message, &ALPN_PATTERNS)
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let haystack = haystack.to_lowercase();
    needles.iter().any(|needle| haystack.contains(needle))
}

fn report(mut err: &(dyn std::error::Error + 'static)) -> String {
    let mut s = format!("{}", err);
    while let Some(src) = err.source() {
        let _ = write!(s, ": {}", src);
        err = src;
    }
    s
}

/// Observer bound to one stream's inbound messages.
#[derive(Clone)]
pub struct ResponseListener {
    generation: u64,
    disconnection: Arc<DisconnectionHandler>,
    metrics: Arc<dyn MetricSink>,
    rebuild_requested: Arc<AtomicU64>,
    acknowledged: Arc<AtomicBool>,
}

impl ResponseListener {
    /// Listener for the stream opened as `generation`.
    ///
    /// `rebuild_requested` is shared with the supervisor and holds the newest
    /// generation the server completed, or 0.
    pub fn new(
        generation: u64,
        disconnection: Arc<DisconnectionHandler>,
        metrics: Arc<dyn MetricSink>,
        rebuild_requested: Arc<AtomicU64>,
    ) -> Self {
        Self {
            generation,
            disconnection,
            metrics,
            rebuild_requested,
            acknowledged: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Supervisor generation of the stream this listener observes
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// An acknowledgement arrived.
    pub fn on_next(&self, status: RecordStatus) {
        self.metrics.increment_counter(metrics::RESPONSE);
        if !self.acknowledged.swap(true, Ordering::AcqRel) {
            // The stream works end to end; restart the backoff ladder
            self.disconnection.connection_healthy();
        }
        debug!(
            generation = self.generation,
            messages_seen = status.messages_seen,
            "Received acknowledgement"
        );
    }

    /// The stream ended with an error.
    pub async fn on_error(&self, failure: StreamFailure) {
        if failure.is_channel_closing() {
            debug!(
                generation = self.generation,
                "Stopping response listener because the stream was closed by another task"
            );
            return;
        }

        self.metrics.increment_counter(metrics::RESPONSE_ERROR);

        if failure.is_idle_timeout() {
            debug!(
                generation = self.generation,
                error = %failure.message(),
                "Stream reset by server after idling, backing off"
            );
        } else if failure.is_alpn_failure() {
            error!(
                generation = self.generation,
                error = %failure.message(),
                "ALPN does not appear to be supported on this platform, Infinite Tracing will not send spans"
            );
            self.metrics.increment_counter(metrics::NO_ALPN_SUPPORT);
            self.disconnection.terminate();
            return;
        } else {
            warn!(
                generation = self.generation,
                code = ?failure.code(),
                error = %failure.message(),
                "Encountered gRPC stream error"
            );
        }

        self.disconnection.handle(failure.code()).await;
    }

    /// The server closed the stream cleanly.
    pub fn on_completed(&self) {
        debug!(generation = self.generation, "Stream completed by server, rebuilding on next use");
        self.metrics.increment_counter(metrics::RESPONSE_COMPLETED);
        self.rebuild_requested
            .fetch_max(self.generation, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ResponseListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseListener")
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_timeout_requires_internal_code() {
        let idle = StreamFailure::from_status(&Status::internal("Received Rst Stream"));
        assert!(idle.is_idle_timeout());

        let not_internal = StreamFailure::from_status(&Status::unavailable("Received Rst Stream"));
        assert!(!not_internal.is_idle_timeout());
    }

    #[test]
    fn test_alpn_detection_is_case_insensitive() {
        let failure = StreamFailure::local("tls handshake failed: peer does not support alpn h2");
        assert!(failure.is_alpn_failure());
        assert!(!StreamFailure::local("connection refused").is_alpn_failure());
    }

    #[test]
    fn test_cancellation_with_closing_cause_is_channel_closing() {
        let failure = StreamFailure::from_cancellation(Cancellation {
            reason: "closing".to_string(),
            cause: CancelCause::ChannelClosing,
        });
        assert!(failure.is_channel_closing());
        assert_eq!(failure.code(), Some(Code::Cancelled));

        let other = StreamFailure::from_cancellation(Cancellation {
            reason: "test".to_string(),
            cause: CancelCause::Other("test".to_string()),
        });
        assert!(!other.is_channel_closing());
    }
}
