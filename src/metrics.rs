//! Supportability metrics
//!
//! The delivery core reports fire-and-forget counters through a [`MetricSink`].
//! Names follow the `Supportability/InfiniteTracing/...` convention the
//! collector dashboards key on.

use opentelemetry::KeyValue;
use opentelemetry::metrics::Counter;

/// Channel built and connected
pub const CONNECT: &str = "Supportability/InfiniteTracing/Connect";
/// Acknowledgement received
pub const RESPONSE: &str = "Supportability/InfiniteTracing/Response";
/// Stream ended with an error
pub const RESPONSE_ERROR: &str = "Supportability/InfiniteTracing/Response/Error";
/// Stream completed by the server
pub const RESPONSE_COMPLETED: &str = "Supportability/InfiniteTracing/Response/Completed";
/// Spans written to a stream
pub const SPAN_SENT: &str = "Supportability/InfiniteTracing/Span/Sent";
/// Spans accepted from producers
pub const SPAN_SEEN: &str = "Supportability/InfiniteTracing/Span/Seen";
/// Spans dropped on queue overflow
pub const SPAN_DROPPED: &str = "Supportability/InfiniteTracing/Span/Dropped";
/// Delivery skipped because the stream was not ready
pub const NOT_READY: &str = "Supportability/InfiniteTracing/NotReady";
/// TLS could not negotiate HTTP/2
pub const NO_ALPN_SUPPORT: &str = "Supportability/InfiniteTracing/NoALPNSupport";
/// Uncompressed bytes written to the stream.
pub const OUTPUT_BYTES: &str = "Supportability/Java/InfiniteTracing/Output/Bytes";

/// Counter name for a handled gRPC status, e.g. `.../Span/gRPC/UNAVAILABLE`.
pub fn grpc_status(code: Option<tonic::Code>) -> String {
    let label = match code {
        Some(code) => code_label(code),
        None => "NONE",
    };
    format!("Supportability/InfiniteTracing/Span/gRPC/{}", label)
}

fn code_label(code: tonic::Code) -> &'static str {
    use tonic::Code;
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELLED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
    }
}

/// Destination for supportability counters
pub trait MetricSink: Send + Sync {
    /// Add `count` to the named counter
    fn increment_counter_by(&self, name: &str, count: u64);

    /// Add one to the named counter
    fn increment_counter(&self, name: &str) {
        self.increment_counter_by(name, 1);
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricSink;

impl MetricSink for NoopMetricSink {
    fn increment_counter_by(&self, _name: &str, _count: u64) {}
}

/// Sink that records counters through the global OpenTelemetry meter
///
/// All supportability names share one instrument and are told apart by the
/// `metric.name` attribute.
#[derive(Debug, Clone)]
pub struct OtelMetricSink {
    counter: Counter<u64>,
}

impl OtelMetricSink {
    /// Create a sink on the global meter provider
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("infinite_tracing");
        let counter = meter
            .u64_counter("infinite_tracing.supportability")
            .with_description("Infinite Tracing supportability counters")
            .build();
        Self { counter }
    }
}

impl Default for OtelMetricSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSink for OtelMetricSink {
    fn increment_counter_by(&self, name: &str, count: u64) {
        self.counter
            .add(count, &[KeyValue::new("metric.name", name.to_string())]);
    }
}
