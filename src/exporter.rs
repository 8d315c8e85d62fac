//! OpenTelemetry SDK integration
//!
//! [`InfiniteTracingSpanExporter`] plugs the service into an SDK
//! `TracerProvider`: finished spans are converted to [`SpanRecord`]s and
//! handed to [`InfiniteTracing::accept`].

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use opentelemetry::trace::{SpanId, SpanKind};
use opentelemetry::{KeyValue, Value};
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{SpanData, SpanExporter};
use tracing::trace;

use crate::api::public::InfiniteTracing;
use crate::span::SpanRecord;

/// SpanExporter that forwards finished spans into Infinite Tracing
#[derive(Clone, Debug)]
pub struct InfiniteTracingSpanExporter {
    service: Arc<InfiniteTracing>,
}

impl InfiniteTracingSpanExporter {
    /// Create an exporter feeding `service`
    pub fn new(service: Arc<InfiniteTracing>) -> Self {
        Self { service }
    }
}

impl SpanExporter for InfiniteTracingSpanExporter {
    #[allow(refining_impl_trait_reachable)]
    fn export(&self, batch: Vec<SpanData>) -> BoxFuture<'static, OTelSdkResult> {
        // accept never blocks, so the work is done before the future is returned
        for span in &batch {
            self.service.accept(span_data_to_record(span));
        }
        futures::future::ready(Ok(())).boxed()
    }
}

/// Convert a finished SDK span into a record for delivery.
pub fn span_data_to_record(span: &SpanData) -> SpanRecord {
    let timestamp: DateTime<Utc> = span.start_time.into();
    let duration = span
        .end_time
        .duration_since(span.start_time)
        .unwrap_or(Duration::ZERO);

    let mut record = SpanRecord::new(span.span_context.trace_id().to_string())
        .with_timestamp(timestamp)
        .with_intrinsic("guid", span.span_context.span_id().to_string())
        .with_intrinsic("name", span.name.to_string())
        .with_intrinsic("timestamp", epoch_millis(span.start_time))
        .with_intrinsic("duration", duration.as_secs_f64())
        .with_intrinsic("span.kind", span_kind_label(&span.span_kind))
        .with_intrinsic("category", category(&span.attributes));

    if span.parent_span_id != SpanId::INVALID {
        record = record.with_intrinsic("parentId", span.parent_span_id.to_string());
    }

    for attribute in &span.attributes {
        match attribute_value(&attribute.value) {
            Some(value) => {
                record = record.with_user_attribute(attribute.key.as_str().to_string(), value);
            }
            None => trace!(key = %attribute.key, "Skipping attribute with unsupported type"),
        }
    }
    record
}

fn epoch_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn span_kind_label(kind: &SpanKind) -> &'static str {
    match kind {
        SpanKind::Client => "client",
        SpanKind::Server => "server",
        SpanKind::Producer => "producer",
        SpanKind::Consumer => "consumer",
        SpanKind::Internal => "internal",
    }
}

fn category(attributes: &[KeyValue]) -> &'static str {
    let has = |key: &str| attributes.iter().any(|kv| kv.key.as_str() == key);
    if has("db.system") || has("db.system.name") {
        "datastore"
    } else if has("http.method") || has("http.request.method") {
        "http"
    } else {
        "generic"
    }
}

fn attribute_value(value: &Value) -> Option<serde_json::Value> {
    match value {
        Value::Bool(b) => Some((*b).into()),
        Value::I64(i) => Some((*i).into()),
        Value::F64(f) => Some((*f).into()),
        Value::String(s) => Some(s.as_str().into()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_prefers_datastore() {
        let attributes = vec![
            KeyValue::new("http.method", "GET"),
            KeyValue::new("db.system", "postgresql"),
        ];
        assert_eq!(category(&attributes), "datastore");
        assert_eq!(category(&attributes[..1]), "http");
        assert_eq!(category(&[]), "generic");
    }

    #[test]
    fn test_array_attributes_are_skipped() {
        assert!(attribute_value(&Value::Array(vec![1i64, 2].into())).is_none());
        assert_eq!(attribute_value(&Value::I64(7)), Some(7.into()));
    }
}
