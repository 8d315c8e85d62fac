//! Span records and their wire conversion
//!
//! A [`SpanRecord`] is what producers hand to [`crate::InfiniteTracing::accept`].
//! Attribute values are free-form JSON values; only the shapes the trace
//! observer understands (strings, booleans, integers, floats) reach the wire.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::proto::{AttributeValue, Span, SpanBatch};

/// Intrinsic carrying the trace identifier on the wire.
pub const TRACE_ID_INTRINSIC: &str = "traceId";

/// Intrinsic carrying the span start time in epoch milliseconds.
pub const TIMESTAMP_INTRINSIC: &str = "timestamp";

/// One unit of span telemetry awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    /// Distributed trace identifier
    pub trace_id: String,
    /// When the span was created
    pub timestamp: DateTime<Utc>,
    /// Attributes defined by the span model
    #[serde(default)]
    pub intrinsics: HashMap<String, Value>,
    /// Attributes added by application code
    #[serde(default)]
    pub user_attributes: HashMap<String, Value>,
    /// Attributes added by instrumentation
    #[serde(default)]
    pub agent_attributes: HashMap<String, Value>,
}

impl SpanRecord {
    /// Create an empty record stamped with the current time
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            timestamp: Utc::now(),
            intrinsics: HashMap::new(),
            user_attributes: HashMap::new(),
            agent_attributes: HashMap::new(),
        }
    }

    /// Override the creation timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add an intrinsic attribute
    pub fn with_intrinsic(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.intrinsics.insert(key.into(), value.into());
        self
    }

    /// Add a user attribute
    pub fn with_user_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.user_attributes.insert(key.into(), value.into());
        self
    }

    /// Add an agent attribute
    pub fn with_agent_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.agent_attributes.insert(key.into(), value.into());
        self
    }
}

/// Convert one record into the single-span wire message.
///
/// The trace id is written both as the top-level field and as the
/// `traceId` intrinsic; the observer checks that the two agree.
pub fn to_wire_span(record: &SpanRecord) -> Span {
    let mut intrinsics = to_wire_attributes(&record.intrinsics);
    intrinsics.insert(
        TRACE_ID_INTRINSIC.to_string(),
        AttributeValue::string(record.trace_id.clone()),
    );
    intrinsics
        .entry(TIMESTAMP_INTRINSIC.to_string())
        .or_insert_with(|| AttributeValue::int(record.timestamp.timestamp_millis()));

    Span {
        trace_id: record.trace_id.clone(),
        intrinsics,
        user_attributes: to_wire_attributes(&record.user_attributes),
        agent_attributes: to_wire_attributes(&record.agent_attributes),
    }
}

/// Convert a drained group of records into one batch message.
pub fn to_wire_batch(records: &[SpanRecord]) -> SpanBatch {
    SpanBatch {
        spans: records.iter().map(to_wire_span).collect(),
    }
}

fn to_wire_attributes(attributes: &HashMap<String, Value>) -> HashMap<String, AttributeValue> {
    attributes
        .iter()
        .filter_map(|(key, value)| match to_wire_value(value) {
            Some(wire) => Some((key.clone(), wire)),
            None => {
                trace!(attribute = %key, "Dropping attribute with unsupported value type");
                None
            }
        })
        .collect()
}

fn to_wire_value(value: &Value) -> Option<AttributeValue> {
    match value {
        Value::String(s) => Some(AttributeValue::string(s.clone())),
        Value::Bool(b) => Some(AttributeValue::bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(AttributeValue::int(i))
            } else {
                n.as_f64().map(AttributeValue::double)
            }
        }
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
