//! Wire messages for the `com.newrelic.trace.v1` ingest service
//!
//! Declared by hand with `prost` derives so the crate needs no protobuf
//! toolchain at build time. Field numbers match `infinite_tracing.proto` v1.

use std::collections::HashMap;

/// Fully qualified gRPC service name.
pub const INGEST_SERVICE: &str = "com.newrelic.trace.v1.IngestService";

/// Path of the single-span streaming method.
pub const RECORD_SPAN_PATH: &str = "/com.newrelic.trace.v1.IngestService/RecordSpan";

/// Path of the batched streaming method.
pub const RECORD_SPAN_BATCH_PATH: &str = "/com.newrelic.trace.v1.IngestService/RecordSpanBatch";

/// A group of spans written as one message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SpanBatch {
    #[prost(message, repeated, tag = "1")]
    pub spans: Vec<Span>,
}

/// One span as the trace observer receives it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Span {
    #[prost(string, tag = "1")]
    pub trace_id: String,
    #[prost(map = "string, message", tag = "2")]
    pub intrinsics: HashMap<String, AttributeValue>,
    #[prost(map = "string, message", tag = "3")]
    pub user_attributes: HashMap<String, AttributeValue>,
    #[prost(map = "string, message", tag = "4")]
    pub agent_attributes: HashMap<String, AttributeValue>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AttributeValue {
    #[prost(oneof = "attribute_value::Value", tags = "1, 2, 3, 4")]
    pub value: Option<attribute_value::Value>,
}

pub mod attribute_value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(string, tag = "1")]
        StringValue(String),
        #[prost(bool, tag = "2")]
        BoolValue(bool),
        #[prost(int64, tag = "3")]
        IntValue(i64),
        #[prost(double, tag = "4")]
        DoubleValue(f64),
    }
}

/// Acknowledgement streamed back by the trace observer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RecordStatus {
    #[prost(uint64, tag = "1")]
    pub messages_seen: u64,
}

impl AttributeValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            value: Some(attribute_value::Value::StringValue(value.into())),
        }
    }

    pub fn bool(value: bool) -> Self {
        Self {
            value: Some(attribute_value::Value::BoolValue(value)),
        }
    }

    pub fn int(value: i64) -> Self {
        Self {
            value: Some(attribute_value::Value::IntValue(value)),
        }
    }

    pub fn double(value: f64) -> Self {
        Self {
            value: Some(attribute_value::Value::DoubleValue(value)),
        }
    }
}
