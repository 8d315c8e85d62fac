//! Outbound half of an ingest stream
//!
//! A [`SpanStream`] is the write side of exactly one RecordSpan or
//! RecordSpanBatch call. Transports create it together with the
//! [`OutboundStream`] they hand to the wire, and watch its cancellation
//! signal to tear the call down.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use futures::stream::BoxStream;
use prost::Message;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::error::DeliveryError;
use crate::proto::{Span, SpanBatch};

/// Messages buffered per stream before it reports not ready.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Wire shape a stream accepts, fixed when the stream is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// RecordSpan: one span per message
    Single,
    /// RecordSpanBatch: many spans per message
    Batch,
}

impl StreamMode {
    fn label(self) -> &'static str {
        match self {
            StreamMode::Single => "single-span",
            StreamMode::Batch => "span-batch",
        }
    }
}

/// One message ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WireItem {
    /// A lone span
    Span(Span),
    /// A batch of spans
    Batch(SpanBatch),
}

impl WireItem {
    fn label(&self) -> &'static str {
        match self {
            WireItem::Span(_) => "single-span",
            WireItem::Batch(_) => "span-batch",
        }
    }

    /// Number of spans carried
    pub fn span_count(&self) -> usize {
        match self {
            WireItem::Span(_) => 1,
            WireItem::Batch(batch) => batch.spans.len(),
        }
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        match self {
            WireItem::Span(span) => span.encoded_len(),
            WireItem::Batch(batch) => batch.encoded_len(),
        }
    }
}

/// Why a stream was cancelled from this side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelCause {
    /// The channel is being torn down on purpose; the resulting stream error is expected
    ChannelClosing,
    /// Any other local reason
    Other(String),
}

/// Cancellation recorded on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    /// Human readable reason
    pub reason: String,
    /// Distinguishes intentional closes from real failures
    pub cause: CancelCause,
}

/// Stream of outbound messages consumed by the transport; ends on cancel.
pub type OutboundStream<T> = BoxStream<'static, T>;

enum Outbound {
    Single(mpsc::Sender<Span>),
    Batch(mpsc::Sender<SpanBatch>),
}

/// Write side of one live ingest call.
pub struct SpanStream {
    id: u64,
    outbound: Outbound,
    cancelled: watch::Sender<Option<Cancellation>>,
}

impl SpanStream {
    /// Build a RecordSpan stream and the outbound stream that feeds the call.
    pub fn single(buffer: usize) -> (Self, OutboundStream<Span>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (stream, watch_rx) = Self::with_outbound(Outbound::Single(tx));
        (stream, until_cancelled(rx, watch_rx))
    }

    /// Build a RecordSpanBatch stream and the outbound stream that feeds the call.
    pub fn batch(buffer: usize) -> (Self, OutboundStream<SpanBatch>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (stream, watch_rx) = Self::with_outbound(Outbound::Batch(tx));
        (stream, until_cancelled(rx, watch_rx))
    }

    fn with_outbound(outbound: Outbound) -> (Self, watch::Receiver<Option<Cancellation>>) {
        let (cancelled, watch_rx) = watch::channel(None);
        let stream = Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            outbound,
            cancelled,
        };
        (stream, watch_rx)
    }

    /// Process-unique stream id, for logs
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wire shape this stream accepts
    pub fn mode(&self) -> StreamMode {
        match self.outbound {
            Outbound::Single(_) => StreamMode::Single,
            Outbound::Batch(_) => StreamMode::Batch,
        }
    }

    /// Whether a message can be written right now without buffering past
    /// the flow-control window.
    pub fn is_ready(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match &self.outbound {
            Outbound::Single(tx) => !tx.is_closed() && tx.capacity() > 0,
            Outbound::Batch(tx) => !tx.is_closed() && tx.capacity() > 0,
        }
    }

    /// Write one message.
    ///
    /// Sending the wrong shape is a programming error and fails with
    /// [`DeliveryError::UnsupportedStreamItem`] before touching the wire.
    /// Writing to a stream that was cancelled, or whose call has ended,
    /// fails with [`DeliveryError::StreamClosed`].
    pub fn send(&self, item: WireItem) -> Result<(), DeliveryError> {
        if item.label() != self.mode().label() {
            return Err(self.unsupported(&item));
        }
        if self.is_cancelled() {
            return Err(DeliveryError::StreamClosed(self.id));
        }

        let result = match (&self.outbound, item) {
            (Outbound::Single(tx), WireItem::Span(span)) => tx.try_send(span).map_err(describe),
            (Outbound::Batch(tx), WireItem::Batch(batch)) => tx.try_send(batch).map_err(describe),
            (_, item) => return Err(self.unsupported(&item)),
        };

        match result {
            Ok(()) => Ok(()),
            Err(SendFailure::Closed) => {
                debug!(stream_id = self.id, "Write to a stream whose call has ended");
                Err(DeliveryError::StreamClosed(self.id))
            }
            Err(SendFailure::Full) => Err(DeliveryError::StreamRejected(format!(
                "outbound buffer of stream {} is full",
                self.id
            ))),
        }
    }

    fn unsupported(&self, item: &WireItem) -> DeliveryError {
        DeliveryError::UnsupportedStreamItem {
            stream: self.mode().label(),
            item: item.label(),
        }
    }

    /// Cancel the call. Only the first cancellation is recorded.
    pub fn cancel(&self, reason: impl Into<String>, cause: CancelCause) {
        let cancellation = Cancellation {
            reason: reason.into(),
            cause,
        };
        self.cancelled.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            debug!(stream_id = self.id, reason = %cancellation.reason, "Cancelling stream");
            *current = Some(cancellation);
            true
        });
    }

    /// Whether `cancel` has been called
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.borrow().is_some()
    }

    /// The recorded cancellation, if any
    pub fn cancellation(&self) -> Option<Cancellation> {
        self.cancelled.borrow().clone()
    }

    /// Receiver that observes cancellation, for the inbound task
    pub fn subscribe_cancellation(&self) -> watch::Receiver<Option<Cancellation>> {
        self.cancelled.subscribe()
    }
}

impl fmt::Debug for SpanStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanStream")
            .field("id", &self.id)
            .field("mode", &self.mode())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

enum SendFailure {
    Full,
    Closed,
}

fn describe<T>(err: mpsc::error::TrySendError<T>) -> SendFailure {
    match err {
        mpsc::error::TrySendError::Full(_) => SendFailure::Full,
        mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
    }
}

/// Wait until the stream records a cancellation (or is dropped).
pub async fn cancelled(mut rx: watch::Receiver<Option<Cancellation>>) -> Option<Cancellation> {
    let cancellation = match rx.wait_for(|c| c.is_some()).await {
        Ok(cancellation) => cancellation.clone(),
        Err(_) => None,
    };
    cancellation
}

fn until_cancelled<T: Send + 'static>(
    rx: mpsc::Receiver<T>,
    watch_rx: watch::Receiver<Option<Cancellation>>,
) -> OutboundStream<T> {
    ReceiverStream::new(rx)
        .take_until(cancelled(watch_rx))
        .boxed()
}
