//! Delivery worker
//!
//! [`DeliveryLoop`] is the single consumer of the [`IngestQueue`]. It only
//! takes records off the queue once a ready stream exists, so an outage
//! leaves records queued rather than lost.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::MAX_BATCH_SIZE;
use crate::delivery::queue::IngestQueue;
use crate::delivery::stream::{SpanStream, StreamMode, WireItem};
use crate::delivery::supervisor::ChannelSupervisor;
use crate::error::{DeliveryError, InfiniteTracingError};
use crate::metrics::{self, MetricSink};
use crate::span::{to_wire_batch, to_wire_span};

/// Pause after a stream reports it cannot take more data.
pub const NOT_READY_WAIT: Duration = Duration::from_millis(250);

/// Longest wait for a record before an iteration gives up.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Pause when the connection vanished between lookup and use.
const UNAVAILABLE_WAIT: Duration = Duration::from_millis(50);

/// Moves records from the queue onto the current stream.
pub struct DeliveryLoop {
    supervisor: ChannelSupervisor,
    queue: Arc<IngestQueue>,
    metrics: Arc<dyn MetricSink>,
    linger: Duration,
}

impl DeliveryLoop {
    /// Create a loop feeding `supervisor`'s streams from `queue`.
    ///
    /// `linger` bounds how long a partial batch waits for more records.
    pub fn new(
        supervisor: ChannelSupervisor,
        queue: Arc<IngestQueue>,
        metrics: Arc<dyn MetricSink>,
        linger: Duration,
    ) -> Self {
        Self {
            supervisor,
            queue,
            metrics,
            linger,
        }
    }

    /// Run until an iteration fails.
    ///
    /// The error is returned rather than retried: a broken write must not be
    /// mistaken for progress. Restarting is up to the owner of the task.
    pub async fn run(&self) -> Result<(), InfiniteTracingError> {
        info!(mode = ?self.supervisor.mode(), "Infinite Tracing sender started");
        loop {
            if let Err(e) = self.poll_and_write().await {
                match &e {
                    InfiniteTracingError::Delivery(DeliveryError::PermanentlyDisconnected) => {
                        info!("Infinite Tracing is permanently disconnected, sender stopping");
                    }
                    _ => error!(error = %e, "Infinite Tracing sender stopped"),
                }
                return Err(e);
            }
        }
    }

    /// One delivery attempt: at most one message is written.
    pub async fn poll_and_write(&self) -> Result<(), InfiniteTracingError> {
        let Some(stream) = self.supervisor.stream_handle().await? else {
            debug!("No stream available, skipping iteration");
            tokio::time::sleep(UNAVAILABLE_WAIT).await;
            return Ok(());
        };

        if !stream.is_ready() {
            self.metrics.increment_counter(metrics::NOT_READY);
            tokio::time::sleep(NOT_READY_WAIT).await;
            return Ok(());
        }

        match self.supervisor.mode() {
            StreamMode::Single => self.write_single(&stream).await,
            StreamMode::Batch => self.write_batch(&stream).await,
        }
    }

    async fn write_single(&self, stream: &SpanStream) -> Result<(), InfiniteTracingError> {
        let Some(record) = self.queue.poll(POLL_TIMEOUT).await else {
            return Ok(());
        };
        self.write(stream, WireItem::Span(to_wire_span(&record)))
    }

    async fn write_batch(&self, stream: &SpanStream) -> Result<(), InfiniteTracingError> {
        if self.queue.wait_for(1, POLL_TIMEOUT).await == 0 {
            return Ok(());
        }
        if self.queue.len() < MAX_BATCH_SIZE && !self.linger.is_zero() {
            self.queue.wait_for(MAX_BATCH_SIZE, self.linger).await;
        }

        let records = self.queue.drain(MAX_BATCH_SIZE);
        if records.is_empty() {
            return Ok(());
        }
        self.write(stream, WireItem::Batch(to_wire_batch(&records)))
    }

    fn write(&self, stream: &SpanStream, item: WireItem) -> Result<(), InfiniteTracingError> {
        let spans = item.span_count() as u64;
        let bytes = item.encoded_len() as u64;
        stream.send(item)?;
        self.metrics.increment_counter_by(metrics::SPAN_SENT, spans);
        self.metrics.increment_counter_by(metrics::OUTPUT_BYTES, bytes);
        Ok(())
    }
}

impl std::fmt::Debug for DeliveryLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryLoop")
            .field("supervisor", &self.supervisor)
            .field("queued", &self.queue.len())
            .field("linger", &self.linger)
            .finish()
    }
}
