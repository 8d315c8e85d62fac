//! In-process stand-in for the trace observer
//!
//! [`MockIngestTransport`] implements [`ChannelFactory`] without a network.
//! It records every channel build and every message written, and lets a test
//! play the server's part by acknowledging, completing or failing the
//! current stream.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Notify;
use tokio::time::Instant;
use tonic::Status;

use crate::delivery::response::{ResponseListener, StreamFailure};
use crate::delivery::stream::{DEFAULT_OUTBOUND_BUFFER, OutboundStream, SpanStream, WireItem};
use crate::error::{InfiniteTracingError, TransportError};
use crate::proto::{RecordStatus, Span};
use crate::transport::{ChannelFactory, Credentials, IngestChannel};

#[derive(Default)]
struct MockState {
    credentials: Vec<Credentials>,
    channels_built: usize,
    channels_shut_down: usize,
    failed_builds_remaining: usize,
    listeners: Vec<ResponseListener>,
    sent: Vec<WireItem>,
}

/// Mock channel factory for tests
#[derive(Clone)]
pub struct MockIngestTransport {
    state: Arc<Mutex<MockState>>,
    sent_changed: Arc<Notify>,
    outbound_buffer: usize,
    stalled: bool,
}

impl MockIngestTransport {
    /// A transport whose streams accept and record everything
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            sent_changed: Arc::new(Notify::new()),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            stalled: false,
        }
    }

    /// Fail the next `count` channel builds
    pub fn with_failed_builds(self, count: usize) -> Self {
        self.lock().failed_builds_remaining = count;
        self
    }

    /// Never consume outbound messages, so streams fill up after `buffer` writes
    pub fn stalled(mut self, buffer: usize) -> Self {
        self.stalled = true;
        self.outbound_buffer = buffer;
        self
    }

    /// Number of channels built so far
    pub fn channels_built(&self) -> usize {
        self.lock().channels_built
    }

    /// Number of channels shut down so far
    pub fn channels_shut_down(&self) -> usize {
        self.lock().channels_shut_down
    }

    /// Number of streams opened across all channels
    pub fn streams_opened(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Credentials passed to each channel build, in order
    pub fn credentials_seen(&self) -> Vec<Credentials> {
        self.lock().credentials.clone()
    }

    /// Every message written to any stream, in arrival order
    pub fn sent_items(&self) -> Vec<WireItem> {
        self.lock().sent.clone()
    }

    /// Every span written, with batches flattened
    pub fn sent_spans(&self) -> Vec<Span> {
        self.lock()
            .sent
            .iter()
            .flat_map(|item| match item {
                WireItem::Span(span) => vec![span.clone()],
                WireItem::Batch(batch) => batch.spans.clone(),
            })
            .collect()
    }

    /// Wait until at least `count` messages were written; false on timeout
    pub async fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.sent_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().sent.len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.lock().sent.len() >= count;
            }
        }
    }

    /// Send an acknowledgement on the most recently opened stream
    pub fn acknowledge_current_stream(&self, messages_seen: u64) {
        if let Some(listener) = self.current_listener() {
            listener.on_next(RecordStatus { messages_seen });
        }
    }

    /// End the most recently opened stream cleanly
    pub fn complete_current_stream(&self) {
        if let Some(listener) = self.current_listener() {
            listener.on_completed();
        }
    }

    /// End the `index`th opened stream cleanly, counting from 0
    pub fn complete_stream(&self, index: usize) {
        let listener = self.lock().listeners.get(index).cloned();
        if let Some(listener) = listener {
            listener.on_completed();
        }
    }

    /// End the most recently opened stream with `status`.
    ///
    /// Resolves once the listener has finished reacting, including any backoff.
    pub async fn fail_current_stream(&self, status: Status) {
        if let Some(listener) = self.current_listener() {
            listener.on_error(StreamFailure::from_status(&status)).await;
        }
    }

    fn current_listener(&self) -> Option<ResponseListener> {
        self.lock().listeners.last().cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MockIngestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelFactory for MockIngestTransport {
    fn build_channel(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn IngestChannel>, InfiniteTracingError> {
        let mut state = self.lock();
        state.credentials.push(credentials.clone());
        if state.failed_builds_remaining > 0 {
            state.failed_builds_remaining -= 1;
            return Err(TransportError::ChannelBuild("mock build failure".to_string()).into());
        }
        state.channels_built += 1;
        Ok(Box::new(MockIngestChannel {
            transport: self.clone(),
        }))
    }
}

struct MockIngestChannel {
    transport: MockIngestTransport,
}

impl MockIngestChannel {
    fn collect<T>(&self, outbound: OutboundStream<T>, wrap: fn(T) -> WireItem)
    where
        T: Send + 'static,
    {
        if self.transport.stalled {
            // Keep the receiver alive so the buffer fills instead of closing
            tokio::spawn(async move {
                let _held = outbound;
                std::future::pending::<()>().await;
            });
            return;
        }
        let state = self.transport.state.clone();
        let sent_changed = self.transport.sent_changed.clone();
        tokio::spawn(async move {
            let mut outbound = outbound;
            while let Some(message) = outbound.next().await {
                state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .sent
                    .push(wrap(message));
                sent_changed.notify_waiters();
            }
        });
    }
}

impl IngestChannel for MockIngestChannel {
    fn record_span(&self, listener: ResponseListener) -> Result<SpanStream, InfiniteTracingError> {
        let (stream, outbound) = SpanStream::single(self.transport.outbound_buffer);
        self.collect(outbound, WireItem::Span);
        self.transport.lock().listeners.push(listener);
        Ok(stream)
    }

    fn record_span_batch(
        &self,
        listener: ResponseListener,
    ) -> Result<SpanStream, InfiniteTracingError> {
        let (stream, outbound) = SpanStream::batch(self.transport.outbound_buffer);
        self.collect(outbound, WireItem::Batch);
        self.transport.lock().listeners.push(listener);
        Ok(stream)
    }

    fn shutdown(&self) {
        self.transport.lock().channels_shut_down += 1;
    }
}
