//! Channel and stream lifecycle
//!
//! [`ChannelSupervisor`] owns at most one live channel and the stream opened
//! on it. Every delivery attempt asks it for the current [`SpanStream`]; it
//! builds, rebuilds and tears down the pair, serialising channel creation
//! through [`ConnectionStatus`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::delivery::backoff::BackoffSchedule;
use crate::delivery::connection::{BlockDecision, ConnectionStatus};
use crate::delivery::disconnection::DisconnectionHandler;
use crate::delivery::response::ResponseListener;
use crate::delivery::stream::{CancelCause, SpanStream, StreamMode};
use crate::error::{DeliveryError, InfiniteTracingError};
use crate::metrics::{self, MetricSink};
use crate::transport::{ChannelFactory, Credentials, IngestChannel};

struct ActiveChannel {
    channel: Box<dyn IngestChannel>,
    stream: Option<Arc<SpanStream>>,
    generation: u64,
}

struct SupervisorInner {
    factory: Arc<dyn ChannelFactory>,
    mode: StreamMode,
    status: Arc<ConnectionStatus>,
    credentials: RwLock<Credentials>,
    active: Mutex<Option<ActiveChannel>>,
    rebuild_requested: Arc<AtomicU64>,
    disconnection: Arc<DisconnectionHandler>,
    metrics: Arc<dyn MetricSink>,
    shut_down: AtomicBool,
    generation: AtomicU64,
}

/// Owner of the channel and stream used to reach the trace observer.
///
/// Cheap to clone; all clones share one channel.
#[derive(Clone)]
pub struct ChannelSupervisor {
    inner: Arc<SupervisorInner>,
}

/// Non-owning reference held by the [`DisconnectionHandler`].
#[derive(Clone)]
pub struct WeakChannelSupervisor {
    inner: Weak<SupervisorInner>,
}

impl WeakChannelSupervisor {
    /// The supervisor, if it is still alive
    pub fn upgrade(&self) -> Option<ChannelSupervisor> {
        self.inner.upgrade().map(|inner| ChannelSupervisor { inner })
    }
}

impl ChannelSupervisor {
    /// Create a supervisor that opens `mode` streams on channels from `factory`.
    ///
    /// No channel is built until the first call to [`Self::stream_handle`].
    pub fn new(
        factory: Arc<dyn ChannelFactory>,
        mode: StreamMode,
        credentials: Credentials,
        backoff: BackoffSchedule,
        metrics: Arc<dyn MetricSink>,
    ) -> Self {
        let status = Arc::new(ConnectionStatus::new());
        let inner = Arc::new_cyclic(|weak| {
            let disconnection = Arc::new(DisconnectionHandler::new(
                status.clone(),
                backoff,
                metrics.clone(),
                WeakChannelSupervisor {
                    inner: weak.clone(),
                },
            ));
            SupervisorInner {
                factory,
                mode,
                status,
                credentials: RwLock::new(credentials),
                active: Mutex::new(None),
                rebuild_requested: Arc::new(AtomicU64::new(0)),
                disconnection,
                metrics,
                shut_down: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }
        });
        Self { inner }
    }

    /// Stream shape this supervisor opens
    pub fn mode(&self) -> StreamMode {
        self.inner.mode
    }

    /// Shared connection state
    pub fn connection_status(&self) -> Arc<ConnectionStatus> {
        self.inner.status.clone()
    }

    /// Handler that reacts to failures on streams opened here
    pub fn disconnection_handler(&self) -> Arc<DisconnectionHandler> {
        self.inner.disconnection.clone()
    }

    /// The stream currently cached, without connecting or rebuilding
    pub fn current_stream(&self) -> Option<Arc<SpanStream>> {
        self.lock_active()
            .as_ref()
            .and_then(|active| active.stream.clone())
    }

    /// Stream to write the next message to.
    ///
    /// Waits while another task is connecting or backing off. Returns
    /// `Ok(None)` when the connection was torn down between the wait and the
    /// lookup; the caller should simply try again. Fails with
    /// [`DeliveryError::PermanentlyDisconnected`] once shut down, and with the
    /// factory's error when a channel cannot be built.
    pub async fn stream_handle(&self) -> Result<Option<Arc<SpanStream>>, InfiniteTracingError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(DeliveryError::PermanentlyDisconnected.into());
        }

        match self.inner.status.block_on_connection().await {
            BlockDecision::GoAwayForever => Err(DeliveryError::PermanentlyDisconnected.into()),
            BlockDecision::MustAttemptConnection => self.connect(),
            BlockDecision::AlreadyConnected => self.current_or_rebuild(),
        }
    }

    /// Drop the cached stream so the next [`Self::stream_handle`] opens a new one.
    pub fn force_rebuild_stream(&self) {
        let mut active = self.lock_active();
        if let Some(stream) = active.as_mut().and_then(|active| active.stream.take()) {
            debug!(stream_id = stream.id(), "Forcing stream rebuild");
            stream.cancel("Rebuilding stream", CancelCause::ChannelClosing);
        }
    }

    /// Tear down the channel, wait `wait`, then allow reconnection.
    ///
    /// Callers of [`Self::stream_handle`] block until this returns.
    ///
    /// A later call supersedes one still sleeping: only the most recent
    /// cycle ends the backoff.
    pub async fn shutdown_and_backoff(&self, wait: Duration) {
        let epoch = self.inner.status.begin_backoff();
        self.teardown("Shutting down channel for backoff");
        let Some(epoch) = epoch else {
            return;
        };
        if !wait.is_zero() {
            info!(backoff_secs = wait.as_secs(), epoch, "Backing off before reconnecting");
        }
        tokio::time::sleep(wait).await;
        self.inner.status.reattempt_connection(epoch);
    }

    /// Tear down the channel and refuse all future connections. Idempotent.
    pub fn shutdown_forever(&self) {
        let first = !self.inner.shut_down.swap(true, Ordering::AcqRel);
        self.inner.status.shut_down_forever();
        self.teardown("Shutting down channel forever");
        if first {
            info!("Infinite Tracing channel shut down forever");
        }
    }

    /// Replace the credentials used by the next channel build.
    ///
    /// An already open stream keeps the credentials it was built with.
    pub fn update_credentials(&self, credentials: Credentials) {
        *self
            .inner
            .credentials
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = credentials;
        debug!("Updated Infinite Tracing credentials");
    }

    fn connect(&self) -> Result<Option<Arc<SpanStream>>, InfiniteTracingError> {
        let credentials = self
            .inner
            .credentials
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let channel = match self.inner.factory.build_channel(&credentials) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "Failed to build Infinite Tracing channel");
                self.inner.status.failed_to_connect();
                return Err(e);
            }
        };

        let generation = self.next_generation();
        self.inner.rebuild_requested.store(0, Ordering::Release);
        let stream = match self.open_stream(channel.as_ref(), generation) {
            Ok(stream) => Arc::new(stream),
            Err(e) => {
                warn!(error = %e, "Failed to open Infinite Tracing stream");
                channel.shutdown();
                self.inner.status.failed_to_connect();
                return Err(e);
            }
        };

        {
            let mut active = self.lock_active();
            if let Some(stale) = active.take() {
                close(stale, "Replacing stale channel");
            }
            *active = Some(ActiveChannel {
                channel,
                stream: Some(stream.clone()),
                generation,
            });
        }

        if !self.inner.status.did_connect() {
            // Overtaken by a backoff or shutdown while building
            self.teardown_generation(generation);
            return Ok(None);
        }

        self.inner.metrics.increment_counter(metrics::CONNECT);
        info!(
            stream_id = stream.id(),
            mode = ?self.inner.mode,
            "Connected to Infinite Tracing trace observer"
        );
        Ok(Some(stream))
    }

    fn current_or_rebuild(&self) -> Result<Option<Arc<SpanStream>>, InfiniteTracingError> {
        let mut guard = self.lock_active();
        let Some(active) = guard.as_mut() else {
            return Ok(None);
        };

        // Completions of streams already replaced are stale
        let completed = self.inner.rebuild_requested.swap(0, Ordering::AcqRel);
        let rebuild = completed != 0 && completed == active.generation;
        if !rebuild && let Some(stream) = &active.stream {
            return Ok(Some(stream.clone()));
        }

        if let Some(old) = active.stream.take() {
            old.cancel("Rebuilding stream", CancelCause::ChannelClosing);
        }
        let generation = self.next_generation();
        match self.open_stream(active.channel.as_ref(), generation) {
            Ok(stream) => {
                let stream = Arc::new(stream);
                debug!(stream_id = stream.id(), "Rebuilt Infinite Tracing stream");
                active.stream = Some(stream.clone());
                active.generation = generation;
                Ok(Some(stream))
            }
            Err(e) => {
                warn!(error = %e, "Failed to rebuild Infinite Tracing stream");
                Err(e)
            }
        }
    }

    fn open_stream(
        &self,
        channel: &dyn IngestChannel,
        generation: u64,
    ) -> Result<SpanStream, InfiniteTracingError> {
        let listener = ResponseListener::new(
            generation,
            self.inner.disconnection.clone(),
            self.inner.metrics.clone(),
            self.inner.rebuild_requested.clone(),
        );
        match self.inner.mode {
            StreamMode::Single => channel.record_span(listener),
            StreamMode::Batch => channel.record_span_batch(listener),
        }
    }

    fn teardown(&self, reason: &str) {
        let taken = self.lock_active().take();
        if let Some(active) = taken {
            close(active, reason);
        }
    }

    fn teardown_generation(&self, generation: u64) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|a| a.generation == generation)
            && let Some(stale) = active.take()
        {
            close(stale, "Discarding overtaken connection attempt");
        }
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveChannel>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn close(active: ActiveChannel, reason: &str) {
    if let Some(stream) = active.stream {
        stream.cancel(reason, CancelCause::ChannelClosing);
    }
    active.channel.shutdown();
    debug!(generation = active.generation, reason, "Closed Infinite Tracing channel");
}

impl std::fmt::Debug for ChannelSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSupervisor")
            .field("mode", &self.inner.mode)
            .field("state", &self.inner.status.state())
            .field("shut_down", &self.inner.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}
