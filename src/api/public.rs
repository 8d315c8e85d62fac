//! Public API for embedding Infinite Tracing in a host process
//!
//! [`InfiniteTracing`] owns the ingest queue, the channel supervisor and the
//! background sender task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::InfiniteTracingConfig;
use crate::delivery::{BackoffSchedule, ChannelSupervisor, DeliveryLoop, IngestQueue, StreamMode};
use crate::error::InfiniteTracingError;
use crate::metrics::{self, MetricSink, OtelMetricSink};
use crate::span::SpanRecord;
use crate::transport::{ChannelFactory, Credentials, GrpcChannelFactory};

struct Running {
    supervisor: ChannelSupervisor,
    worker: JoinHandle<()>,
}

/// Process-wide entry point for streaming spans to a trace observer
///
/// Producers call [`InfiniteTracing::accept`] from any thread; it never
/// blocks and never fails. Delivery happens on a background task started by
/// [`InfiniteTracing::start`].
///
/// # Example
///
/// ```no_run
/// use std::collections::BTreeMap;
/// use infinite_tracing::{ConfigBuilder, InfiniteTracing, SpanRecord};
///
/// # async fn example() -> Result<(), infinite_tracing::InfiniteTracingError> {
/// let config = ConfigBuilder::new()
///     .host("trace-observer.example.com")
///     .license_key("license-key")
///     .build()?;
/// let tracing = InfiniteTracing::from_config(config)?;
/// tracing.start("agent-run-token", BTreeMap::new()).await;
///
/// tracing.accept(SpanRecord::new("abc123").with_intrinsic("name", "GET /"));
///
/// tracing.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct InfiniteTracing {
    config: InfiniteTracingConfig,
    factory: Arc<dyn ChannelFactory>,
    metrics: Arc<dyn MetricSink>,
    queue: Arc<IngestQueue>,
    running: Mutex<Option<Running>>,
}

impl InfiniteTracing {
    /// Create a service with an explicit transport and metric sink.
    ///
    /// Fails if `config` does not validate. Nothing runs until [`Self::start`].
    pub fn new(
        config: InfiniteTracingConfig,
        factory: Arc<dyn ChannelFactory>,
        metrics: Arc<dyn MetricSink>,
    ) -> Result<Self, InfiniteTracingError> {
        config.validate()?;
        if let Some(percentage) = config.flaky_percentage {
            warn!(
                flaky_percentage = percentage,
                flaky_code = ?config.flaky_code,
                "Infinite Tracing fault injection is enabled, the trace observer will fail streams on purpose"
            );
        }
        let queue = Arc::new(IngestQueue::new(config.max_queue_size));
        Ok(Self {
            config,
            factory,
            metrics,
            queue,
            running: Mutex::new(None),
        })
    }

    /// Create a service that talks gRPC to the configured host and reports
    /// supportability metrics through OpenTelemetry.
    pub fn from_config(config: InfiniteTracingConfig) -> Result<Self, InfiniteTracingError> {
        let factory = Arc::new(GrpcChannelFactory::new(&config)?);
        Self::new(config, factory, Arc::new(OtelMetricSink::new()))
    }

    /// Start delivering, or restart with new credentials.
    ///
    /// The first call builds the supervisor and spawns the sender. Later
    /// calls swap in the new credentials and tear down the current channel
    /// so the next write reconnects with them. A sender that stopped after a
    /// write failure is replaced.
    pub async fn start(&self, agent_run_token: impl Into<String>, request_metadata: BTreeMap<String, String>) {
        let credentials = Credentials::new(agent_run_token, request_metadata);
        let mut running = self.running.lock().await;

        match running.as_mut() {
            None => {
                let supervisor = ChannelSupervisor::new(
                    self.factory.clone(),
                    self.mode(),
                    credentials,
                    BackoffSchedule::new(self.config.backoff_schedule()),
                    self.metrics.clone(),
                );
                let worker = self.spawn_worker(supervisor.clone());
                info!(
                    host = %self.config.host,
                    port = self.config.port,
                    batching = self.config.use_batching,
                    "Infinite Tracing started"
                );
                *running = Some(Running { supervisor, worker });
            }
            Some(current) if current.worker.is_finished() => {
                warn!("Infinite Tracing sender had stopped, starting a new one");
                current.supervisor.update_credentials(credentials);
                current.supervisor.force_rebuild_stream();
                current.worker = self.spawn_worker(current.supervisor.clone());
            }
            Some(current) => {
                debug!("Infinite Tracing already running, reconnecting with new credentials");
                current.supervisor.update_credentials(credentials);
                current.supervisor.shutdown_and_backoff(Duration::ZERO).await;
            }
        }
    }

    /// Stop the sender and close the channel for good. Idempotent.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.worker.abort();
        running.supervisor.shutdown_forever();
        info!(
            queued = self.queue.len(),
            dropped = self.queue.dropped_count(),
            "Infinite Tracing stopped"
        );
    }

    /// Queue a record for delivery. Drops it if the queue is full.
    pub fn accept(&self, record: SpanRecord) {
        self.metrics.increment_counter(metrics::SPAN_SEEN);
        if !self.queue.offer(record) {
            self.metrics.increment_counter(metrics::SPAN_DROPPED);
            debug!(
                capacity = self.queue.capacity(),
                "Infinite Tracing queue full, dropping span"
            );
        }
    }

    /// Whether a sender task is alive
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.worker.is_finished())
    }

    /// The active supervisor, if started
    pub async fn supervisor(&self) -> Option<ChannelSupervisor> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.supervisor.clone())
    }

    /// Records waiting for delivery
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Records dropped because the queue was full
    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped_count()
    }

    /// Configuration the service was built with
    pub fn config(&self) -> &InfiniteTracingConfig {
        &self.config
    }

    fn mode(&self) -> StreamMode {
        if self.config.use_batching {
            StreamMode::Batch
        } else {
            StreamMode::Single
        }
    }

    fn spawn_worker(&self, supervisor: ChannelSupervisor) -> JoinHandle<()> {
        let delivery = DeliveryLoop::new(
            supervisor,
            self.queue.clone(),
            self.metrics.clone(),
            self.config.linger(),
        );
        tokio::spawn(
            async move {
                let _ = delivery.run().await;
            }
            .instrument(info_span!("infinite_tracing_sender")),
        )
    }
}

impl std::fmt::Debug for InfiniteTracing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfiniteTracing")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("queued", &self.queue.len())
            .finish()
    }
}
