//! Tests for the worker that moves queued records onto streams

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use infinite_tracing::delivery::{
    BackoffSchedule, ChannelSupervisor, DeliveryLoop, IngestQueue, ResponseListener, SpanStream,
    StreamMode, WireItem,
};
use infinite_tracing::error::{DeliveryError, InfiniteTracingError};
use infinite_tracing::metrics;
use infinite_tracing::{
    ChannelFactory, Credentials, IngestChannel, MockIngestTransport, RecordingMetricSink,
    SpanRecord,
};

struct Harness {
    transport: MockIngestTransport,
    supervisor: ChannelSupervisor,
    queue: Arc<IngestQueue>,
    metrics: Arc<RecordingMetricSink>,
    delivery: DeliveryLoop,
}

fn harness_with(
    factory: Arc<dyn ChannelFactory>,
    transport: MockIngestTransport,
    mode: StreamMode,
    linger: Duration,
) -> Harness {
    let metrics = Arc::new(RecordingMetricSink::new());
    let supervisor = ChannelSupervisor::new(
        factory,
        mode,
        Credentials::new("token", BTreeMap::new()),
        BackoffSchedule::new(vec![Duration::from_millis(50)]),
        metrics.clone(),
    );
    let queue = Arc::new(IngestQueue::new(1_000));
    let delivery = DeliveryLoop::new(supervisor.clone(), queue.clone(), metrics.clone(), linger);
    Harness {
        transport,
        supervisor,
        queue,
        metrics,
        delivery,
    }
}

fn harness(transport: MockIngestTransport, mode: StreamMode, linger: Duration) -> Harness {
    harness_with(Arc::new(transport.clone()), transport, mode, linger)
}

#[tokio::test]
async fn test_single_mode_sends_one_record_per_iteration() {
    let h = harness(MockIngestTransport::new(), StreamMode::Single, Duration::ZERO);
    h.queue.offer(SpanRecord::new("first"));
    h.queue.offer(SpanRecord::new("second"));

    h.delivery.poll_and_write().await.unwrap();
    h.delivery.poll_and_write().await.unwrap();

    assert!(h.transport.wait_for_sent(2, Duration::from_secs(2)).await);
    let ids: Vec<String> = h
        .transport
        .sent_spans()
        .into_iter()
        .map(|s| s.trace_id)
        .collect();
    assert_eq!(ids, vec!["first", "second"]);
    assert_eq!(h.metrics.count(metrics::SPAN_SENT), 2);
    assert!(h.metrics.count(metrics::OUTPUT_BYTES) > 0);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn test_empty_queue_iteration_is_a_no_op() {
    let h = harness(MockIngestTransport::new(), StreamMode::Single, Duration::ZERO);

    tokio::time::timeout(Duration::from_secs(2), h.delivery.poll_and_write())
        .await
        .expect("poll must be bounded")
        .unwrap();

    assert_eq!(h.metrics.count(metrics::SPAN_SENT), 0);
    assert!(h.transport.sent_items().is_empty());
}

#[tokio::test]
async fn test_not_ready_stream_leaves_records_queued() {
    let h = harness(
        MockIngestTransport::new().stalled(1),
        StreamMode::Single,
        Duration::ZERO,
    );
    h.queue.offer(SpanRecord::new("fills-buffer"));
    h.queue.offer(SpanRecord::new("waits"));

    h.delivery.poll_and_write().await.unwrap();
    assert_eq!(h.queue.len(), 1);

    h.delivery.poll_and_write().await.unwrap();
    assert_eq!(h.metrics.count(metrics::NOT_READY), 1);
    assert_eq!(h.queue.len(), 1);
    assert_eq!(h.metrics.count(metrics::SPAN_SENT), 1);
}

#[tokio::test]
async fn test_batch_mode_drains_up_to_max_batch_size() {
    let h = harness(MockIngestTransport::new(), StreamMode::Batch, Duration::ZERO);
    for i in 0..150 {
        h.queue.offer(SpanRecord::new(format!("trace-{}", i)));
    }

    h.delivery.poll_and_write().await.unwrap();
    h.delivery.poll_and_write().await.unwrap();

    assert!(h.transport.wait_for_sent(2, Duration::from_secs(2)).await);
    let sizes: Vec<usize> = h
        .transport
        .sent_items()
        .iter()
        .map(WireItem::span_count)
        .collect();
    assert_eq!(sizes, vec![infinite_tracing::MAX_BATCH_SIZE, 50]);
    assert_eq!(h.metrics.count(metrics::SPAN_SENT), 150);
    assert_eq!(h.transport.sent_spans()[0].trace_id, "trace-0");
}

#[tokio::test]
async fn test_batch_mode_never_sends_empty_batches() {
    let h = harness(MockIngestTransport::new(), StreamMode::Batch, Duration::ZERO);

    h.delivery.poll_and_write().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.transport.sent_items().is_empty());
}

#[tokio::test]
async fn test_batch_linger_collects_late_records() {
    let h = harness(
        MockIngestTransport::new(),
        StreamMode::Batch,
        Duration::from_millis(300),
    );
    h.queue.offer(SpanRecord::new("early"));
    let queue = h.queue.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.offer(SpanRecord::new("late"));
    });

    h.delivery.poll_and_write().await.unwrap();

    assert!(h.transport.wait_for_sent(1, Duration::from_secs(2)).await);
    assert_eq!(h.transport.sent_items().len(), 1);
    assert_eq!(h.transport.sent_spans().len(), 2);
}

#[tokio::test]
async fn test_run_stops_when_permanently_disconnected() {
    let h = harness(MockIngestTransport::new(), StreamMode::Single, Duration::ZERO);
    h.supervisor.shutdown_forever();

    let result = tokio::time::timeout(Duration::from_secs(2), h.delivery.run())
        .await
        .expect("run should return");
    assert!(matches!(
        result,
        Err(InfiniteTracingError::Delivery(
            DeliveryError::PermanentlyDisconnected
        ))
    ));
}

/// Opens batch streams even when asked for single-span streams.
struct MismatchedFactory;

struct MismatchedChannel;

impl ChannelFactory for MismatchedFactory {
    fn build_channel(
        &self,
        _credentials: &Credentials,
    ) -> Result<Box<dyn IngestChannel>, InfiniteTracingError> {
        Ok(Box::new(MismatchedChannel))
    }
}

impl IngestChannel for MismatchedChannel {
    fn record_span(&self, _listener: ResponseListener) -> Result<SpanStream, InfiniteTracingError> {
        let (stream, outbound) = SpanStream::batch(8);
        tokio::spawn(async move {
            let _held = outbound;
            std::future::pending::<()>().await;
        });
        Ok(stream)
    }

    fn record_span_batch(
        &self,
        listener: ResponseListener,
    ) -> Result<SpanStream, InfiniteTracingError> {
        self.record_span(listener)
    }

    fn shutdown(&self) {}
}

#[tokio::test]
async fn test_write_failure_propagates_and_record_is_not_retried() {
    let h = harness_with(
        Arc::new(MismatchedFactory),
        MockIngestTransport::new(),
        StreamMode::Single,
        Duration::ZERO,
    );
    h.queue.offer(SpanRecord::new("doomed"));

    let result = h.delivery.run().await;

    assert!(matches!(
        result,
        Err(InfiniteTracingError::Delivery(
            DeliveryError::UnsupportedStreamItem { .. }
        ))
    ));
    assert!(h.queue.is_empty());
    assert_eq!(h.metrics.count(metrics::SPAN_SENT), 0);
}

#[tokio::test]
async fn test_write_to_stream_rebuilt_during_poll_fails() {
    let h = harness(MockIngestTransport::new(), StreamMode::Single, Duration::ZERO);
    h.supervisor.stream_handle().await.unwrap();

    let (result, ()) = tokio::join!(h.delivery.poll_and_write(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.supervisor.force_rebuild_stream();
        h.queue.offer(SpanRecord::new("stale"));
    });

    assert!(matches!(
        result,
        Err(InfiniteTracingError::Delivery(DeliveryError::StreamClosed(_)))
    ));
    assert!(h.queue.is_empty());
    assert_eq!(h.metrics.count(metrics::SPAN_SENT), 0);
    assert_eq!(h.metrics.count(metrics::OUTPUT_BYTES), 0);
    assert!(h.transport.sent_items().is_empty());
}
