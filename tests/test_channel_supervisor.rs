//! Tests for channel and stream lifecycle management

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use infinite_tracing::delivery::{
    BackoffSchedule, CancelCause, ChannelSupervisor, ConnectionState, StreamMode,
};
use infinite_tracing::error::{DeliveryError, InfiniteTracingError, TransportError};
use infinite_tracing::metrics;
use infinite_tracing::{Credentials, MockIngestTransport, RecordingMetricSink};
use secrecy::ExposeSecret;

fn supervisor(
    transport: &MockIngestTransport,
    mode: StreamMode,
) -> (ChannelSupervisor, Arc<RecordingMetricSink>) {
    let metrics = Arc::new(RecordingMetricSink::new());
    let supervisor = ChannelSupervisor::new(
        Arc::new(transport.clone()),
        mode,
        Credentials::new("token-1", BTreeMap::new()),
        BackoffSchedule::new(vec![Duration::from_millis(100)]),
        metrics.clone(),
    );
    (supervisor, metrics)
}

#[tokio::test]
async fn test_first_handle_connects_and_later_handles_reuse_stream() {
    let transport = MockIngestTransport::new();
    let (supervisor, metrics) = supervisor(&transport, StreamMode::Single);

    let first = supervisor.stream_handle().await.unwrap().unwrap();
    let second = supervisor.stream_handle().await.unwrap().unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(first.mode(), StreamMode::Single);
    assert_eq!(transport.channels_built(), 1);
    assert_eq!(metrics.count(metrics::CONNECT), 1);
    assert_eq!(
        supervisor.connection_status().state(),
        ConnectionState::Connected
    );
}

#[tokio::test]
async fn test_batch_supervisor_opens_batch_streams() {
    let transport = MockIngestTransport::new();
    let (supervisor, _) = supervisor(&transport, StreamMode::Batch);

    let stream = supervisor.stream_handle().await.unwrap().unwrap();
    assert_eq!(stream.mode(), StreamMode::Batch);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_channel() {
    let transport = MockIngestTransport::new();
    let (supervisor, metrics) = supervisor(&transport, StreamMode::Single);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let supervisor = supervisor.clone();
        handles.push(tokio::spawn(async move {
            supervisor.stream_handle().await.unwrap().unwrap().id()
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }

    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(transport.channels_built(), 1);
    assert_eq!(metrics.count(metrics::CONNECT), 1);
}

#[tokio::test]
async fn test_stream_handle_waits_for_backoff_to_finish() {
    let transport = MockIngestTransport::new();
    let (supervisor, _) = supervisor(&transport, StreamMode::Single);
    supervisor.stream_handle().await.unwrap();

    let started = Instant::now();
    let backing_off = supervisor.clone();
    let backoff = tokio::spawn(async move {
        backing_off
            .shutdown_and_backoff(Duration::from_millis(300))
            .await;
        Instant::now()
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let fetching = supervisor.clone();
    let fetch = tokio::spawn(async move {
        let stream = fetching.stream_handle().await.unwrap();
        (stream.is_some(), Instant::now())
    });

    let backoff_done = backoff.await.unwrap();
    let (reconnected, fetch_done) = fetch.await.unwrap();

    assert!(reconnected);
    assert!(fetch_done >= backoff_done);
    assert!(fetch_done.duration_since(started) >= Duration::from_millis(300));
    assert_eq!(transport.channels_built(), 2);
    assert_eq!(transport.channels_shut_down(), 1);
}

#[tokio::test]
async fn test_earlier_backoff_cannot_cut_a_later_one_short() {
    let transport = MockIngestTransport::new();
    let (supervisor, _) = supervisor(&transport, StreamMode::Single);
    supervisor.stream_handle().await.unwrap();

    let slow = supervisor.clone();
    let first = tokio::spawn(async move {
        slow.shutdown_and_backoff(Duration::from_millis(300)).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // An immediate restart takes over and reconnects while the first cycle sleeps
    supervisor.shutdown_and_backoff(Duration::ZERO).await;
    assert!(supervisor.stream_handle().await.unwrap().is_some());

    let started = Instant::now();
    let long = supervisor.clone();
    let second = tokio::spawn(async move {
        long.shutdown_and_backoff(Duration::from_millis(800)).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stream = supervisor.stream_handle().await.unwrap();
    let waited = started.elapsed();

    assert!(stream.is_some());
    assert!(
        waited >= Duration::from_millis(800),
        "stream_handle returned after {:?}",
        waited
    );
    first.await.unwrap();
    second.await.unwrap();
}

#[tokio::test]
async fn test_failed_build_leaves_supervisor_retryable() {
    let transport = MockIngestTransport::new().with_failed_builds(1);
    let (supervisor, metrics) = supervisor(&transport, StreamMode::Single);

    let first = supervisor.stream_handle().await;
    assert!(matches!(
        first,
        Err(InfiniteTracingError::Transport(TransportError::ChannelBuild(_)))
    ));
    assert_eq!(
        supervisor.connection_status().state(),
        ConnectionState::Disconnected
    );
    assert_eq!(metrics.count(metrics::CONNECT), 0);

    assert!(supervisor.stream_handle().await.unwrap().is_some());
    assert_eq!(transport.channels_built(), 1);
    assert_eq!(transport.credentials_seen().len(), 2);
}

#[tokio::test]
async fn test_force_rebuild_cancels_with_closing_cause() {
    let transport = MockIngestTransport::new();
    let (supervisor, _) = supervisor(&transport, StreamMode::Single);

    let old = supervisor.stream_handle().await.unwrap().unwrap();
    supervisor.force_rebuild_stream();

    assert_eq!(
        old.cancellation().map(|c| c.cause),
        Some(CancelCause::ChannelClosing)
    );
    assert!(supervisor.current_stream().is_none());

    let new = supervisor.stream_handle().await.unwrap().unwrap();
    assert_ne!(old.id(), new.id());
    assert_eq!(transport.channels_built(), 1);
    assert_eq!(transport.streams_opened(), 2);
}

#[tokio::test]
async fn test_completed_stream_is_rebuilt_on_next_use() {
    let transport = MockIngestTransport::new();
    let (supervisor, metrics) = supervisor(&transport, StreamMode::Single);

    let old = supervisor.stream_handle().await.unwrap().unwrap();
    transport.complete_current_stream();
    let new = supervisor.stream_handle().await.unwrap().unwrap();

    assert_ne!(old.id(), new.id());
    assert!(old.is_cancelled());
    assert_eq!(metrics.count(metrics::RESPONSE_COMPLETED), 1);

    let again = supervisor.stream_handle().await.unwrap().unwrap();
    assert_eq!(new.id(), again.id());
}

#[tokio::test]
async fn test_completion_of_replaced_stream_does_not_rebuild_current() {
    let transport = MockIngestTransport::new();
    let (supervisor, metrics) = supervisor(&transport, StreamMode::Single);

    supervisor.stream_handle().await.unwrap().unwrap();
    supervisor.force_rebuild_stream();
    let current = supervisor.stream_handle().await.unwrap().unwrap();
    assert_eq!(transport.streams_opened(), 2);

    transport.complete_stream(0);
    let after_stale = supervisor.stream_handle().await.unwrap().unwrap();
    assert_eq!(after_stale.id(), current.id());
    assert!(!current.is_cancelled());
    assert_eq!(transport.streams_opened(), 2);
    assert_eq!(metrics.count(metrics::RESPONSE_COMPLETED), 1);

    transport.complete_current_stream();
    let rebuilt = supervisor.stream_handle().await.unwrap().unwrap();
    assert_ne!(rebuilt.id(), current.id());
    assert_eq!(transport.streams_opened(), 3);
}

#[tokio::test]
async fn test_shutdown_forever_is_idempotent_and_final() {
    let transport = MockIngestTransport::new();
    let (supervisor, _) = supervisor(&transport, StreamMode::Single);

    let stream = supervisor.stream_handle().await.unwrap().unwrap();
    supervisor.shutdown_forever();
    supervisor.shutdown_forever();

    assert!(stream.is_cancelled());
    assert_eq!(transport.channels_shut_down(), 1);
    assert!(matches!(
        supervisor.stream_handle().await,
        Err(InfiniteTracingError::Delivery(
            DeliveryError::PermanentlyDisconnected
        ))
    ));
    assert_eq!(
        supervisor.connection_status().state(),
        ConnectionState::Shutdown
    );
}

#[tokio::test]
async fn test_updated_credentials_apply_to_next_channel_only() {
    let transport = MockIngestTransport::new();
    let (supervisor, _) = supervisor(&transport, StreamMode::Single);

    let stream = supervisor.stream_handle().await.unwrap().unwrap();
    let mut metadata = BTreeMap::new();
    metadata.insert("entity.guid".to_string(), "guid-2".to_string());
    supervisor.update_credentials(Credentials::new("token-2", metadata));

    let same = supervisor.stream_handle().await.unwrap().unwrap();
    assert_eq!(stream.id(), same.id());
    assert_eq!(transport.channels_built(), 1);

    supervisor.shutdown_and_backoff(Duration::ZERO).await;
    supervisor.stream_handle().await.unwrap();

    let seen = transport.credentials_seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].agent_run_token.expose_secret(), "token-1");
    assert_eq!(seen[1].agent_run_token.expose_secret(), "token-2");
    assert_eq!(seen[1].request_metadata["entity.guid"], "guid-2");
}
