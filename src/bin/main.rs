//! Infinite Tracing relay
//!
//! Streams spans from an in-process OpenTelemetry tracer to a trace observer.
//! Configuration comes from the YAML file given as the first argument, or
//! from `INFINITE_TRACING_*` environment variables. A heartbeat span is
//! emitted periodically so a fresh deployment can be verified end to end.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use infinite_tracing::{ConfigLoader, InfiniteTracing, InfiniteTracingSpanExporter};
use opentelemetry::KeyValue;
use opentelemetry::trace::{Span as _, Tracer as _, TracerProvider as _};
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::{info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ConfigLoader::from_yaml(&path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => ConfigLoader::from_env().context("failed to load configuration from environment")?,
    };
    let agent_run_token = std::env::var("INFINITE_TRACING_AGENT_RUN_TOKEN")
        .context("INFINITE_TRACING_AGENT_RUN_TOKEN must be set")?;

    let service = Arc::new(InfiniteTracing::from_config(config)?);
    service.start(agent_run_token, BTreeMap::new()).await;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(InfiniteTracingSpanExporter::new(service.clone()))
        .build();
    let tracer = provider.tracer("infinite-tracing-relay");

    info!("Infinite Tracing relay started");

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut beats: i64 = 0;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                break;
            }
            _ = heartbeat.tick() => {
                beats += 1;
                let mut span = tracer.start("heartbeat");
                span.set_attribute(KeyValue::new("heartbeat.count", beats));
                span.set_attribute(KeyValue::new("heartbeat.queued", service.queue_len() as i64));
                span.end();
            }
        }
    }

    info!("Shutting down...");
    if let Err(e) = provider.shutdown() {
        warn!(error = %e, "Tracer provider shutdown failed");
    }
    service.stop().await;

    Ok(())
}
