//! tonic implementation of the transport seam
//!
//! Channels connect lazily, so building one never touches the network.
//! Each stream runs on its own task that pumps acknowledgements into the
//! stream's [`ResponseListener`] until the call ends or is cancelled.

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::watch;
use tonic::client::Grpc;
use tonic::codec::CompressionEncoding;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{GrpcMethod, Request};
use tonic_prost::ProstCodec;
use tracing::debug;

use crate::config::InfiniteTracingConfig;
use crate::delivery::response::{ResponseListener, StreamFailure};
use crate::delivery::stream::{
    CancelCause, Cancellation, DEFAULT_OUTBOUND_BUFFER, OutboundStream, SpanStream, cancelled,
};
use crate::error::{InfiniteTracingError, TransportError};
use crate::proto::{INGEST_SERVICE, RECORD_SPAN_BATCH_PATH, RECORD_SPAN_PATH, RecordStatus};
use crate::transport::{ChannelFactory, Credentials, IngestChannel};

/// Builds tonic channels to the configured trace observer.
#[derive(Debug, Clone)]
pub struct GrpcChannelFactory {
    host: String,
    port: u16,
    use_plaintext: bool,
    license_key: SecretString,
    compression: Option<CompressionEncoding>,
    flaky_percentage: Option<f64>,
    flaky_code: Option<i32>,
}

impl GrpcChannelFactory {
    /// Create a factory from validated configuration
    pub fn new(config: &InfiniteTracingConfig) -> Result<Self, InfiniteTracingError> {
        let compression = match config.compression.as_deref() {
            None => None,
            Some("gzip") => Some(CompressionEncoding::Gzip),
            Some("zstd") => Some(CompressionEncoding::Zstd),
            Some(other) => {
                return Err(TransportError::UnsupportedCompression(other.to_string()).into());
            }
        };

        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            use_plaintext: config.use_plaintext,
            license_key: config.license_key.clone(),
            compression,
            flaky_percentage: config.flaky_percentage,
            flaky_code: config.flaky_code,
        })
    }

    fn endpoint(&self) -> Result<Endpoint, InfiniteTracingError> {
        let scheme = if self.use_plaintext { "http" } else { "https" };
        let endpoint = Endpoint::from_shared(format!("{}://{}:{}", scheme, self.host, self.port))
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;

        if self.use_plaintext {
            return Ok(endpoint);
        }

        let tls = ClientTlsConfig::new()
            .with_webpki_roots()
            .domain_name(self.host.clone());
        Ok(endpoint
            .tls_config(tls)
            .map_err(|e| TransportError::Tls(e.to_string()))?)
    }

    fn metadata(&self, credentials: &Credentials) -> Result<MetadataMap, InfiniteTracingError> {
        let mut metadata = MetadataMap::new();
        insert_header(&mut metadata, "license_key", self.license_key.expose_secret())?;
        insert_header(
            &mut metadata,
            "agent_run_token",
            credentials.agent_run_token.expose_secret(),
        )?;
        for (key, value) in &credentials.request_metadata {
            insert_header(&mut metadata, &key.to_lowercase(), value)?;
        }
        if let Some(percentage) = self.flaky_percentage {
            insert_header(&mut metadata, "flaky", &percentage.to_string())?;
        }
        if let Some(code) = self.flaky_code {
            insert_header(&mut metadata, "flaky_code", &code.to_string())?;
        }
        Ok(metadata)
    }
}

fn insert_header(
    metadata: &mut MetadataMap,
    key: &str,
    value: &str,
) -> Result<(), InfiniteTracingError> {
    let name = AsciiMetadataKey::from_bytes(key.as_bytes())
        .map_err(|e| TransportError::InvalidMetadata(format!("{}: {}", key, e)))?;
    let value = AsciiMetadataValue::try_from(value)
        .map_err(|e| TransportError::InvalidMetadata(format!("{}: {}", key, e)))?;
    metadata.insert(name, value);
    Ok(())
}

impl ChannelFactory for GrpcChannelFactory {
    fn build_channel(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn IngestChannel>, InfiniteTracingError> {
        let metadata = self.metadata(credentials)?;
        let channel = self.endpoint()?.connect_lazy();
        let (closed, _) = watch::channel(false);
        debug!(
            host = %self.host,
            port = self.port,
            plaintext = self.use_plaintext,
            compression = ?self.compression,
            "Built Infinite Tracing channel"
        );
        Ok(Box::new(GrpcIngestChannel {
            channel,
            metadata,
            compression: self.compression,
            closed,
        }))
    }
}

struct GrpcIngestChannel {
    channel: Channel,
    metadata: MetadataMap,
    compression: Option<CompressionEncoding>,
    closed: watch::Sender<bool>,
}

enum Outcome {
    Completed,
    Failed(StreamFailure),
}

impl GrpcIngestChannel {
    fn open<T>(
        &self,
        stream: &SpanStream,
        outbound: OutboundStream<T>,
        path: &'static str,
        method: &'static str,
        listener: ResponseListener,
    ) where
        T: prost::Message + Send + Sync + 'static,
    {
        let mut grpc = Grpc::new(self.channel.clone());
        if let Some(encoding) = self.compression {
            grpc = grpc.send_compressed(encoding);
        }

        let mut request = Request::new(outbound);
        *request.metadata_mut() = self.metadata.clone();
        request
            .extensions_mut()
            .insert(GrpcMethod::new(INGEST_SERVICE, method));

        let cancellation = stream.subscribe_cancellation();
        let mut closed = self.closed.subscribe();
        let stream_id = stream.id();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                cancellation = cancelled(cancellation) => {
                    let cancellation = cancellation.unwrap_or_else(|| Cancellation {
                        reason: "stream handle dropped".to_string(),
                        cause: CancelCause::ChannelClosing,
                    });
                    Outcome::Failed(StreamFailure::from_cancellation(cancellation))
                }
                _ = async { let _ = closed.wait_for(|closed| *closed).await; } => {
                    Outcome::Failed(StreamFailure::from_cancellation(Cancellation {
                        reason: "channel shut down".to_string(),
                        cause: CancelCause::ChannelClosing,
                    }))
                }
                outcome = exchange(grpc, request, path, &listener) => outcome,
            };

            debug!(stream_id, "Infinite Tracing stream ended");
            match outcome {
                Outcome::Completed => listener.on_completed(),
                Outcome::Failed(failure) => listener.on_error(failure).await,
            }
        });
    }
}

async fn exchange<T>(
    mut grpc: Grpc<Channel>,
    request: Request<OutboundStream<T>>,
    path: &'static str,
    listener: &ResponseListener,
) -> Outcome
where
    T: prost::Message + Send + Sync + 'static,
{
    if let Err(e) = grpc.ready().await {
        return Outcome::Failed(StreamFailure::local(format!("channel not ready: {}", e)));
    }

    let response = grpc
        .streaming::<_, T, RecordStatus, _>(
            request,
            PathAndQuery::from_static(path),
            ProstCodec::default(),
        )
        .await;
    let mut inbound = match response {
        Ok(response) => response.into_inner(),
        Err(status) => return Outcome::Failed(StreamFailure::from_status(&status)),
    };

    loop {
        match inbound.message().await {
            Ok(Some(status)) => listener.on_next(status),
            Ok(None) => return Outcome::Completed,
            Err(status) => return Outcome::Failed(StreamFailure::from_status(&status)),
        }
    }
}

impl IngestChannel for GrpcIngestChannel {
    fn record_span(&self, listener: ResponseListener) -> Result<SpanStream, InfiniteTracingError> {
        let (stream, outbound) = SpanStream::single(DEFAULT_OUTBOUND_BUFFER);
        self.open(&stream, outbound, RECORD_SPAN_PATH, "RecordSpan", listener);
        Ok(stream)
    }

    fn record_span_batch(
        &self,
        listener: ResponseListener,
    ) -> Result<SpanStream, InfiniteTracingError> {
        let (stream, outbound) = SpanStream::batch(DEFAULT_OUTBOUND_BUFFER);
        self.open(
            &stream,
            outbound,
            RECORD_SPAN_BATCH_PATH,
            "RecordSpanBatch",
            listener,
        );
        Ok(stream)
    }

    fn shutdown(&self) {
        self.closed.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use std::collections::BTreeMap;

    fn config() -> InfiniteTracingConfig {
        ConfigBuilder::new()
            .host("trace-observer.example.com")
            .license_key("license-123")
            .build()
            .unwrap()
    }

    #[test]
    fn test_metadata_carries_credentials_and_lowercased_keys() {
        let factory = GrpcChannelFactory::new(&config()).unwrap();
        let mut request_metadata = BTreeMap::new();
        request_metadata.insert("Entity-Guid".to_string(), "abc".to_string());
        let credentials = Credentials::new("run-token", request_metadata);

        let metadata = factory.metadata(&credentials).unwrap();
        assert_eq!(metadata.get("license_key").unwrap().to_str().unwrap(), "license-123");
        assert_eq!(metadata.get("agent_run_token").unwrap().to_str().unwrap(), "run-token");
        assert_eq!(metadata.get("entity-guid").unwrap().to_str().unwrap(), "abc");
        assert!(metadata.get("flaky").is_none());
    }

    #[test]
    fn test_flaky_headers_only_when_configured() {
        let mut config = config();
        config.flaky_percentage = Some(12.5);
        config.flaky_code = Some(14);
        let factory = GrpcChannelFactory::new(&config).unwrap();

        let metadata = factory
            .metadata(&Credentials::new("token", BTreeMap::new()))
            .unwrap();
        assert_eq!(metadata.get("flaky").unwrap().to_str().unwrap(), "12.5");
        assert_eq!(metadata.get("flaky_code").unwrap().to_str().unwrap(), "14");
    }

    #[test]
    fn test_invalid_metadata_value_is_rejected() {
        let factory = GrpcChannelFactory::new(&config()).unwrap();
        let credentials = Credentials::new("bad\ntoken", BTreeMap::new());
        assert!(matches!(
            factory.metadata(&credentials),
            Err(InfiniteTracingError::Transport(TransportError::InvalidMetadata(_)))
        ));
    }

    #[test]
    fn test_unknown_compression_is_rejected() {
        let mut config = config();
        config.compression = Some("brotli".to_string());
        assert!(GrpcChannelFactory::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_build_channel_does_not_connect() {
        let mut config = config();
        config.use_plaintext = true;
        config.port = 1;
        let factory = GrpcChannelFactory::new(&config).unwrap();
        let channel = factory.build_channel(&Credentials::new("token", BTreeMap::new()));
        assert!(channel.is_ok());
    }
}
