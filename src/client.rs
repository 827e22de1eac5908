//! Client facade: dialing and opening calls.

use crate::cancel::CancelToken;
use crate::context::CallContext;
use crate::error::Error;
use crate::stream::ClientStream;
use crate::tls::{create_insecure_tls_connector, create_tls_connector, TlsClientConfig};
use arf_proto::Value;
use arf_rpc::{Message, Metadata, Request};
use arf_wire::{CompressionMethod, ConnConfig, Connection, ErrorCode};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Options for [`dial`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// TLS configuration; plain TCP when absent or disabled.
    pub tls: Option<TlsClientConfig>,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Compression requested during the handshake.
    pub compression: CompressionMethod,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            tls: None,
            connect_timeout: Duration::from_secs(10),
            compression: CompressionMethod::None,
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_compression(mut self, compression: CompressionMethod) -> Self {
        self.compression = compression;
        self
    }
}

/// Buffer receiving the response metadata of a call.
#[derive(Clone, Default)]
pub struct MetadataBuffer {
    inner: Arc<Mutex<Metadata>>,
}

impl MetadataBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Metadata {
        self.inner.lock().clone()
    }

    fn set(&self, metadata: Metadata) {
        *self.inner.lock() = metadata;
    }
}

/// Options for one call.
#[derive(Default)]
pub struct CallOptions {
    streaming: bool,
    metadata: Metadata,
    params: Vec<Value>,
    cancel: Option<CancelToken>,
    response_metadata: Option<MetadataBuffer>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the call as client-streaming.
    pub fn with_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Outbound metadata attached to the request.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Initial call parameters.
    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Buffer that receives the response metadata once the call is open.
    pub fn with_response_metadata(mut self, buffer: &MetadataBuffer) -> Self {
        self.response_metadata = Some(buffer.clone());
        self
    }
}

/// Dials a server and completes the wire handshake.
pub async fn dial(addr: &str, options: ClientOptions) -> Result<Client, Error> {
    tracing::debug!(addr, "dialing");
    let tcp = tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Timeout)??;
    tcp.set_nodelay(true).ok();

    let stream = match &options.tls {
        Some(tls) if tls.enabled => {
            let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
            let (connector, server_name) = if tls.insecure {
                tracing::warn!("using insecure TLS (certificate verification disabled)");
                create_insecure_tls_connector(tls, host)?
            } else {
                create_tls_connector(tls, host)?
            };
            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::TlsHandshake(e.to_string()))?;
            tracing::debug!("TLS handshake complete");
            ClientStream::Tls { stream: tls_stream }
        }
        _ => ClientStream::Plain { stream: tcp },
    };

    let conn = Connection::spawn(stream, 0, ConnConfig::client(), None);
    conn.configure(options.compression).await?;
    tracing::debug!("wire handshake complete");

    Ok(Client { conn })
}

/// A connected client multiplexing calls over one connection.
pub struct Client {
    conn: Connection,
}

impl Client {
    /// Opens a call: allocates a stream, writes the request and reads the
    /// response. Streaming exchanges continue on the returned context.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        options: CallOptions,
    ) -> Result<CallContext, Error> {
        let cancel = options.cancel.unwrap_or_default();
        let stream = self.conn.new_stream().await?;

        let req = Request {
            service: service.to_string(),
            method: method.to_string(),
            streaming: options.streaming,
            metadata: options.metadata,
            params: options.params,
        };
        let streaming = req.streaming;
        let encoded = Message::Request(req.clone()).wrap();
        let ctx = CallContext::client(stream.clone(), req, cancel.clone());

        if cancel.is_cancelled() {
            let _ = stream.reset(ErrorCode::Cancel).await;
            return Err(Error::Canceled);
        }

        // A call with no client stream ends its direction with the request.
        if let Err(err) = stream.write(&encoded, !streaming).await {
            let _ = stream.close_local().await;
            return Err(err.into());
        }

        if streaming {
            if let Err(err) = stream.write(&Message::StartStream.wrap(), false).await {
                let _ = stream.reset(ErrorCode::Cancel).await;
                return Err(err.into());
            }
            ctx.mark_send_started().await;
        }

        let resp = match ctx.read_response().await {
            Ok(resp) => resp,
            Err(err) => {
                if !matches!(err, Error::Canceled) {
                    let _ = stream.reset(ErrorCode::Cancel).await;
                }
                return Err(err);
            }
        };

        if let Some(buffer) = &options.response_metadata {
            buffer.set(resp.metadata.clone());
        }

        Ok(ctx)
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_running()
    }

    /// Closes the connection, announcing it with GO_AWAY.
    pub async fn close(&self) {
        if let Err(err) = self.conn.go_away(ErrorCode::NoError).await {
            tracing::debug!(%err, "GO_AWAY on close failed");
            self.conn.close();
        }
    }
}
