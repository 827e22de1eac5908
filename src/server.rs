//! Server facade: accept loop, per-connection lifecycle and dispatch.

use crate::cancel::CancelToken;
use crate::context::CallContext;
use crate::error::Error;
use crate::service::{Interceptor, Next, Service};
use crate::stream::MaybeTlsStream;
use crate::tls::{create_tls_acceptor, TlsServerConfig};
use arf_rpc::{Metadata, Status, STATUS_DESCRIPTION_KEY};
use arf_wire::{
    ConnConfig, ConnRole, Connection, ErrorCode, Stream as WireStream,
    StreamHandler as WireStreamHandler,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

/// Generates external ids correlating streams with per-call contexts.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Options for [`listen`].
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Stream limit advertised in the HELLO ack, `0` = unlimited (reserved).
    pub max_concurrent_streams: u32,
    /// TLS configuration; plain TCP when absent.
    pub tls: Option<TlsServerConfig>,
    /// Per-call id generator; UUIDv4 by default.
    pub id_generator: Option<IdGenerator>,
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("max_concurrent_streams", &self.max_concurrent_streams)
            .field("tls_enabled", &self.tls.is_some())
            .field("custom_id_generator", &self.id_generator.is_some())
            .finish()
    }
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tls(mut self, tls: TlsServerConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_max_concurrent_streams(mut self, limit: u32) -> Self {
        self.max_concurrent_streams = limit;
        self
    }

    pub fn with_id_generator(mut self, generator: IdGenerator) -> Self {
        self.id_generator = Some(generator);
        self
    }
}

struct ServerInner {
    options: ServerOptions,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    id_generator: IdGenerator,
    services: RwLock<HashMap<String, Arc<dyn Service>>>,
    interceptors: RwLock<Vec<Arc<dyn Interceptor>>>,
    connections: Mutex<HashMap<u64, Connection>>,
    next_conn_id: AtomicU64,
    /// Active calls by external stream id, for remote cancellation.
    calls: Mutex<HashMap<String, CancelToken>>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

/// A listening RPC server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

/// Binds a listener and prepares a server with the given options.
pub async fn listen(addr: impl ToSocketAddrs, options: ServerOptions) -> Result<Server, Error> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let tls_acceptor = match &options.tls {
        Some(tls) => Some(create_tls_acceptor(tls)?),
        None => None,
    };
    let id_generator = options
        .id_generator
        .clone()
        .unwrap_or_else(|| Arc::new(|| uuid::Uuid::new_v4().to_string()));

    let (shutdown_tx, _) = broadcast::channel(1);
    Ok(Server {
        inner: Arc::new(ServerInner {
            options,
            listener: Mutex::new(Some(listener)),
            local_addr,
            tls_acceptor,
            id_generator,
            services: RwLock::new(HashMap::new()),
            interceptors: RwLock::new(Vec::new()),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            calls: Mutex::new(HashMap::new()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }),
    })
}

impl Server {
    /// Registers a service; its id must be unique.
    pub fn register_service<S: Service>(&self, service: S) -> Result<(), Error> {
        let id = service.service_id().to_string();
        let mut services = self.inner.services.write();
        if services.contains_key(&id) {
            return Err(Error::ServiceExists(id));
        }
        services.insert(id, Arc::new(service));
        Ok(())
    }

    /// Adds an interceptor; interceptors run in registration order.
    pub fn register_interceptor<I: Interceptor>(&self, interceptor: I) {
        self.inner.interceptors.write().push(Arc::new(interceptor));
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Runs the accept loop until [`Server::shutdown`].
    pub async fn serve(&self) -> Result<(), Error> {
        let listener = self
            .inner
            .listener
            .lock()
            .take()
            .ok_or(Error::NotListening)?;
        self.inner.running.store(true, Ordering::SeqCst);

        let tls_mode = if self.inner.tls_acceptor.is_some() {
            "TLS"
        } else {
            "plain"
        };
        tracing::info!("server listening on {} ({})", self.inner.local_addr, tls_mode);

        let mut shutdown_rx = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((tcp, addr)) => self.inner.clone().spawn_connection(tcp, addr),
                    Err(err) => tracing::error!(%err, "accept error"),
                },
                _ = shutdown_rx.recv() => {
                    tracing::info!("server shutting down");
                    break;
                }
            }
        }

        self.inner.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stops accepting and announces GO_AWAY to every live connection; each
    /// connection terminates once the frame has been flushed.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(());

        let connections: Vec<Connection> =
            self.inner.connections.lock().values().cloned().collect();
        for conn in connections {
            if let Err(err) = conn.go_away(ErrorCode::NoError).await {
                tracing::debug!(conn = conn.id(), %err, "GO_AWAY during shutdown failed");
                conn.close();
            }
        }
    }
}

impl ServerInner {
    fn spawn_connection(self: Arc<Self>, tcp: TcpStream, addr: SocketAddr) {
        tokio::spawn(async move {
            tcp.set_nodelay(true).ok();
            let stream = match self.maybe_tls_accept(tcp, addr).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(%addr, %err, "TLS handshake failed");
                    return;
                }
            };
            let tls_note = if stream.is_tls() { " (TLS)" } else { "" };
            tracing::info!("client connected: {}{}", addr, tls_note);

            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            let config = ConnConfig {
                role: ConnRole::Server,
                accept_deflate: true,
                max_concurrent_streams: self.options.max_concurrent_streams,
            };
            let handler = Arc::new(CallStreamHandler {
                server: self.clone(),
            });
            let conn = Connection::spawn(stream, conn_id, config, Some(handler));
            self.connections.lock().insert(conn_id, conn.clone());

            conn.closed().await;
            self.connections.lock().remove(&conn_id);
            tracing::info!("client disconnected: {}", addr);
        });
    }

    async fn maybe_tls_accept(
        &self,
        tcp: TcpStream,
        addr: SocketAddr,
    ) -> Result<MaybeTlsStream, Error> {
        match &self.tls_acceptor {
            Some(acceptor) => {
                tracing::debug!(%addr, "performing TLS handshake");
                let stream = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| Error::TlsHandshake(e.to_string()))?;
                Ok(MaybeTlsStream::Tls { stream })
            }
            None => Ok(MaybeTlsStream::Plain { stream: tcp }),
        }
    }

    /// Drives one inbound stream through request decode, the interceptor
    /// chain and method dispatch.
    async fn service_stream(&self, stream: WireStream) {
        let request_id = (self.id_generator)();
        stream.set_external_id(request_id.clone());

        let cancel = CancelToken::new();
        self.calls.lock().insert(request_id.clone(), cancel.clone());

        let ctx = CallContext::server(stream, cancel);
        if let Err(err) = self.run_call(&ctx).await {
            self.emit_error(&ctx, err).await;
        }
        self.calls.lock().remove(&request_id);
    }

    async fn run_call(&self, ctx: &CallContext) -> Result<(), Error> {
        let req = match ctx.read_request().await {
            Ok(req) => req,
            Err(err) => {
                tracing::warn!(%err, "failed deserializing request payload");
                self.reject(ctx, Status::InternalError, "failed deserializing request payload")
                    .await;
                return Ok(());
            }
        };
        tracing::debug!(
            service = %req.service,
            method = %req.method,
            streaming = req.streaming,
            "request"
        );

        let service = self.services.read().get(&req.service).cloned();
        let service = match service {
            Some(service) if service.responds_to(&req.method) => service,
            _ => {
                tracing::debug!(
                    service = %req.service,
                    method = %req.method,
                    "service does not respond to the requested method"
                );
                self.reject(ctx, Status::Unimplemented, "Unimplemented").await;
                return Ok(());
            }
        };

        let interceptors: Arc<[Arc<dyn Interceptor>]> =
            self.interceptors.read().clone().into();
        Next::new(interceptors, service, req.method.clone())
            .run(ctx.clone())
            .await?;

        // A handler that succeeds without responding gets an automatic OK.
        if !ctx.has_sent_response().await {
            ctx.send_response(Status::Ok, vec![], false, Metadata::new())
                .await?;
        }
        Ok(())
    }

    async fn reject(&self, ctx: &CallContext, code: Status, message: &str) {
        let mut metadata = Metadata::new();
        metadata.set_string(STATUS_DESCRIPTION_KEY, message);
        if let Err(err) = ctx.send_response(code, vec![], false, metadata).await {
            tracing::debug!(%err, "reject write failed");
            let _ = ctx.stream().reset(ErrorCode::InternalError).await;
        }
    }

    /// Emits a handler failure: as a StreamError if the outbound stream has
    /// started, as a Response otherwise.
    async fn emit_error(&self, ctx: &CallContext, err: Error) {
        let bad = err.to_bad_status();
        tracing::debug!(code = %bad.code, message = %bad.message, "handler failed");

        let mut metadata = Metadata::new();
        metadata.set_string(STATUS_DESCRIPTION_KEY, &bad.message);

        let result = if ctx.send_stream_started().await {
            ctx.send_stream_error(bad.code, metadata).await
        } else {
            ctx.send_response(bad.code, vec![], false, metadata).await
        };
        if let Err(write_err) = result {
            tracing::debug!(%write_err, "error response write failed");
            let _ = ctx.stream().reset(ErrorCode::InternalError).await;
        }
    }
}

struct CallStreamHandler {
    server: Arc<ServerInner>,
}

impl WireStreamHandler for CallStreamHandler {
    fn service_stream(&self, stream: WireStream) {
        let server = self.server.clone();
        tokio::spawn(async move {
            server.service_stream(stream).await;
        });
    }

    fn cancel_stream(&self, stream: WireStream) {
        let request_id = stream.external_id();
        if request_id.is_empty() {
            return;
        }
        if let Some(token) = self.server.calls.lock().remove(&request_id) {
            tracing::debug!(request_id, "peer canceled call");
            token.cancel();
        }
    }
}
