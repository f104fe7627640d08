//! The listener and the lifecycle of the connections it accepts.
use std::io;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::ConnectInfo;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::Instrument;

use crate::config::{RpcConfig, ShutdownPolicy, TransportConfig};
use crate::error::ServerError;
use crate::{Result, tls};

/// hyper refuses read buffers smaller than this
const MIN_READ_BUFFER: usize = 8192;

/// How long the accept loop sleeps after the process runs out of a resource such as file
/// descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Serves a composed request handler on the configured listen address.
pub struct Server {
    config: RpcConfig,
    transport: TransportConfig,
    handler: axum::Router,
    shutdown_policy: ShutdownPolicy,
}

impl Server {
    /// `handler` is usually the output of [`crate::handler()`].
    pub fn new(config: RpcConfig, handler: axum::Router) -> Self {
        let transport = TransportConfig::from_rpc_config(&config);
        let shutdown_policy = config.shutdown_policy();

        Self {
            config,
            transport,
            handler,
            shutdown_policy,
        }
    }

    pub fn with_shutdown_policy(mut self, shutdown_policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = shutdown_policy;
        self
    }

    pub fn transport_config(&self) -> &TransportConfig {
        &self.transport
    }

    /// Bind the configured address, serve it, and return once `cancel` fires or the listener
    /// fails.
    ///
    /// Cancellation is reported as [`ServerError::ListenerClosed`].
    pub async fn listen_and_serve(&self, cancel: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, cancel).await
    }

    /// Like [`Self::listen_and_serve`] but terminating TLS.  The certificate and key are loaded
    /// before anything is bound.
    pub async fn listen_and_serve_tls(&self, cancel: CancellationToken, cert_file: &Path, key_file: &Path) -> Result<()> {
        let acceptor = tls::acceptor(cert_file, key_file)?;
        let listener = self.bind().await?;
        self.serve_tls(listener, cancel, acceptor).await
    }

    /// Serve with TLS if the config names a certificate and key, plain HTTP otherwise.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        match self.config.tls_files() {
            Some((cert_file, key_file)) => self.listen_and_serve_tls(cancel, cert_file, key_file).await,
            None => self.listen_and_serve(cancel).await,
        }
    }

    pub async fn bind(&self) -> Result<Listener> {
        let addr = parse_listen_address(&self.config.listen_address)?;
        let to_bind_error = |source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        };

        let listener = TcpListener::bind(addr).await.map_err(to_bind_error)?;
        let local_addr = listener.local_addr().map_err(to_bind_error)?;

        let max_open_connections = self.transport.max_open_connections;
        tracing::info!(%local_addr, max_open_connections, "RPC listener bound");

        Ok(Listener {
            inner: listener,
            local_addr,
            permits: (max_open_connections > 0).then(|| Arc::new(Semaphore::new(max_open_connections))),
        })
    }

    pub async fn serve(&self, listener: Listener, cancel: CancellationToken) -> Result<()> {
        self.serve_connections(listener, cancel, None).await
    }

    pub async fn serve_tls(&self, listener: Listener, cancel: CancellationToken, acceptor: TlsAcceptor) -> Result<()> {
        self.serve_connections(listener, cancel, Some(acceptor)).await
    }

    async fn serve_connections(
        &self,
        listener: Listener,
        cancel: CancellationToken,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<()> {
        let connections = TaskTracker::new();
        let drain = CancellationToken::new();

        let scheme = if acceptor.is_some() { "https" } else { "http" };
        tracing::info!(local_addr = %listener.local_addr, scheme, "Serving RPC");

        let result = loop {
            let (stream, remote_addr) = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::info!(local_addr = %listener.local_addr, "Cancellation requested; closing RPC listener");
                    break Err(ServerError::ListenerClosed);
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => match recover_from_accept_error(e, &cancel).await {
                        ControlFlow::Continue(()) => continue,
                        ControlFlow::Break(e) => break Err(e),
                    },
                },
            };

            tracing::trace!(%remote_addr, "Accepted connection");

            let connection = Connection {
                handler: self.handler.clone(),
                transport: self.transport.clone(),
                remote_addr,
                drain: drain.clone(),
            };
            let acceptor = acceptor.clone();
            let span = tracing::debug_span!("rpc_connection", %remote_addr);

            connections.spawn(
                async move {
                    match acceptor {
                        Some(acceptor) => connection.serve_tls(stream, acceptor).await,
                        None => connection.serve(stream).await,
                    }
                }
                .instrument(span),
            );
        };

        drop(listener);
        connections.close();

        match self.shutdown_policy {
            ShutdownPolicy::Detach => {
                tracing::debug!(open_connections = connections.len(), "Leaving open connections to finish on their own");
            }
            ShutdownPolicy::Drain { timeout } => {
                drain.cancel();
                if tokio::time::timeout(timeout, connections.wait()).await.is_err() {
                    tracing::warn!(
                        open_connections = connections.len(),
                        timeout = %humantime::format_duration(timeout),
                        "Connections still open after the shutdown grace period"
                    );
                }
            }
        }

        result
    }
}

/// A bound listener, limited to the configured number of open connections.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    permits: Option<Arc<Semaphore>>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for a free connection slot before accepting, so excess clients queue in the
    /// kernel's backlog.  The slot is held until the returned stream is dropped, which for a
    /// websocket is when the socket closes rather than when the upgrade completes.
    async fn accept(&self) -> io::Result<(LimitedStream<TcpStream>, SocketAddr)> {
        let permit = match &self.permits {
            Some(permits) => Some(
                permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| io::Error::other("connection limiter closed"))?,
            ),
            None => None,
        };

        let (stream, remote_addr) = self.inner.accept().await?;
        Ok((
            LimitedStream {
                inner: stream,
                _permit: permit,
            },
            remote_addr,
        ))
    }
}

/// A stream occupying one connection slot.
struct LimitedStream<I> {
    inner: I,
    _permit: Option<OwnedSemaphorePermit>,
}

impl<I: AsyncRead + Unpin> AsyncRead for LimitedStream<I> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<I: AsyncWrite + Unpin> AsyncWrite for LimitedStream<I> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Accept `tcp://host:port` and `host:port`.
fn parse_listen_address(listen_address: &str) -> Result<&str> {
    let invalid = |reason| ServerError::InvalidListenAddress {
        addr: listen_address.to_string(),
        reason,
    };

    let addr = match listen_address.split_once("://") {
        Some(("tcp", addr)) => addr,
        Some(_) => return Err(invalid("only tcp:// addresses are supported")),
        None => listen_address,
    };

    if addr.is_empty() {
        return Err(invalid("missing host:port"));
    }

    Ok(addr)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// Concerns only the connection being accepted.  Accept again right away.
    Transient,
    /// The process or the system is short of something, usually file descriptors.  Accepting
    /// again immediately would spin, so back off first.
    Exhausted,
    /// The listening socket itself is unusable.
    Fatal,
}

impl AcceptFailure {
    fn classify(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut => Self::Transient,
            io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected | io::ErrorKind::Unsupported => Self::Fatal,
            _ => Self::Exhausted,
        }
    }
}

/// Decide whether the accept loop keeps going after `e`.
///
/// Only a broken listener ends the loop with [`ServerError::Accept`].  Anything else is logged
/// and retried, after [`ACCEPT_ERROR_BACKOFF`] unless it was transient.  Cancellation during the
/// backoff ends the loop with [`ServerError::ListenerClosed`].
async fn recover_from_accept_error(e: io::Error, cancel: &CancellationToken) -> ControlFlow<ServerError> {
    match AcceptFailure::classify(&e) {
        AcceptFailure::Transient => {
            tracing::warn!(err = %e, "Transient error accepting connection");
            ControlFlow::Continue(())
        }
        AcceptFailure::Exhausted => {
            tracing::error!(
                err = %e,
                backoff = %humantime::format_duration(ACCEPT_ERROR_BACKOFF),
                "Error accepting connection; retrying after backoff"
            );
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::info!("Cancellation requested; closing RPC listener");
                    ControlFlow::Break(ServerError::ListenerClosed)
                }
                _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => ControlFlow::Continue(()),
            }
        }
        AcceptFailure::Fatal => {
            tracing::error!(err = %e, "Error accepting connection; closing RPC listener");
            ControlFlow::Break(ServerError::Accept { source: e })
        }
    }
}

struct Connection {
    handler: axum::Router,
    transport: TransportConfig,
    remote_addr: SocketAddr,
    drain: CancellationToken,
}

impl Connection {
    async fn serve_tls(self, stream: LimitedStream<TcpStream>, acceptor: TlsAcceptor) {
        match tokio::time::timeout(self.transport.read_timeout, acceptor.accept(stream)).await {
            Ok(Ok(stream)) => self.serve(stream).await,
            Ok(Err(e)) => tracing::debug!(err = %e, "TLS handshake failed"),
            Err(_) => tracing::debug!("TLS handshake timed out"),
        }
    }

    async fn serve<I>(self, io: I)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let remote_addr = self.remote_addr;
        let handler = self.handler;
        let service = hyper::service::service_fn(move |mut request: hyper::Request<Incoming>| {
            request.extensions_mut().insert(ConnectInfo(remote_addr));
            handler.clone().oneshot(request)
        });

        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.transport.read_timeout)
            .max_buf_size(self.transport.max_header_bytes.max(MIN_READ_BUFFER));
        builder
            .http2()
            .timer(TokioTimer::new())
            .max_header_list_size(u32::try_from(self.transport.max_header_bytes).unwrap_or(u32::MAX));

        let connection = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
        tokio::pin!(connection);

        let result = tokio::select! {
            result = connection.as_mut() => result,
            _ = self.drain.cancelled() => {
                tracing::trace!("Draining connection");
                connection.as_mut().graceful_shutdown();
                connection.as_mut().await
            }
        };

        match result {
            Ok(()) => tracing::trace!("Connection closed"),
            Err(e) => tracing::debug!(err = %e, "Connection closed with error"),
        }
    }
}
