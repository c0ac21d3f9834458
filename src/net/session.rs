//! Mutually authenticated TLS listener.
//!
//! One listener per transport, all sharing the process-wide rustls
//! configuration. Each accepted connection is handshaken on its own task
//! and handed over as an [`AuthenticatedStream`] carrying the
//! [`TlsSession`] the identity extractor reads from.
//!
//! ```text
//!   TcpListener ──accept──► handshake task ──► mpsc ──► transport
//!        ▲                        │
//!     shutdown              (failures logged,
//!                            connection dropped)
//! ```

use parking_lot::RwLock;
use rustls::pki_types::CertificateDer;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Terminated TLS session state for one connection.
#[derive(Debug, Clone)]
pub struct TlsSession {
    remote_addr: SocketAddr,
    peer_certificates: Option<Arc<[CertificateDer<'static>]>>,
}

impl TlsSession {
    pub fn new(remote_addr: SocketAddr, peer_certificates: Option<Vec<CertificateDer<'static>>>) -> Self {
        Self {
            remote_addr,
            peer_certificates: peer_certificates.map(Arc::from),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Verified client chain, leaf first.
    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        self.peer_certificates.as_deref()
    }

    fn from_stream(remote_addr: SocketAddr, stream: &TlsStream<TcpStream>) -> Self {
        let (_, conn) = stream.get_ref();
        Self::new(
            remote_addr,
            conn.peer_certificates()
                .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect()),
        )
    }
}

/// TLS stream plus the session it was accepted with.
pub struct AuthenticatedStream {
    pub id: ConnectionId,
    inner: TlsStream<TcpStream>,
    session: TlsSession,
}

impl AuthenticatedStream {
    pub fn session(&self) -> &TlsSession {
        &self.session
    }

    pub fn into_parts(self) -> (TlsStream<TcpStream>, TlsSession) {
        (self.inner, self.session)
    }
}

impl AsyncRead for AuthenticatedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for AuthenticatedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
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
}

impl tonic::transport::server::Connected for AuthenticatedStream {
    type ConnectInfo = TlsSession;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.session.clone()
    }
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Transport name for logging.
    pub protocol: &'static str,
    pub bind_addr: SocketAddr,
    /// Handshakes slower than this are abandoned.
    pub handshake_timeout: Duration,
    pub nodelay: bool,
    /// Accepted but not yet consumed connections.
    pub backlog: usize,
}

impl ListenerSettings {
    pub fn new(protocol: &'static str, bind_addr: SocketAddr) -> Self {
        Self {
            protocol,
            bind_addr,
            handshake_timeout: Duration::from_secs(10),
            nodelay: true,
            backlog: 128,
        }
    }
}

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Listening,
    ShuttingDown,
    Stopped,
}

/// Listener counters.
#[derive(Debug, Default)]
pub struct ListenerMetrics {
    pub connections_accepted: AtomicU64,
    pub handshakes_failed: AtomicU64,
}

impl ListenerMetrics {
    pub fn accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    pub fn handshake_failures(&self) -> u64 {
        self.handshakes_failed.load(Ordering::Relaxed)
    }
}

/// Bound TLS listener.
pub struct TlsListener {
    settings: ListenerSettings,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    local_addr: SocketAddr,
    state: Arc<RwLock<ListenerState>>,
    metrics: Arc<ListenerMetrics>,
}

impl TlsListener {
    /// Bind the socket. Failure here is a startup error.
    pub async fn bind(
        settings: ListenerSettings,
        tls: Arc<rustls::ServerConfig>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(settings.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(protocol = settings.protocol, %local_addr, "listener bound");
        Ok(Self {
            settings,
            listener,
            acceptor: TlsAcceptor::from(tls),
            local_addr,
            state: Arc::new(RwLock::new(ListenerState::Listening)),
            metrics: Arc::new(ListenerMetrics::default()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> Arc<ListenerMetrics> {
        self.metrics.clone()
    }

    pub fn state_handle(&self) -> Arc<RwLock<ListenerState>> {
        self.state.clone()
    }

    /// Start accepting. Handshaken connections arrive on the returned
    /// channel, which closes once shutdown is signalled.
    pub fn spawn(self, shutdown_rx: watch::Receiver<bool>) -> Incoming {
        let (tx, rx) = mpsc::channel(self.settings.backlog.max(1));
        let local_addr = self.local_addr;
        tokio::spawn(self.accept_loop(tx, shutdown_rx));
        Incoming { rx, local_addr }
    }

    async fn accept_loop(
        self,
        tx: mpsc::Sender<AuthenticatedStream>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let next_id = Arc::new(AtomicU64::new(1));
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let (stream, remote_addr) = tokio::select! {
                result = self.listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(protocol = self.settings.protocol, error = %e, "accept failed");
                        continue;
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            if self.settings.nodelay {
                let _ = stream.set_nodelay(true);
            }

            let acceptor = self.acceptor.clone();
            let tx = tx.clone();
            let metrics = self.metrics.clone();
            let protocol = self.settings.protocol;
            let timeout = self.settings.handshake_timeout;
            let id = ConnectionId(next_id.fetch_add(1, Ordering::Relaxed));
            tokio::spawn(async move {
                let tls = match tokio::time::timeout(timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => tls,
                    Ok(Err(e)) => {
                        metrics.handshakes_failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(protocol, %remote_addr, error = %e, "TLS handshake failed");
                        return;
                    }
                    Err(_) => {
                        metrics.handshakes_failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(protocol, %remote_addr, "TLS handshake timed out");
                        return;
                    }
                };
                metrics.connections_accepted.fetch_add(1, Ordering::Relaxed);
                let session = TlsSession::from_stream(remote_addr, &tls);
                tracing::debug!(protocol, %id, %remote_addr, "connection accepted");
                let _ = tx
                    .send(AuthenticatedStream {
                        id,
                        inner: tls,
                        session,
                    })
                    .await;
            });
        }
        *self.state.write() = ListenerState::ShuttingDown;
        tracing::info!(protocol = self.settings.protocol, "listener stopped accepting");
        drop(tx);
        *self.state.write() = ListenerState::Stopped;
    }
}

/// Stream of handshaken connections.
pub struct Incoming {
    rx: mpsc::Receiver<AuthenticatedStream>,
    local_addr: SocketAddr,
}

impl Incoming {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next connection; `None` after shutdown.
    pub async fn next(&mut self) -> Option<AuthenticatedStream> {
        self.rx.recv().await
    }

    /// Adapt into the `Result` stream tonic's server consumes.
    pub fn into_stream(
        mut self,
    ) -> impl futures::Stream<Item = Result<AuthenticatedStream, io::Error>> + Send + 'static {
        futures::stream::poll_fn(move |cx| self.rx.poll_recv(cx).map(|next| next.map(Ok::<_, io::Error>)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(42).to_string(), "conn-42");
    }

    #[test]
    fn test_session_accessors() {
        let addr: SocketAddr = "10.1.2.3:4567".parse().unwrap();
        let session = TlsSession::new(addr, Some(vec![CertificateDer::from(vec![1, 2, 3])]));
        assert_eq!(session.remote_addr(), addr);
        assert_eq!(session.peer_certificates().map(|c| c.len()), Some(1));
        assert!(TlsSession::new(addr, None).peer_certificates().is_none());
    }

    #[test]
    fn test_listener_settings_defaults() {
        let settings = ListenerSettings::new("binrpc", "127.0.0.1:0".parse().unwrap());
        assert_eq!(settings.handshake_timeout, Duration::from_secs(10));
        assert!(settings.nodelay);
    }
}
