//! Connection establishment and lifecycle
//!
//! A [`Connection`] walks `Idle -> [Tunneling ->] Handshaking -> Established` and ends in
//! `Closed`, possibly via `Expired` or `Failed`. Every transition is logged and reported
//! to the configured [`ConnectionObserver`].

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::error::MtlsError;
use crate::material::Fingerprint;
use crate::proxy::{BoxedStream, ProxyTunnel, authority};
use crate::trust::TrustContext;
use crate::Result;

/// Bound on the TLS close_notify exchange when closing
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, nothing attempted yet
    Idle,
    /// Negotiating the proxy tunnel
    Tunneling,
    /// Running the TLS handshake
    Handshaking,
    /// Authenticated and usable
    Established,
    /// Past the credential expiry margin
    Expired,
    /// Setup or I/O failed
    Failed,
    /// Resources released
    Closed,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Tunneling | Handshaking | Closed)
                | (Tunneling, Handshaking | Failed)
                | (Handshaking, Established | Failed)
                | (Established, Expired | Failed | Closed)
                | (Expired | Failed, Closed)
        )
    }

    /// Whether the connection can carry application data
    pub fn is_usable(self) -> bool {
        self == Self::Established
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Tunneling => "tunneling",
            Self::Handshaking => "handshaking",
            Self::Established => "established",
            Self::Expired => "expired",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Receives connection state transitions
pub trait ConnectionObserver: Send + Sync + fmt::Debug {
    /// Called after every transition
    fn on_transition(&self, id: ConnectionId, from: ConnectionState, to: ConnectionState);
}

/// Remote endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    /// Create a target
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host name used for SNI and certificate verification
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`
    pub fn authority(&self) -> String {
        authority(&self.host, self.port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// One authenticated channel to the target
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]. An I/O error marks the connection
/// failed so the pool discards it on release.
pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    stream: Option<TlsStream<BoxedStream>>,
    target: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
    generation: u64,
    client_fingerprint: Fingerprint,
    observer: Option<Arc<dyn ConnectionObserver>>,
}

impl Connection {
    fn new(
        target: &Target,
        trust: &TrustContext,
        config: &ConnectionConfig,
        observer: Option<Arc<dyn ConnectionObserver>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ConnectionId::new(),
            state: ConnectionState::Idle,
            stream: None,
            target: target.authority(),
            created_at: now,
            expires_at: trust.connection_expiry(config.expiry_safety_margin),
            last_used: now,
            generation: trust.generation(),
            client_fingerprint: trust.fingerprint(),
            observer,
        }
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Target authority
    pub fn target(&self) -> &str {
        &self.target
    }

    /// When the connection was created
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Certificate notAfter minus the safety margin
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Last checkout or return
    pub fn last_used(&self) -> DateTime<Utc> {
        self.last_used
    }

    /// Trust generation the connection was built with
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fingerprint of the client certificate presented during the handshake
    pub fn client_fingerprint(&self) -> Fingerprint {
        self.client_fingerprint
    }

    /// Negotiated ALPN protocol
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.stream
            .as_ref()
            .and_then(|s| s.get_ref().1.alpn_protocol())
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Utc::now();
    }

    /// Move to `Expired` if `now` has reached the expiry instant
    ///
    /// Returns whether the connection is (now) expired.
    pub fn check_expiry(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == ConnectionState::Established && now >= self.expires_at {
            self.transition(ConnectionState::Expired);
        }
        self.state == ConnectionState::Expired
    }

    fn transition(&mut self, next: ConnectionState) {
        let from = self.state;
        if !from.can_transition_to(next) {
            warn!(
                connection_id = %self.id,
                from = %from,
                to = %next,
                "Ignoring illegal connection state transition"
            );
            return;
        }

        self.state = next;
        trace!(connection_id = %self.id, from = %from, to = %next, "Connection state changed");
        if let Some(observer) = &self.observer {
            observer.on_transition(self.id, from, next);
        }
    }

    fn fail(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Tunneling | ConnectionState::Handshaking | ConnectionState::Established
        ) {
            self.transition(ConnectionState::Failed);
        }
    }

    /// Send close_notify and release the socket
    pub async fn close(mut self) {
        if let Some(mut stream) = self.stream.take()
            && matches!(
                self.state,
                ConnectionState::Established | ConnectionState::Expired
            )
        {
            match tokio::time::timeout(CLOSE_TIMEOUT, stream.shutdown()).await {
                Ok(Ok(())) => debug!(connection_id = %self.id, "TLS session closed"),
                Ok(Err(e)) => debug!(connection_id = %self.id, error = %e, "TLS shutdown failed"),
                Err(_) => debug!(connection_id = %self.id, "TLS shutdown timed out"),
            }
        }
        self.finish();
    }

    /// Walk to `Closed` from whatever state the connection is in
    fn finish(&mut self) {
        self.stream = None;
        match self.state {
            ConnectionState::Closed => {}
            ConnectionState::Idle | ConnectionState::Expired | ConnectionState::Failed => {
                self.transition(ConnectionState::Closed);
            }
            ConnectionState::Established => self.transition(ConnectionState::Closed),
            ConnectionState::Tunneling | ConnectionState::Handshaking => {
                self.transition(ConnectionState::Failed);
                self.transition(ConnectionState::Closed);
            }
        }
    }

    fn stream_mut(&mut self) -> io::Result<&mut TlsStream<BoxedStream>> {
        match (self.state, self.stream.as_mut()) {
            (ConnectionState::Established | ConnectionState::Expired, Some(stream)) => Ok(stream),
            (state, _) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("connection is {state}"),
            )),
        }
    }

    fn record_io<T>(&mut self, poll: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        if let Poll::Ready(Err(e)) = &poll {
            warn!(connection_id = %self.id, error = %e, "Connection I/O failed");
            self.fail();
        }
        poll
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed {
            self.finish();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("target", &self.target)
            .field("generation", &self.generation)
            .field("client_fingerprint", &self.client_fingerprint)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = match this.stream_mut() {
            Ok(stream) => Pin::new(stream).poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        };
        this.record_io(poll)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = match this.stream_mut() {
            Ok(stream) => Pin::new(stream).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        };
        this.record_io(poll)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = match this.stream_mut() {
            Ok(stream) => Pin::new(stream).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        };
        this.record_io(poll)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = match this.stream_mut() {
            Ok(stream) => Pin::new(stream).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        };
        this.record_io(poll)
    }
}

/// Builds connections to one target, optionally through a proxy
#[derive(Debug, Clone)]
pub struct Connector {
    target: Target,
    tunnel: Option<ProxyTunnel>,
    config: ConnectionConfig,
    observer: Option<Arc<dyn ConnectionObserver>>,
}

impl Connector {
    /// Create a connector
    pub fn new(target: Target, tunnel: Option<ProxyTunnel>, config: ConnectionConfig) -> Self {
        Self {
            target,
            tunnel,
            config,
            observer: None,
        }
    }

    /// Report transitions of every connection to `observer`
    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Target endpoint
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Connection settings
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Run the full sequence and return an `Established` connection
    ///
    /// Dropping the returned future tears down whatever was set up so far.
    pub async fn connect(&self, trust: &TrustContext) -> Result<Connection> {
        trust.ensure_usable(Utc::now(), self.config.expiry_safety_margin)?;

        let mut connection = Connection::new(&self.target, trust, &self.config, self.observer.clone());
        let target = self.target.authority();

        let stream = match &self.tunnel {
            Some(tunnel) => {
                connection.transition(ConnectionState::Tunneling);
                let stream = tunnel
                    .open(&self.target.host, self.target.port, trust.proxy_connector())
                    .await;
                // On error the connection is dropped and records Failed -> Closed
                let stream = stream?;
                connection.transition(ConnectionState::Handshaking);
                stream
            }
            None => {
                connection.transition(ConnectionState::Handshaking);
                self.connect_direct(&target).await?
            }
        };

        let server_name =
            ServerName::try_from(self.target.host.clone()).map_err(|e| MtlsError::HandshakeFailed {
                target: target.clone(),
                reason: format!("invalid server name: {e}"),
            })?;

        let handshake = trust.connector().connect(server_name, stream);
        let tls_stream = match tokio::time::timeout(self.config.handshake_timeout, handshake).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(MtlsError::HandshakeFailed {
                    target,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(MtlsError::HandshakeTimeout {
                    target,
                    waited: self.config.handshake_timeout,
                });
            }
        };

        connection.stream = Some(tls_stream);
        connection.transition(ConnectionState::Established);

        info!(
            connection_id = %connection.id,
            target = %connection.target,
            generation = connection.generation,
            fingerprint = %connection.client_fingerprint,
            via_proxy = self.tunnel.is_some(),
            "Connection established"
        );
        Ok(connection)
    }

    async fn connect_direct(&self, target: &str) -> Result<BoxedStream> {
        let connect = TcpStream::connect((self.target.host.as_str(), self.target.port));
        let tcp = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => {
                return Err(MtlsError::ConnectFailed {
                    target: target.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(MtlsError::ConnectFailed {
                    target: target.to_string(),
                    reason: format!("timed out after {:?}", self.config.connect_timeout),
                });
            }
        };
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(target = %target, error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(Box::new(tcp))
    }
}
