//! Shared integration test infrastructure
//!
//! An mTLS echo server that reports the client certificate it saw, a scriptable
//! CONNECT proxy, and helpers that wire fixtures into an engine configuration.

#![allow(dead_code)]

#[path = "../../src/test_utils.rs"]
mod fixtures;

pub use fixtures::*;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mtls_engine::{
    ConnectionConfig, ConnectionId, ConnectionObserver, ConnectionState, Fingerprint,
    MtlsConfiguration, StaticResolver,
};
use parking_lot::Mutex;
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ServerConfig, WebPkiClientVerifier};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// Host every test server binds to and every certificate names
pub const HOST: &str = "127.0.0.1";

/// Length of the `sha256:<hex>\n` line the echo server sends first
pub const FINGERPRINT_LINE_LEN: usize = 7 + 64 + 1;

/// Makes the echo server drop the socket without sending close_notify
pub const ABORT_COMMAND: &[u8] = b"abort\n";

fn server_identity(ca: &TestCa) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let server = ca.issue_server(HOST);
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(server.key_der.clone()));
    (vec![CertificateDer::from(server.cert_der.clone())], key)
}

/// TLS server requiring client certificates issued by one CA
///
/// On every accepted connection it writes the presented client certificate's
/// fingerprint followed by a newline, then echoes everything it reads.
/// Receiving [`ABORT_COMMAND`] drops the connection uncleanly.
pub struct EchoServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    clean_closes: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl EchoServer {
    /// Start a server with a certificate from `server_ca` that trusts `client_ca`
    pub async fn start(server_ca: &TestCa, client_ca: &TestCa) -> Self {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        roots
            .add(CertificateDer::from(client_ca.der()))
            .expect("client CA");
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .expect("client verifier");

        let (chain, key) = server_identity(server_ca);
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("protocol versions")
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)
            .expect("server config");
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind((HOST, 0)).await.expect("bind echo server");
        let addr = listener.local_addr().expect("echo server address");
        let accepted = Arc::new(AtomicUsize::new(0));
        let clean_closes = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        let closes = clean_closes.clone();
        let task = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let acceptor = acceptor.clone();
                let closes = closes.clone();
                tokio::spawn(async move {
                    let Ok(mut tls) = acceptor.accept(tcp).await else {
                        return;
                    };
                    let fingerprint = tls
                        .get_ref()
                        .1
                        .peer_certificates()
                        .and_then(|certs| certs.first())
                        .map(|leaf| Fingerprint::of(leaf.as_ref()).to_string())
                        .unwrap_or_default();
                    if tls
                        .write_all(format!("{fingerprint}\n").as_bytes())
                        .await
                        .is_err()
                    {
                        return;
                    }

                    let mut buf = [0u8; 4096];
                    loop {
                        match tls.read(&mut buf).await {
                            // close_notify received
                            Ok(0) => {
                                closes.fetch_add(1, Ordering::SeqCst);
                                break;
                            }
                            Err(_) => break,
                            Ok(n) if &buf[..n] == ABORT_COMMAND => return,
                            Ok(n) => {
                                if tls.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            accepted,
            clean_closes,
            task,
        }
    }

    /// Listening port
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// TCP connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Sessions the client ended with close_notify
    pub fn clean_closes(&self) -> usize {
        self.clean_closes.load(Ordering::SeqCst)
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// How the test proxy answers CONNECT requests
#[derive(Debug, Clone, Copy)]
pub enum ProxyMode {
    /// Open the tunnel and relay bytes
    Accept,
    /// Answer with the given status and close
    Reject(u16),
    /// Read the request and never answer
    Silent,
}

/// Minimal HTTP CONNECT proxy, optionally behind TLS
pub struct TestProxy {
    addr: SocketAddr,
    scheme: &'static str,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl TestProxy {
    /// Start a plain TCP proxy in `mode`
    pub async fn start(mode: ProxyMode) -> Self {
        Self::spawn(mode, None).await
    }

    /// Start a proxy that terminates TLS with a certificate issued by `ca`
    pub async fn start_tls(mode: ProxyMode, ca: &TestCa) -> Self {
        let (chain, key) = server_identity(ca);
        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .expect("proxy server config");
        Self::spawn(mode, Some(TlsAcceptor::from(Arc::new(config)))).await
    }

    async fn spawn(mode: ProxyMode, acceptor: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind((HOST, 0)).await.expect("bind proxy");
        let addr = listener.local_addr().expect("proxy address");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let scheme = if acceptor.is_some() { "https" } else { "http" };

        let seen = requests.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen = seen.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let _ = match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls) => serve_tunnel(tls, mode, seen).await,
                            Err(_) => Ok(()),
                        },
                        None => serve_tunnel(stream, mode, seen).await,
                    };
                });
            }
        });

        Self {
            addr,
            scheme,
            requests,
            task,
        }
    }

    /// URL of the proxy
    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme, self.addr)
    }

    /// Request heads received so far
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_tunnel<S>(
    mut client: S,
    mode: ProxyMode,
    seen: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if client.read(&mut byte).await? == 0 {
            return Ok(());
        }
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head).into_owned();
    let authority = head
        .split_whitespace()
        .nth(1)
        .unwrap_or_default()
        .to_string();
    seen.lock().push(head);

    match mode {
        ProxyMode::Accept => {
            let mut upstream = match TcpStream::connect(&authority).await {
                Ok(upstream) => upstream,
                Err(_) => {
                    client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
                    return Ok(());
                }
            };
            client
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await?;
            tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        }
        ProxyMode::Reject(status) => {
            client
                .write_all(format!("HTTP/1.1 {status} Forbidden\r\nContent-Length: 0\r\n\r\n").as_bytes())
                .await?;
        }
        ProxyMode::Silent => {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
    }
    Ok(())
}

/// Credentials and server for one end-to-end scenario
pub struct Scenario {
    pub client_ca: TestCa,
    pub server_ca: TestCa,
    pub client: IssuedCert,
    pub server: EchoServer,
}

impl Scenario {
    /// Two CAs, a client certificate, and a running echo server
    pub async fn start() -> Self {
        let client_ca = TestCa::new("Client CA");
        let server_ca = TestCa::new("Server CA");
        let client = client_ca.issue_client("payments-client");
        let server = EchoServer::start(&server_ca, &client_ca).await;
        Self {
            client_ca,
            server_ca,
            client,
            server,
        }
    }

    /// Resolver holding the encrypted client bundle, a P-256 signing key and the server CA
    pub fn resolver(&self) -> StaticResolver {
        resolver_for(&self.client.encrypted_bundle(TEST_PASSWORD), &p256_pkcs8_pem(), &self.server_ca)
    }
}

/// Resolver with `transport.pem`, `signing.pem` and `ca.pem`
pub fn resolver_for(transport_pem: &str, signing_pem: &str, server_ca: &TestCa) -> StaticResolver {
    StaticResolver::new()
        .with("transport.pem", transport_pem.as_bytes().to_vec())
        .with("signing.pem", signing_pem.as_bytes().to_vec())
        .with("ca.pem", server_ca.pem().into_bytes())
}

/// Configuration pointing at the locations registered by [`resolver_for`]
pub fn configuration() -> MtlsConfiguration {
    MtlsConfiguration::new("signing.pem", "transport.pem", TEST_PASSWORD).with_ca_bundle("ca.pem")
}

/// Short timeouts and no public roots
pub fn connection_config() -> ConnectionConfig {
    ConnectionConfig {
        connect_timeout: Duration::from_secs(2),
        proxy_response_timeout: Duration::from_millis(300),
        handshake_timeout: Duration::from_secs(5),
        use_webpki_roots: false,
        ..ConnectionConfig::default()
    }
}

/// Read the fingerprint line the echo server sends after the handshake
pub async fn read_fingerprint_line<S>(stream: &mut S) -> String
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut line = [0u8; FINGERPRINT_LINE_LEN];
    stream.read_exact(&mut line).await.expect("fingerprint line");
    String::from_utf8_lossy(&line).trim_end().to_string()
}

/// Observer recording every state transition
#[derive(Debug, Default)]
pub struct TransitionLog {
    transitions: Mutex<Vec<(ConnectionId, ConnectionState, ConnectionState)>>,
}

impl TransitionLog {
    /// States visited by the first connection observed, starting from `Idle`
    pub fn first_path(&self) -> Vec<ConnectionState> {
        let transitions = self.transitions.lock();
        let Some((first, _, _)) = transitions.first() else {
            return Vec::new();
        };
        let mut path = vec![ConnectionState::Idle];
        path.extend(
            transitions
                .iter()
                .filter(|(id, _, _)| id == first)
                .map(|(_, _, to)| *to),
        );
        path
    }

    /// Whether any connection reached `state`
    pub fn reached(&self, state: ConnectionState) -> bool {
        self.transitions.lock().iter().any(|(_, _, to)| *to == state)
    }
}

impl ConnectionObserver for TransitionLog {
    fn on_transition(&self, id: ConnectionId, from: ConnectionState, to: ConnectionState) {
        self.transitions.lock().push((id, from, to));
    }
}
