//! Forward proxy tunnelling
//!
//! Opens a connection to the configured proxy, optionally wraps it in TLS for
//! `https://` proxies, and negotiates an HTTP `CONNECT` tunnel to the target. The
//! resulting stream carries raw bytes and is handed to the TLS layer untouched.

use std::fmt;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::Url;
use zeroize::Zeroizing;

use crate::error::MtlsError;
use crate::Result;

/// Upper bound on the proxy's response head
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Byte stream produced by the tunnel, plain or TLS-wrapped
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

/// Boxed tunnel stream
pub type BoxedStream = Box<dyn TunnelIo>;

/// Proxy scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyScheme {
    /// Plain TCP to the proxy
    Http,
    /// TLS to the proxy, then CONNECT inside it
    Https,
}

impl fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("http"),
            Self::Https => f.write_str("https"),
        }
    }
}

/// Parsed forward proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    scheme: ProxyScheme,
    host: String,
    port: u16,
}

impl ProxyEndpoint {
    /// Create an endpoint from parts
    pub fn new(scheme: ProxyScheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Parse a proxy string such as `https://proxy.domain.com:8443` or `proxy:3128`
    ///
    /// A missing scheme means `http`. Embedded credentials are rejected; supply them
    /// through [`ProxyCredentials`] instead.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let invalid = |reason: String| MtlsError::Configuration {
            reason: format!("invalid proxy '{input}': {reason}"),
        };

        let url = if input.contains("://") {
            Url::parse(input)
        } else {
            Url::parse(&format!("http://{input}"))
        }
        .map_err(|e| invalid(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" => ProxyScheme::Http,
            "https" => ProxyScheme::Https,
            other => return Err(invalid(format!("unsupported scheme '{other}'"))),
        };

        if !url.username().is_empty() || url.password().is_some() {
            return Err(invalid(
                "credentials must not be embedded in the proxy address".to_string(),
            ));
        }

        let host = match url.host() {
            Some(url::Host::Ipv6(addr)) => addr.to_string(),
            Some(host) => host.to_string(),
            None => return Err(invalid("missing host".to_string())),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port".to_string()))?;

        Ok(Self { scheme, host, port })
    }

    /// Scheme
    pub fn scheme(&self) -> ProxyScheme {
        self.scheme
    }

    /// Host name or address, without brackets
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        authority(&self.host, self.port)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

/// Render `host:port`, bracketing IPv6 literals
pub fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Credentials sent to the proxy with the tunnel request
#[derive(Clone)]
pub enum ProxyCredentials {
    /// HTTP Basic authentication
    Basic {
        /// User name
        username: String,
        /// Password
        password: Zeroizing<String>,
    },
}

impl ProxyCredentials {
    /// Basic credentials
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    fn header_value(&self) -> Zeroizing<String> {
        match self {
            Self::Basic { username, password } => {
                let raw = Zeroizing::new(format!("{username}:{}", password.as_str()));
                Zeroizing::new(format!("Basic {}", STANDARD.encode(raw.as_bytes())))
            }
        }
    }
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Timeouts for the proxy hop
#[derive(Debug, Clone, Copy)]
pub struct TunnelTimeouts {
    /// TCP connect to the proxy, plus TLS to an `https` proxy
    pub connect: Duration,
    /// Wait for the proxy's answer to `CONNECT`
    pub response: Duration,
}

/// Negotiates `CONNECT` tunnels through one proxy
#[derive(Debug, Clone)]
pub struct ProxyTunnel {
    endpoint: ProxyEndpoint,
    credentials: Option<ProxyCredentials>,
    timeouts: TunnelTimeouts,
}

impl ProxyTunnel {
    /// Create a negotiator
    pub fn new(
        endpoint: ProxyEndpoint,
        credentials: Option<ProxyCredentials>,
        timeouts: TunnelTimeouts,
    ) -> Self {
        Self {
            endpoint,
            credentials,
            timeouts,
        }
    }

    /// Proxy endpoint
    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }

    /// Open a tunnel to `target_host:target_port`
    ///
    /// `tls` is used only for `https` proxies and must not present a client
    /// certificate.
    pub async fn open(
        &self,
        target_host: &str,
        target_port: u16,
        tls: &TlsConnector,
    ) -> Result<BoxedStream> {
        let proxy = self.endpoint.authority();
        let mut stream = self.connect_proxy(tls).await?;

        let target = authority(target_host, target_port);
        debug!(proxy = %proxy, target = %target, "Requesting tunnel");

        match tokio::time::timeout(
            self.timeouts.response,
            negotiate(&mut stream, &target, self.credentials.as_ref()),
        )
        .await
        {
            Ok(Ok(())) => {
                info!(proxy = %proxy, target = %target, "Proxy tunnel established");
                Ok(stream)
            }
            Ok(Err(e)) => {
                warn!(proxy = %proxy, target = %target, error = %e, "Proxy tunnel failed");
                Err(e)
            }
            Err(_) => Err(MtlsError::ProxyTimeout {
                proxy,
                waited: self.timeouts.response,
            }),
        }
    }

    async fn connect_proxy(&self, tls: &TlsConnector) -> Result<BoxedStream> {
        let proxy = self.endpoint.authority();
        let unreachable = |reason: String| MtlsError::ProxyUnreachable {
            proxy: proxy.clone(),
            reason,
        };

        let connect = async {
            let tcp = TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port))
                .await
                .map_err(|e| unreachable(e.to_string()))?;
            if let Err(e) = tcp.set_nodelay(true) {
                debug!(proxy = %self.endpoint, error = %e, "Failed to set TCP_NODELAY");
            }

            match self.endpoint.scheme {
                ProxyScheme::Http => Ok(Box::new(tcp) as BoxedStream),
                ProxyScheme::Https => {
                    let server_name = ServerName::try_from(self.endpoint.host.clone())
                        .map_err(|e| unreachable(format!("invalid proxy server name: {e}")))?;
                    let tls_stream = tls
                        .connect(server_name, tcp)
                        .await
                        .map_err(|e| unreachable(format!("TLS to proxy failed: {e}")))?;
                    Ok(Box::new(tls_stream) as BoxedStream)
                }
            }
        };

        tokio::time::timeout(self.timeouts.connect, connect)
            .await
            .map_err(|_| {
                unreachable(format!(
                    "connect timed out after {:?}",
                    self.timeouts.connect
                ))
            })?
    }
}

/// Send `CONNECT` and wait for a 2xx answer
pub async fn negotiate<S>(
    stream: &mut S,
    target: &str,
    credentials: Option<&ProxyCredentials>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut request = Zeroizing::new(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n"));
    if let Some(credentials) = credentials {
        request.push_str("Proxy-Authorization: ");
        request.push_str(&credentials.header_value());
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    let rejected = |status: Option<u16>, reason: String| MtlsError::ProxyTunnelRejected {
        target: target.to_string(),
        status,
        reason,
    };

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| rejected(None, format!("failed to send CONNECT: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| rejected(None, format!("failed to send CONNECT: {e}")))?;

    let head = read_response_head(stream)
        .await
        .map_err(|reason| rejected(None, reason))?;
    let status_line = head.lines().next().unwrap_or_default();
    let (status, reason) = parse_status_line(status_line)
        .ok_or_else(|| rejected(None, format!("malformed status line '{status_line}'")))?;

    if (200..300).contains(&status) {
        debug!(target, status, "CONNECT accepted");
        Ok(())
    } else {
        Err(rejected(Some(status), format!("{status} {reason}")))
    }
}

/// Read up to and including the blank line ending the response head
///
/// Reads byte by byte so nothing past the head is consumed; the TLS handshake
/// starts right after it.
async fn read_response_head<S>(stream: &mut S) -> std::result::Result<String, String>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(format!("response head exceeds {MAX_RESPONSE_HEAD} bytes"));
        }
        match stream.read(&mut byte).await {
            Ok(0) => return Err("proxy closed the connection".to_string()),
            Ok(_) => head.push(byte[0]),
            Err(e) => return Err(format!("failed to read proxy response: {e}")),
        }
    }

    String::from_utf8(head).map_err(|_| "proxy response is not valid UTF-8".to_string())
}

fn parse_status_line(line: &str) -> Option<(u16, &str)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let status = parts.next()?.parse().ok()?;
    Some((status, parts.next().unwrap_or("").trim()))
}
