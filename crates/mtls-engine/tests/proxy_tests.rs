//! Tunnelling through a forward proxy

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use common::*;
use mtls_engine::{ConnectionState, MtlsEngine, MtlsError, ProxyCredentials};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn engine_via(
    scenario: &Scenario,
    proxy_url: &str,
    log: Option<Arc<TransitionLog>>,
    credentials: Option<ProxyCredentials>,
) -> MtlsEngine {
    let mut builder = MtlsEngine::builder(configuration().with_proxy(proxy_url))
        .target(HOST, scenario.server.port())
        .resolver(Arc::new(scenario.resolver()))
        .connection_config(connection_config());
    if let Some(log) = log {
        builder = builder.observer(log);
    }
    if let Some(credentials) = credentials {
        builder = builder.proxy_credentials(credentials);
    }
    builder.build().await.expect("engine")
}

#[tokio::test]
async fn test_handshake_runs_inside_the_tunnel() {
    let scenario = Scenario::start().await;
    let proxy = TestProxy::start(ProxyMode::Accept).await;
    let log = Arc::new(TransitionLog::default());
    let engine = engine_via(&scenario, &proxy.url(), Some(log.clone()), None).await;

    let mut connection = engine.acquire().await.unwrap();
    assert_eq!(
        read_fingerprint_line(&mut connection).await,
        engine.trust_context().fingerprint().to_string()
    );
    connection.write_all(b"tunnelled").await.unwrap();
    let mut echoed = [0u8; 9];
    connection.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"tunnelled");

    let authority = format!("{HOST}:{}", scenario.server.port());
    let requests = proxy.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].starts_with(&format!("CONNECT {authority} HTTP/1.1\r\n")));
    assert!(requests[0].contains(&format!("Host: {authority}\r\n")));
    assert!(!requests[0].contains("Proxy-Authorization"));

    assert_eq!(
        log.first_path(),
        vec![
            ConnectionState::Idle,
            ConnectionState::Tunneling,
            ConnectionState::Handshaking,
            ConnectionState::Established,
        ]
    );
}

#[tokio::test]
async fn test_handshake_runs_inside_a_tls_protected_tunnel() {
    let scenario = Scenario::start().await;
    // ca.pem holds the server CA, so the proxy certificate is trusted as well
    let proxy = TestProxy::start_tls(ProxyMode::Accept, &scenario.server_ca).await;
    assert!(proxy.url().starts_with("https://"));
    let log = Arc::new(TransitionLog::default());
    let engine = engine_via(&scenario, &proxy.url(), Some(log.clone()), None).await;

    let mut connection = engine.acquire().await.unwrap();
    assert_eq!(
        read_fingerprint_line(&mut connection).await,
        engine.trust_context().fingerprint().to_string()
    );
    connection.write_all(b"double-wrapped").await.unwrap();
    let mut echoed = [0u8; 14];
    connection.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"double-wrapped");
    engine.release(connection);

    let authority = format!("{HOST}:{}", scenario.server.port());
    let requests = proxy.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].starts_with(&format!("CONNECT {authority} HTTP/1.1\r\n")));
    assert_eq!(scenario.server.accepted(), 1);
    assert_eq!(
        log.first_path(),
        vec![
            ConnectionState::Idle,
            ConnectionState::Tunneling,
            ConnectionState::Handshaking,
            ConnectionState::Established,
        ]
    );
}

#[tokio::test]
async fn test_untrusted_tls_proxy_is_unreachable() {
    let scenario = Scenario::start().await;
    let stranger = TestCa::new("Unknown Proxy CA");
    let proxy = TestProxy::start_tls(ProxyMode::Accept, &stranger).await;
    let engine = engine_via(&scenario, &proxy.url(), None, None).await;

    let err = engine.acquire().await.unwrap_err();
    assert!(matches!(err, MtlsError::ProxyUnreachable { .. }), "{err}");
    assert!(proxy.requests().is_empty());
    assert_eq!(scenario.server.accepted(), 0);
}

#[tokio::test]
async fn test_rejected_tunnel_never_starts_a_handshake() {
    let scenario = Scenario::start().await;
    let proxy = TestProxy::start(ProxyMode::Reject(403)).await;
    let log = Arc::new(TransitionLog::default());
    let engine = engine_via(&scenario, &proxy.url(), Some(log.clone()), None).await;

    let err = engine.acquire().await.unwrap_err();
    assert!(
        matches!(err, MtlsError::ProxyTunnelRejected { status: Some(403), .. }),
        "{err}"
    );
    assert!(err.is_proxy_error());

    assert_eq!(
        log.first_path(),
        vec![
            ConnectionState::Idle,
            ConnectionState::Tunneling,
            ConnectionState::Failed,
            ConnectionState::Closed,
        ]
    );
    assert!(!log.reached(ConnectionState::Handshaking));
    assert_eq!(scenario.server.accepted(), 0);
}

#[tokio::test]
async fn test_silent_proxy_times_out() {
    let scenario = Scenario::start().await;
    let proxy = TestProxy::start(ProxyMode::Silent).await;
    let engine = engine_via(&scenario, &proxy.url(), None, None).await;

    let started = Instant::now();
    let err = engine.acquire().await.unwrap_err();

    assert!(matches!(err, MtlsError::ProxyTimeout { .. }), "{err}");
    assert!(err.is_retryable());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(proxy.requests().len(), 1);
    assert_eq!(engine.stats().connections_created, 0);
}

#[tokio::test]
async fn test_unreachable_proxy() {
    let scenario = Scenario::start().await;
    let closed_port = {
        let listener = tokio::net::TcpListener::bind((HOST, 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let engine = engine_via(&scenario, &format!("http://{HOST}:{closed_port}"), None, None).await;

    let err = engine.acquire().await.unwrap_err();
    assert!(matches!(err, MtlsError::ProxyUnreachable { .. }), "{err}");
    assert!(err.is_proxy_error());
    assert_eq!(scenario.server.accepted(), 0);
}

#[tokio::test]
async fn test_proxy_credentials_are_sent_with_connect() {
    let scenario = Scenario::start().await;
    let proxy = TestProxy::start(ProxyMode::Accept).await;
    let engine = engine_via(
        &scenario,
        &proxy.url(),
        None,
        Some(ProxyCredentials::basic("gateway", "s3cret")),
    )
    .await;

    let connection = engine.acquire().await.unwrap();
    engine.release(connection);

    let expected = format!("Proxy-Authorization: Basic {}\r\n", STANDARD.encode("gateway:s3cret"));
    assert!(proxy.requests()[0].contains(&expected));
}

#[tokio::test]
async fn test_proxy_cannot_change_on_rotation() {
    let scenario = Scenario::start().await;
    let proxy = TestProxy::start(ProxyMode::Accept).await;
    let engine = engine_via(&scenario, &proxy.url(), None, None).await;

    let err = engine
        .rotate(&configuration().with_proxy("http://127.0.0.1:1"))
        .await
        .unwrap_err();
    assert!(matches!(err, MtlsError::Configuration { .. }), "{err}");

    let err = engine.rotate(&configuration()).await.unwrap_err();
    assert!(matches!(err, MtlsError::Configuration { .. }), "{err}");
    assert_eq!(engine.generation(), 0);
}

#[tokio::test]
async fn test_invalid_proxy_is_rejected_at_build() {
    let scenario = Scenario::start().await;
    let err = MtlsEngine::builder(configuration().with_proxy("socks5://127.0.0.1:1080"))
        .target(HOST, scenario.server.port())
        .resolver(Arc::new(scenario.resolver()))
        .connection_config(connection_config())
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, MtlsError::Configuration { .. }), "{err}");
}
