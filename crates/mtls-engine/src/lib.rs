//! # mTLS Connection Establishment Engine
//!
//! Produces pooled, mutually authenticated TLS connections to a remote service,
//! optionally through a forward proxy, and signs outbound payloads with a separate
//! signing key.
//!
//! The engine consumes an [`MtlsConfiguration`] naming two independent credentials:
//!
//! - the **transport certificate**: a PEM bundle with the client certificate chain and
//!   its (normally password-encrypted) private key, presented during the TLS handshake
//! - the **signing key**: a PEM private key used only to sign application payloads
//!
//! The two are loaded into distinct, non-interchangeable types
//! ([`TransportMaterial`] and [`SigningMaterial`]) and never cross over.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mtls_engine::{MtlsConfiguration, MtlsEngine, PoolConfig};
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn example() -> mtls_engine::Result<()> {
//! let configuration = MtlsConfiguration::new(
//!     "/etc/bank/signing.pem",
//!     "classpath:certs/transport.pem",
//!     "changeit",
//! )
//! .with_proxy("https://proxy.domain.com:8443");
//!
//! let engine = MtlsEngine::builder(configuration)
//!     .target("api.bank.example", 443)
//!     .pool_config(PoolConfig::default().max_connections(8))
//!     .build()
//!     .await?;
//!
//! let body = br#"{"instructedAmount":{"amount":"10.00","currency":"EUR"}}"#;
//! let jws = engine.sign_detached_jws(body)?;
//!
//! let mut connection = engine.acquire().await?;
//! connection.write_all(body).await?;
//! engine.release(connection);
//! # let _ = jws;
//! # Ok(())
//! # }
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──▶ Tunneling ──▶ Handshaking ──▶ Established ──▶ Closed
//!   │          │              │               │  │
//!   └──────────┼─────────────▶│               │  └──▶ Expired ──▶ Closed
//!              └──▶ Failed ◀──┴───────────────┘
//!                     │
//!                     └──▶ Closed
//! ```
//!
//! Credential problems are detected before any socket is opened. Network failures are
//! classified as retryable ([`MtlsError::is_retryable`]) but never retried internally.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub use config::{ConnectionConfig, MtlsConfiguration, PoolConfig};
pub use connection::{
    Connection, ConnectionId, ConnectionObserver, ConnectionState, Connector, Target,
};
pub use engine::{MtlsEngine, MtlsEngineBuilder};
pub use error::{ErrorCategory, KeyPurpose, MtlsError};
pub use material::{
    CertificateSummary, Fingerprint, KeyAlgorithm, KeyMaterial, KeyMaterialLoader, PublicKey,
    Signing, SigningMaterial, Transport, TransportMaterial, ValidityWindow,
};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use proxy::{ProxyCredentials, ProxyEndpoint, ProxyScheme, ProxyTunnel};
pub use resolver::{FileSystemResolver, ResolveError, ResourceResolver, StaticResolver};
pub use signing::{
    RequestSigner, SignatureArtifact, SigningAlgorithm, SigningCapability, VerificationKey,
};
pub use trust::{TrustContext, TrustContextBuilder};

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod material;
pub mod pool;
pub mod proxy;
pub mod resolver;
pub mod signing;
pub mod trust;

#[cfg(test)]
mod test_utils;

/// Engine result type
pub type Result<T> = std::result::Result<T, MtlsError>;

/// Current crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
