//! Engine configuration
//!
//! [`MtlsConfiguration`] is the credential record supplied by the caller. It only
//! names locations and secrets; the engine resolves and validates them when the
//! engine is built. [`ConnectionConfig`] and [`PoolConfig`] carry the tunables for
//! connection establishment and pooling.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::MtlsError;
use crate::proxy::ProxyEndpoint;
use crate::signing::SigningAlgorithm;
use crate::Result;

/// Credential locations and secrets for mutual TLS plus payload signing
///
/// Field aliases accept the camelCase names used by existing deployments, so a
/// record such as `{"mtlsTransportCertLocation": "..."}` deserializes directly.
#[derive(Clone, Serialize, Deserialize)]
pub struct MtlsConfiguration {
    /// Location of the payload signing private key (PEM)
    #[serde(alias = "mtlsDigitalSigningPrivateKeyLocation")]
    pub signing_key_location: String,

    /// Location of the transport certificate bundle (PEM chain plus encrypted key)
    #[serde(alias = "mtlsTransportCertLocation")]
    pub transport_cert_location: String,

    /// Password protecting the transport private key
    #[serde(default, alias = "mtlsTransportCertPassword", skip_serializing)]
    pub transport_cert_password: Zeroizing<String>,

    /// Forward proxy, e.g. `https://proxy.domain.com:8443`. Empty means no proxy.
    #[serde(default)]
    pub proxy: Option<String>,

    /// Additional CA certificates (PEM) trusted for the target and the proxy
    #[serde(default, alias = "caBundleLocation")]
    pub ca_bundle_location: Option<String>,

    /// Force a signing algorithm instead of deriving it from the key type
    #[serde(default, alias = "signingAlgorithm")]
    pub signing_algorithm: Option<SigningAlgorithm>,
}

impl MtlsConfiguration {
    /// Create a configuration without proxy or custom trust
    pub fn new(
        signing_key_location: impl Into<String>,
        transport_cert_location: impl Into<String>,
        transport_cert_password: impl Into<String>,
    ) -> Self {
        Self {
            signing_key_location: signing_key_location.into(),
            transport_cert_location: transport_cert_location.into(),
            transport_cert_password: Zeroizing::new(transport_cert_password.into()),
            proxy: None,
            ca_bundle_location: None,
            signing_algorithm: None,
        }
    }

    /// Route connections through a forward proxy
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Trust additional CA certificates
    pub fn with_ca_bundle(mut self, location: impl Into<String>) -> Self {
        self.ca_bundle_location = Some(location.into());
        self
    }

    /// Pin the signing algorithm
    pub fn with_signing_algorithm(mut self, algorithm: SigningAlgorithm) -> Self {
        self.signing_algorithm = Some(algorithm);
        self
    }

    /// Parse the proxy field; absent or blank yields `None`
    pub fn proxy_endpoint(&self) -> Result<Option<ProxyEndpoint>> {
        match self.proxy.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(proxy) => ProxyEndpoint::parse(proxy).map(Some),
        }
    }

    /// Check that required locations are present
    pub fn validate(&self) -> Result<()> {
        if self.signing_key_location.trim().is_empty() {
            return Err(MtlsError::Configuration {
                reason: "signing key location must not be empty".to_string(),
            });
        }
        if self.transport_cert_location.trim().is_empty() {
            return Err(MtlsError::Configuration {
                reason: "transport certificate location must not be empty".to_string(),
            });
        }
        if let Some(ca) = &self.ca_bundle_location
            && ca.trim().is_empty()
        {
            return Err(MtlsError::Configuration {
                reason: "CA bundle location must not be blank when set".to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for MtlsConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MtlsConfiguration")
            .field("signing_key_location", &self.signing_key_location)
            .field("transport_cert_location", &self.transport_cert_location)
            .field("transport_cert_password", &"<redacted>")
            .field("proxy", &self.proxy)
            .field("ca_bundle_location", &self.ca_bundle_location)
            .field("signing_algorithm", &self.signing_algorithm)
            .finish()
    }
}

/// Connection establishment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Timeout for the TCP connect to the proxy or the target
    pub connect_timeout: Duration,
    /// Timeout waiting for the proxy's answer to the tunnel request
    pub proxy_response_timeout: Duration,
    /// Timeout for the TLS handshake
    pub handshake_timeout: Duration,
    /// Connections expire this long before the certificate's notAfter
    pub expiry_safety_margin: Duration,
    /// ALPN protocols offered to the target
    pub alpn_protocols: Vec<String>,
    /// Trust the bundled Mozilla root set in addition to any CA bundle
    pub use_webpki_roots: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            proxy_response_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            expiry_safety_margin: Duration::from_secs(300), // 5 minutes
            alpn_protocols: Vec::new(),
            use_webpki_roots: true,
        }
    }
}

impl ConnectionConfig {
    /// Validate timeouts
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("proxy_response_timeout", self.proxy_response_timeout),
            ("handshake_timeout", self.handshake_timeout),
        ] {
            if value < Duration::from_millis(10) {
                return Err(MtlsError::Configuration {
                    reason: format!("{name} must be at least 10ms"),
                });
            }
        }
        if self.alpn_protocols.iter().any(String::is_empty) {
            return Err(MtlsError::Configuration {
                reason: "ALPN protocol names must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of live connections, idle or checked out
    pub max_connections: usize,
    /// Idle connections older than this are closed
    pub max_idle_time: Duration,
    /// Default bound on how long `acquire` waits for a slot
    pub acquire_timeout: Duration,
    /// How often the maintenance task sweeps idle connections
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_idle_time: Duration::from_secs(300), // 5 minutes
            acquire_timeout: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Set the pool bound
    #[must_use]
    pub const fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the idle eviction threshold
    #[must_use]
    pub const fn max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = idle;
        self
    }

    /// Set the default acquire timeout
    #[must_use]
    pub const fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the maintenance sweep interval
    #[must_use]
    pub const fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Validate pool bounds
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(MtlsError::Configuration {
                reason: "max_connections must be greater than 0".to_string(),
            });
        }
        if self.maintenance_interval.is_zero() {
            return Err(MtlsError::Configuration {
                reason: "maintenance_interval must be greater than 0".to_string(),
            });
        }
        if std::time::Instant::now()
            .checked_add(self.acquire_timeout)
            .is_none()
        {
            return Err(MtlsError::Configuration {
                reason: format!("acquire_timeout {:?} is too large", self.acquire_timeout),
            });
        }
        Ok(())
    }
}
