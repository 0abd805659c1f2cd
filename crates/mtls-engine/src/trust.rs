//! Trust context construction
//!
//! Turns [`TransportMaterial`] into a rustls client configuration that presents the
//! transport certificate as the client identity. Validation happens here, before any
//! socket is opened.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustls::client::ResolvesClientCert;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls::sign::{CertifiedKey, SigningKey as _};
use rustls::{ClientConfig, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::error::{KeyPurpose, MtlsError};
use crate::material::{Fingerprint, KeyFormat, TransportMaterial, ValidityWindow};
use crate::Result;

/// Parse PEM CA certificates
pub fn parse_ca_bundle(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut &pem[..]).collect();
    let certs = certs.map_err(|e| MtlsError::Configuration {
        reason: format!("Failed to parse CA bundle: {e}"),
    })?;

    if certs.is_empty() {
        return Err(MtlsError::Configuration {
            reason: "CA bundle contains no certificates".to_string(),
        });
    }
    Ok(certs)
}

/// Always presents the one transport identity
#[derive(Debug)]
struct TransportIdentity(Arc<CertifiedKey>);

impl ResolvesClientCert for TransportIdentity {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Immutable TLS client context shared by every connection of one generation
#[derive(Clone)]
pub struct TrustContext {
    connector: TlsConnector,
    proxy_connector: TlsConnector,
    fingerprint: Fingerprint,
    validity: ValidityWindow,
    generation: u64,
    subject: String,
    serial: String,
}

impl TrustContext {
    /// Start building from transport material
    pub fn builder(material: TransportMaterial) -> TrustContextBuilder {
        TrustContextBuilder::new(material)
    }

    /// Connector presenting the client certificate to the target
    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    /// Connector for TLS to an `https://` proxy; no client certificate
    pub fn proxy_connector(&self) -> &TlsConnector {
        &self.proxy_connector
    }

    /// Fingerprint of the client certificate presented by this context
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Validity window of the client certificate
    pub fn validity(&self) -> ValidityWindow {
        self.validity
    }

    /// Rotation generation; increases with every rotation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Client certificate subject
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Client certificate serial
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Instant after which connections from this context count as expired
    pub fn connection_expiry(&self, safety_margin: Duration) -> DateTime<Utc> {
        let margin = chrono::Duration::from_std(safety_margin).unwrap_or(chrono::Duration::MAX);
        self.validity
            .not_after
            .checked_sub_signed(margin)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Fail unless a connection created now would be usable
    ///
    /// A connection is refused once `now` passes `notAfter - safety_margin`, since it
    /// would be expired the moment it was established.
    pub fn ensure_usable(&self, now: DateTime<Utc>, safety_margin: Duration) -> Result<()> {
        self.validity.check(now)?;
        if now >= self.connection_expiry(safety_margin) {
            return Err(MtlsError::CertificateExpired {
                not_after: self.validity.not_after,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for TrustContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustContext")
            .field("fingerprint", &self.fingerprint)
            .field("generation", &self.generation)
            .field("subject", &self.subject)
            .field("serial", &self.serial)
            .field("validity", &self.validity)
            .finish_non_exhaustive()
    }
}

/// Builder for [`TrustContext`]; takes ownership of the transport material
#[derive(Debug)]
pub struct TrustContextBuilder {
    material: TransportMaterial,
    ca_certificates: Vec<CertificateDer<'static>>,
    use_webpki_roots: bool,
    alpn_protocols: Vec<Vec<u8>>,
    generation: u64,
}

impl TrustContextBuilder {
    /// New builder trusting only the bundled web PKI roots
    pub fn new(material: TransportMaterial) -> Self {
        Self {
            material,
            ca_certificates: Vec::new(),
            use_webpki_roots: true,
            alpn_protocols: Vec::new(),
            generation: 0,
        }
    }

    /// Trust additional CA certificates for the target and the proxy
    pub fn ca_certificates(mut self, certs: Vec<CertificateDer<'static>>) -> Self {
        self.ca_certificates = certs;
        self
    }

    /// Include or exclude the bundled Mozilla roots
    pub fn use_webpki_roots(mut self, enabled: bool) -> Self {
        self.use_webpki_roots = enabled;
        self
    }

    /// ALPN protocols to offer the target
    pub fn alpn_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.alpn_protocols = protocols
            .into_iter()
            .map(|p| p.as_ref().as_bytes().to_vec())
            .collect();
        self
    }

    /// Set the rotation generation
    pub fn generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Validate the material at `now` and build the context
    pub fn build_at(self, now: DateTime<Utc>) -> Result<TrustContext> {
        let material = self.material;
        let fingerprint = material.fingerprint();

        material.validity().check(now)?;

        if !material.key_matches_certificate() {
            return Err(MtlsError::KeyCertificateMismatch {
                fingerprint: fingerprint.to_string(),
            });
        }

        let mut roots = RootCertStore::empty();
        if self.use_webpki_roots {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        for cert in self.ca_certificates {
            roots.add(cert).map_err(|e| MtlsError::Configuration {
                reason: format!("Failed to add CA certificate: {e}"),
            })?;
        }
        if roots.is_empty() {
            return Err(MtlsError::Configuration {
                reason: "no trust anchors: enable web PKI roots or configure a CA bundle"
                    .to_string(),
            });
        }
        let roots = Arc::new(roots);

        let identity = Arc::new(TransportIdentity(Arc::new(certified_key(&material)?)));

        let mut client_config = client_config_builder()?
            .with_root_certificates(roots.clone())
            .with_client_cert_resolver(identity);
        client_config.alpn_protocols = self.alpn_protocols;

        let proxy_config = client_config_builder()?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let certificate = material.certificate();
        let context = TrustContext {
            connector: TlsConnector::from(Arc::new(client_config)),
            proxy_connector: TlsConnector::from(Arc::new(proxy_config)),
            fingerprint,
            validity: certificate.validity,
            generation: self.generation,
            subject: certificate.subject.clone(),
            serial: certificate.serial.clone(),
        };

        info!(
            fingerprint = %context.fingerprint,
            generation = context.generation,
            subject = %context.subject,
            not_after = %context.validity.not_after,
            "Trust context built"
        );

        // Dropping the material scrubs the raw key bytes
        drop(material);
        Ok(context)
    }

    /// Validate against the current time and build the context
    pub fn build(self) -> Result<TrustContext> {
        self.build_at(Utc::now())
    }
}

fn client_config_builder() -> Result<rustls::ConfigBuilder<ClientConfig, rustls::WantsVerifier>> {
    ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| MtlsError::Configuration {
            reason: format!("Failed to select TLS protocol versions: {e}"),
        })
}

/// Load the transport key into the TLS signer, borrowing the secret bytes
fn certified_key(material: &TransportMaterial) -> Result<CertifiedKey> {
    let (format, secret) = material.secret_der();
    let key_der = match format {
        KeyFormat::Pkcs8 => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(secret)),
        KeyFormat::Sec1 => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(secret)),
        KeyFormat::Pkcs1 => PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(secret)),
    };

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der).map_err(|e| {
        MtlsError::MaterialMalformed {
            purpose: KeyPurpose::Transport,
            reason: format!("private key not usable for TLS: {e}"),
        }
    })?;
    debug!(algorithm = ?signing_key.algorithm(), "Transport signing key loaded");

    Ok(CertifiedKey::new(material.chain().to_vec(), signing_key))
}
