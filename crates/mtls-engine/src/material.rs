//! Key material loading
//!
//! The loader resolves the two configured credentials independently and turns them
//! into [`KeyMaterial`] handles. The handles are tagged with their purpose at the
//! type level: a [`SigningMaterial`] cannot be passed where a [`TransportMaterial`]
//! is expected, and vice versa.
//!
//! Secret key bytes live in zeroizing buffers from the moment they are resolved
//! until the owning handle is dropped.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, EncryptedPrivateKeyInfo};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use x509_parser::pem::Pem;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::config::MtlsConfiguration;
use crate::error::{KeyPurpose, MtlsError};
use crate::resolver::ResourceResolver;
use crate::Result;

/// SHA-256 fingerprint, rendered as `sha256:<hex>`
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint arbitrary bytes
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Raw digest
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex digest without prefix
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Certificate validity window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
}

impl ValidityWindow {
    /// Fail unless `not_before <= now <= not_after`
    pub fn check(&self, now: DateTime<Utc>) -> Result<()> {
        if now < self.not_before {
            return Err(MtlsError::CertificateNotYetValid {
                not_before: self.not_before,
            });
        }
        if now > self.not_after {
            return Err(MtlsError::CertificateExpired {
                not_after: self.not_after,
            });
        }
        Ok(())
    }

    /// Whether `now` lies inside the window
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.check(now).is_ok()
    }
}

/// Parsed facts about the leaf transport certificate
#[derive(Debug, Clone)]
pub struct CertificateSummary {
    /// Subject distinguished name
    pub subject: String,
    /// Issuer distinguished name
    pub issuer: String,
    /// Serial number as colon-separated hex
    pub serial: String,
    /// Validity window
    pub validity: ValidityWindow,
    /// DER SubjectPublicKeyInfo from the certificate
    pub public_key_der: Vec<u8>,
}

impl CertificateSummary {
    fn parse(der: &[u8]) -> std::result::Result<Self, String> {
        let (_, cert) =
            X509Certificate::from_der(der).map_err(|e| format!("X.509 parse error: {e}"))?;
        let validity = cert.validity();

        Ok(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: cert.raw_serial_as_string(),
            validity: ValidityWindow {
                not_before: timestamp(validity.not_before.timestamp())?,
                not_after: timestamp(validity.not_after.timestamp())?,
            },
            public_key_der: cert.public_key().raw.to_vec(),
        })
    }
}

fn timestamp(secs: i64) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| format!("timestamp {secs} out of range"))
}

/// Public half of a supported key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// NIST P-256 point
    EcdsaP256(p256::PublicKey),
    /// RSA modulus and exponent
    Rsa(rsa::RsaPublicKey),
}

impl PublicKey {
    /// DER SubjectPublicKeyInfo
    pub fn to_spki_der(&self) -> Vec<u8> {
        let document = match self {
            Self::EcdsaP256(key) => key.to_public_key_der(),
            Self::Rsa(key) => key.to_public_key_der(),
        };
        // Encoding an in-memory key into SPKI cannot fail for these key types
        document.map(|d| d.as_bytes().to_vec()).unwrap_or_default()
    }

    /// Whether `spki_der` encodes this same key
    pub fn matches_spki(&self, spki_der: &[u8]) -> bool {
        match self {
            Self::EcdsaP256(key) => p256::PublicKey::from_public_key_der(spki_der)
                .map(|other| &other == key)
                .unwrap_or(false),
            Self::Rsa(key) => rsa::RsaPublicKey::from_public_key_der(spki_der)
                .map(|other| &other == key)
                .unwrap_or(false),
        }
    }

    /// Key algorithm
    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            Self::EcdsaP256(_) => KeyAlgorithm::EcdsaP256,
            Self::Rsa(key) => KeyAlgorithm::Rsa {
                bits: key.size() * 8,
            },
        }
    }

    /// RFC 7638 JWK thumbprint, base64url without padding
    pub fn jwk_thumbprint(&self) -> String {
        use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
        use p256::elliptic_curve::sec1::ToEncodedPoint;

        // Members in lexicographic order, no whitespace
        let canonical = match self {
            Self::EcdsaP256(key) => {
                let point = key.to_encoded_point(false);
                format!(
                    r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
                    URL_SAFE_NO_PAD.encode(point.x().map(|x| x.as_slice()).unwrap_or_default()),
                    URL_SAFE_NO_PAD.encode(point.y().map(|y| y.as_slice()).unwrap_or_default()),
                )
            }
            Self::Rsa(key) => format!(
                r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
                URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
                URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
            ),
        };

        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }
}

/// Algorithm family of a loaded key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// ECDSA over NIST P-256
    EcdsaP256,
    /// RSA with the given modulus size
    Rsa {
        /// Modulus size in bits
        bits: usize,
    },
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EcdsaP256 => f.write_str("ECDSA P-256"),
            Self::Rsa { bits } => write!(f, "RSA-{bits}"),
        }
    }
}

/// Encoding of the private key DER held by a [`KeyMaterial`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyFormat {
    Pkcs8,
    Sec1,
    Pkcs1,
}

/// Decoded private key; both variants zeroize their scalars on drop
pub(crate) enum PrivateKey {
    EcdsaP256(p256::SecretKey),
    Rsa(Box<rsa::RsaPrivateKey>),
}

impl PrivateKey {
    pub(crate) fn decode(format: KeyFormat, der: &[u8]) -> std::result::Result<Self, String> {
        match format {
            KeyFormat::Pkcs8 => {
                if let Ok(key) = p256::SecretKey::from_pkcs8_der(der) {
                    return Ok(Self::EcdsaP256(key));
                }
                if let Ok(key) = rsa::RsaPrivateKey::from_pkcs8_der(der) {
                    return Ok(Self::Rsa(Box::new(key)));
                }
                let info = pkcs8::PrivateKeyInfo::try_from(der)
                    .map_err(|e| format!("invalid PKCS#8 structure: {e}"))?;
                Err(format!(
                    "unsupported key algorithm {} (expected ECDSA P-256 or RSA)",
                    info.algorithm.oid
                ))
            }
            KeyFormat::Sec1 => p256::SecretKey::from_sec1_der(der)
                .map(Self::EcdsaP256)
                .map_err(|e| format!("invalid or non-P-256 SEC1 key: {e}")),
            KeyFormat::Pkcs1 => rsa::RsaPrivateKey::from_pkcs1_der(der)
                .map(|key| Self::Rsa(Box::new(key)))
                .map_err(|e| format!("invalid PKCS#1 RSA key: {e}")),
        }
    }

    pub(crate) fn public_key(&self) -> PublicKey {
        match self {
            Self::EcdsaP256(key) => PublicKey::EcdsaP256(key.public_key()),
            Self::Rsa(key) => PublicKey::Rsa(key.to_public_key()),
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Purpose marker for [`KeyMaterial`]
pub trait Purpose: sealed::Sealed + Send + Sync + 'static {
    /// Runtime tag for errors and logs
    const PURPOSE: KeyPurpose;
    /// Purpose-specific data carried next to the key
    type Attachment: fmt::Debug + Send + Sync;
}

/// Marker: material authenticates the TLS handshake
#[derive(Debug)]
pub enum Transport {}

/// Marker: material signs application payloads
#[derive(Debug)]
pub enum Signing {}

impl sealed::Sealed for Transport {}
impl sealed::Sealed for Signing {}

impl Purpose for Transport {
    const PURPOSE: KeyPurpose = KeyPurpose::Transport;
    type Attachment = CertificateChain;
}

impl Purpose for Signing {
    const PURPOSE: KeyPurpose = KeyPurpose::Signing;
    type Attachment = ();
}

/// Certificate chain presented during the handshake
#[derive(Debug)]
pub struct CertificateChain {
    certs: Vec<CertificateDer<'static>>,
    leaf: CertificateSummary,
}

/// Immutable handle over decoded key material for one purpose
///
/// Not `Clone`: whoever loaded it owns it until it is handed to the builder that
/// consumes it. The secret bytes are scrubbed when the handle is dropped.
pub struct KeyMaterial<P: Purpose> {
    location: String,
    format: KeyFormat,
    secret: Zeroizing<Vec<u8>>,
    public_key: PublicKey,
    fingerprint: Fingerprint,
    attachment: P::Attachment,
    _purpose: PhantomData<fn() -> P>,
}

/// Transport certificate chain plus its private key
pub type TransportMaterial = KeyMaterial<Transport>;

/// Payload signing private key
pub type SigningMaterial = KeyMaterial<Signing>;

impl<P: Purpose> KeyMaterial<P> {
    /// Location the material was loaded from
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Identifying fingerprint; stable across reloads of the same material
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Public half of the private key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Key algorithm
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.public_key.algorithm()
    }

    pub(crate) fn secret_der(&self) -> (KeyFormat, &[u8]) {
        (self.format, self.secret.as_slice())
    }

    pub(crate) fn decode_private_key(&self) -> std::result::Result<PrivateKey, String> {
        PrivateKey::decode(self.format, &self.secret)
    }
}

impl KeyMaterial<Transport> {
    /// Certificate chain, leaf first
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.attachment.certs
    }

    /// Leaf certificate facts
    pub fn certificate(&self) -> &CertificateSummary {
        &self.attachment.leaf
    }

    /// Leaf validity window
    pub fn validity(&self) -> ValidityWindow {
        self.certificate().validity
    }

    /// Leaf serial number
    pub fn serial(&self) -> &str {
        &self.certificate().serial
    }

    /// Whether the private key belongs to the leaf certificate
    pub fn key_matches_certificate(&self) -> bool {
        self.public_key
            .matches_spki(&self.certificate().public_key_der)
    }
}

impl<P: Purpose> fmt::Debug for KeyMaterial<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("purpose", &P::PURPOSE)
            .field("location", &self.location)
            .field("algorithm", &self.algorithm())
            .field("fingerprint", &self.fingerprint)
            .field("attachment", &self.attachment)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// One decoded PEM block with a zeroizing body
struct PemBlock {
    label: String,
    contents: Zeroizing<Vec<u8>>,
}

fn pem_blocks(purpose: KeyPurpose, bytes: &[u8]) -> Result<Vec<PemBlock>> {
    let mut blocks = Vec::new();
    for item in Pem::iter_from_buffer(bytes) {
        let Pem { label, contents } = item.map_err(|e| MtlsError::MaterialMalformed {
            purpose,
            reason: format!("invalid PEM: {e}"),
        })?;
        blocks.push(PemBlock {
            label,
            contents: Zeroizing::new(contents),
        });
    }

    if blocks.is_empty() {
        return Err(MtlsError::MaterialMalformed {
            purpose,
            reason: "no PEM blocks found".to_string(),
        });
    }
    Ok(blocks)
}

const ENCRYPTED_PKCS8_LABEL: &str = "ENCRYPTED PRIVATE KEY";

fn key_format(label: &str) -> Option<KeyFormat> {
    match label {
        "PRIVATE KEY" => Some(KeyFormat::Pkcs8),
        "EC PRIVATE KEY" => Some(KeyFormat::Sec1),
        "RSA PRIVATE KEY" => Some(KeyFormat::Pkcs1),
        _ => None,
    }
}

fn is_key_label(label: &str) -> bool {
    label == ENCRYPTED_PKCS8_LABEL || key_format(label).is_some()
}

fn single_key_block(purpose: KeyPurpose, blocks: Vec<PemBlock>) -> Result<PemBlock> {
    let mut keys: Vec<PemBlock> = blocks.into_iter().filter(|b| is_key_label(&b.label)).collect();
    match keys.len() {
        1 => Ok(keys.remove(0)),
        0 => Err(MtlsError::MaterialMalformed {
            purpose,
            reason: "no private key block found".to_string(),
        }),
        n => Err(MtlsError::MaterialMalformed {
            purpose,
            reason: format!("expected exactly one private key, found {n}"),
        }),
    }
}

/// Loads the signing key and the transport bundle
///
/// Resolves both credentials through the injected [`ResourceResolver`] and decodes
/// them. The two loads are independent: when both fail, both errors are reported.
#[derive(Debug, Clone)]
pub struct KeyMaterialLoader {
    resolver: Arc<dyn ResourceResolver>,
}

impl KeyMaterialLoader {
    /// Create a loader over the given resolver
    pub fn new(resolver: Arc<dyn ResourceResolver>) -> Self {
        Self { resolver }
    }

    /// Load both credentials named by `config`
    pub async fn load(
        &self,
        config: &MtlsConfiguration,
    ) -> Result<(SigningMaterial, TransportMaterial)> {
        let (signing, transport) = tokio::join!(
            self.load_signing(&config.signing_key_location),
            self.load_transport(
                &config.transport_cert_location,
                &config.transport_cert_password
            ),
        );

        match (signing, transport) {
            (Ok(signing), Ok(transport)) => Ok((signing, transport)),
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
            (Err(signing), Err(transport)) => Err(MtlsError::Multiple(vec![signing, transport])),
        }
    }

    /// Resolve and decode the signing key
    pub async fn load_signing(&self, location: &str) -> Result<SigningMaterial> {
        let bytes = self.resolve(KeyPurpose::Signing, location).await?;
        parse_signing(location, &bytes)
    }

    /// Resolve, decrypt and decode the transport certificate bundle
    pub async fn load_transport(&self, location: &str, password: &str) -> Result<TransportMaterial> {
        let bytes = self.resolve(KeyPurpose::Transport, location).await?;
        parse_transport(location, &bytes, password)
    }

    async fn resolve(&self, purpose: KeyPurpose, location: &str) -> Result<Zeroizing<Vec<u8>>> {
        let bytes = self
            .resolver
            .resolve(location)
            .await
            .map_err(|e| MtlsError::MaterialNotFound {
                purpose,
                location: location.to_string(),
                reason: e.reason,
            })?;

        if bytes.is_empty() {
            return Err(MtlsError::MaterialNotFound {
                purpose,
                location: location.to_string(),
                reason: "resource is empty".to_string(),
            });
        }
        Ok(bytes)
    }
}

/// Decode a signing key from PEM bytes
pub fn parse_signing(location: &str, bytes: &[u8]) -> Result<SigningMaterial> {
    let purpose = KeyPurpose::Signing;
    let block = single_key_block(purpose, pem_blocks(purpose, bytes)?)?;

    let Some(format) = key_format(&block.label) else {
        return Err(MtlsError::MaterialMalformed {
            purpose,
            reason: "encrypted signing keys are not supported".to_string(),
        });
    };

    let key = PrivateKey::decode(format, &block.contents)
        .map_err(|reason| MtlsError::MaterialMalformed { purpose, reason })?;
    let public_key = key.public_key();
    let fingerprint = Fingerprint::of(&public_key.to_spki_der());

    info!(
        location,
        algorithm = %public_key.algorithm(),
        fingerprint = %fingerprint,
        "Loaded signing key"
    );

    Ok(KeyMaterial {
        location: location.to_string(),
        format,
        secret: block.contents,
        public_key,
        fingerprint,
        attachment: (),
        _purpose: PhantomData,
    })
}

/// Decode a transport bundle (certificate chain plus private key) from PEM bytes
pub fn parse_transport(location: &str, bytes: &[u8], password: &str) -> Result<TransportMaterial> {
    let purpose = KeyPurpose::Transport;
    let blocks = pem_blocks(purpose, bytes)?;

    let mut chain = Vec::new();
    let mut rest = Vec::new();
    for block in blocks {
        if block.label == "CERTIFICATE" {
            chain.push(CertificateDer::from(block.contents.to_vec()));
        } else {
            rest.push(block);
        }
    }

    let Some(leaf) = chain.first() else {
        return Err(MtlsError::MaterialMalformed {
            purpose,
            reason: "no CERTIFICATE block found".to_string(),
        });
    };
    let certificate = CertificateSummary::parse(leaf)
        .map_err(|reason| MtlsError::MaterialMalformed { purpose, reason })?;
    for (index, intermediate) in chain.iter().enumerate().skip(1) {
        X509Certificate::from_der(intermediate).map_err(|e| MtlsError::MaterialMalformed {
            purpose,
            reason: format!("chain certificate {index}: {e}"),
        })?;
    }

    let block = single_key_block(purpose, rest)?;
    let (format, secret) = if block.label == ENCRYPTED_PKCS8_LABEL {
        (KeyFormat::Pkcs8, decrypt_pkcs8(location, &block.contents, password)?)
    } else {
        if !password.is_empty() {
            warn!(location, "Transport key is not encrypted; configured password is unused");
        }
        let format = key_format(&block.label).unwrap_or(KeyFormat::Pkcs8);
        (format, block.contents)
    };

    let key = PrivateKey::decode(format, &secret)
        .map_err(|reason| MtlsError::MaterialMalformed { purpose, reason })?;
    let public_key = key.public_key();
    drop(key);

    let fingerprint = Fingerprint::of(leaf);

    info!(
        location,
        subject = %certificate.subject,
        serial = %certificate.serial,
        not_after = %certificate.validity.not_after,
        fingerprint = %fingerprint,
        "Loaded transport certificate"
    );
    debug!(chain_len = chain.len(), algorithm = %public_key.algorithm(), "Transport chain decoded");

    Ok(KeyMaterial {
        location: location.to_string(),
        format,
        secret,
        public_key,
        fingerprint,
        attachment: CertificateChain {
            certs: chain,
            leaf: certificate,
        },
        _purpose: PhantomData,
    })
}

/// Decrypt a PKCS#8 `EncryptedPrivateKeyInfo`
///
/// Once the encrypted structure parses, any later failure is a password problem:
/// a wrong key either breaks the padding or yields plaintext that is not DER.
fn decrypt_pkcs8(location: &str, der: &[u8], password: &str) -> Result<Zeroizing<Vec<u8>>> {
    let encrypted =
        EncryptedPrivateKeyInfo::try_from(der).map_err(|e| MtlsError::MaterialMalformed {
            purpose: KeyPurpose::Transport,
            reason: format!("invalid encrypted PKCS#8 structure: {e}"),
        })?;

    let mismatch = || MtlsError::PasswordMismatch {
        location: location.to_string(),
    };

    let document = encrypted.decrypt(password.as_bytes()).map_err(|_| mismatch())?;
    pkcs8::PrivateKeyInfo::try_from(document.as_bytes()).map_err(|_| mismatch())?;

    Ok(Zeroizing::new(document.as_bytes().to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticResolver;
    use crate::test_utils::*;
    use pretty_assertions::assert_eq;

    fn loader(resolver: StaticResolver) -> KeyMaterialLoader {
        KeyMaterialLoader::new(Arc::new(resolver))
    }

    #[test]
    fn test_parse_signing_formats() {
        let pkcs8 = parse_signing("sign.pem", p256_pkcs8_pem().as_bytes()).unwrap();
        assert_eq!(pkcs8.algorithm(), KeyAlgorithm::EcdsaP256);
        assert_eq!(pkcs8.secret_der().0, KeyFormat::Pkcs8);

        let sec1 = parse_signing("sign.pem", p256_sec1_pem().as_bytes()).unwrap();
        assert_eq!(sec1.algorithm(), KeyAlgorithm::EcdsaP256);
        assert_eq!(sec1.secret_der().0, KeyFormat::Sec1);
    }

    #[test]
    fn test_parse_signing_rejects_garbage() {
        let err = parse_signing("sign.pem", b"not a key at all").unwrap_err();
        assert!(matches!(
            err,
            MtlsError::MaterialMalformed {
                purpose: KeyPurpose::Signing,
                ..
            }
        ));

        let ca = TestCa::new("Test CA");
        let cert_only = ca.issue_client("client").cert_pem;
        let err = parse_signing("sign.pem", cert_only.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("no private key"));
    }

    #[test]
    fn test_parse_transport_encrypted_bundle() {
        let ca = TestCa::new("Test CA");
        let client = ca.issue_client("client-a");
        let bundle = client.encrypted_bundle(TEST_PASSWORD);

        let material = parse_transport("transport.pem", bundle.as_bytes(), TEST_PASSWORD).unwrap();
        assert_eq!(material.chain().len(), 1);
        assert_eq!(material.fingerprint(), Fingerprint::of(&client.cert_der));
        assert!(material.certificate().subject.contains("client-a"));
        assert!(material.key_matches_certificate());
        assert!(material.validity().contains(Utc::now()));
    }

    #[test]
    fn test_wrong_password_is_password_mismatch() {
        let ca = TestCa::new("Test CA");
        let bundle = ca.issue_client("client").encrypted_bundle(TEST_PASSWORD);

        for attempt in ["wrong", "", "correct horse battery stapl"] {
            let err = parse_transport("transport.pem", bundle.as_bytes(), attempt).unwrap_err();
            assert!(
                matches!(err, MtlsError::PasswordMismatch { .. }),
                "password {attempt:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_transport_bundle_structure_errors() {
        let ca = TestCa::new("Test CA");
        let client = ca.issue_client("client");

        let key_only = encrypt_pkcs8_pem(&client.key_der, TEST_PASSWORD);
        let err = parse_transport("t.pem", key_only.as_bytes(), TEST_PASSWORD).unwrap_err();
        assert!(err.to_string().contains("no CERTIFICATE"));

        let err = parse_transport("t.pem", client.cert_pem.as_bytes(), TEST_PASSWORD).unwrap_err();
        assert!(err.to_string().contains("no private key"));

        let two_keys = format!("{}{}", client.plain_bundle(), client.key_pem);
        let err = parse_transport("t.pem", two_keys.as_bytes(), "").unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn test_unencrypted_transport_key_accepted() {
        let ca = TestCa::new("Test CA");
        let client = ca.issue_client("client");
        let material = parse_transport("t.pem", client.plain_bundle().as_bytes(), "").unwrap();
        assert!(material.key_matches_certificate());
    }

    #[test]
    fn test_foreign_key_is_detected() {
        let ca = TestCa::new("Test CA");
        let client = ca.issue_client("client");
        let other = ca.issue_client("other");
        let bundle = client.bundle_with_foreign_key(&other, TEST_PASSWORD);

        let material = parse_transport("t.pem", bundle.as_bytes(), TEST_PASSWORD).unwrap();
        assert!(!material.key_matches_certificate());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let material = parse_signing("sign.pem", p256_pkcs8_pem().as_bytes()).unwrap();
        let debug = format!("{material:?}");
        assert!(debug.contains("<redacted>"));
        assert!(debug.contains("Signing"));
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let ca = TestCa::new("Test CA");
        let resolver = StaticResolver::new()
            .with("sign.pem", p256_pkcs8_pem())
            .with("transport.pem", ca.issue_client("client").encrypted_bundle(TEST_PASSWORD));
        let loader = loader(resolver);
        let config = MtlsConfiguration::new("sign.pem", "transport.pem", TEST_PASSWORD);

        let (sign_a, transport_a) = loader.load(&config).await.unwrap();
        let (sign_b, transport_b) = loader.load(&config).await.unwrap();

        assert_eq!(sign_a.fingerprint(), sign_b.fingerprint());
        assert_eq!(transport_a.fingerprint(), transport_b.fingerprint());
        assert_eq!(transport_a.serial(), transport_b.serial());
    }

    #[tokio::test]
    async fn test_load_aggregates_independent_failures() {
        let ca = TestCa::new("Test CA");
        let resolver = StaticResolver::new()
            .with("transport.pem", ca.issue_client("client").encrypted_bundle(TEST_PASSWORD));
        let loader = loader(resolver);

        // Both fail: missing signing key and wrong password
        let config = MtlsConfiguration::new("missing.pem", "transport.pem", "nope");
        match loader.load(&config).await.unwrap_err() {
            MtlsError::Multiple(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(matches!(
                    errors[0],
                    MtlsError::MaterialNotFound {
                        purpose: KeyPurpose::Signing,
                        ..
                    }
                ));
                assert!(matches!(errors[1], MtlsError::PasswordMismatch { .. }));
            }
            other => panic!("expected aggregate, got {other:?}"),
        }

        // Only one fails: the specific error surfaces directly
        let config = MtlsConfiguration::new("missing.pem", "transport.pem", TEST_PASSWORD);
        assert!(matches!(
            loader.load(&config).await.unwrap_err(),
            MtlsError::MaterialNotFound { .. }
        ));
    }

    #[test]
    fn test_validity_window_check() {
        let now = Utc::now();
        let window = ValidityWindow {
            not_before: now - chrono::Duration::days(1),
            not_after: now + chrono::Duration::days(1),
        };
        assert!(window.check(now).is_ok());
        assert!(matches!(
            window.check(now - chrono::Duration::days(2)),
            Err(MtlsError::CertificateNotYetValid { .. })
        ));
        assert!(matches!(
            window.check(now + chrono::Duration::days(2)),
            Err(MtlsError::CertificateExpired { .. })
        ));
    }

    #[test]
    fn test_fingerprint_format() {
        let fingerprint = Fingerprint::of(b"abc");
        let rendered = fingerprint.to_string();
        assert!(rendered.starts_with("sha256:"));
        assert_eq!(rendered.len(), "sha256:".len() + 64);
    }
}
