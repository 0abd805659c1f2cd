//! Payload signing
//!
//! A [`SigningCapability`] is derived from [`SigningMaterial`] and owns the decoded
//! signing key. [`RequestSigner`] is the cheap, cloneable handle callers use to produce
//! signature artifacts; it never touches the TLS side of the engine.

use std::fmt;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use signature::{RandomizedSigner, SignatureEncoding, Signer, Verifier};
use tracing::{debug, info};

use crate::error::MtlsError;
use crate::material::{Fingerprint, KeyAlgorithm, PrivateKey, PublicKey, SigningMaterial};
use crate::Result;

/// Smallest RSA modulus accepted for signing
pub const MIN_RSA_BITS: usize = 2048;

/// JWS signature algorithms (RFC 7518)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    /// ECDSA with P-256 and SHA-256
    #[serde(rename = "ES256")]
    ES256,

    /// RSASSA-PSS with SHA-256
    #[serde(rename = "PS256")]
    PS256,

    /// RSASSA-PKCS1-v1_5 with SHA-256
    #[serde(rename = "RS256")]
    RS256,
}

impl SigningAlgorithm {
    /// Algorithm name as used in JOSE headers
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ES256 => "ES256",
            Self::PS256 => "PS256",
            Self::RS256 => "RS256",
        }
    }

    /// Algorithm used when none is configured
    pub fn default_for(key: KeyAlgorithm) -> Self {
        match key {
            KeyAlgorithm::EcdsaP256 => Self::ES256,
            KeyAlgorithm::Rsa { .. } => Self::PS256,
        }
    }

    /// Whether this algorithm can be used with the given key type
    pub fn supports(self, key: KeyAlgorithm) -> bool {
        matches!(
            (self, key),
            (Self::ES256, KeyAlgorithm::EcdsaP256)
                | (Self::PS256 | Self::RS256, KeyAlgorithm::Rsa { .. })
        )
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detached signature over one payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureArtifact {
    /// Algorithm that produced the signature
    pub algorithm: SigningAlgorithm,
    /// JWK thumbprint of the signing key
    pub key_id: String,
    /// Raw signature bytes; never empty
    pub signature: Vec<u8>,
}

impl SignatureArtifact {
    /// Signature bytes as unpadded base64url
    pub fn to_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.signature)
    }
}

#[derive(Serialize, Deserialize)]
struct JwsHeader {
    alg: String,
    kid: String,
    typ: String,
}

enum SignerKey {
    Es256(p256::ecdsa::SigningKey),
    Ps256(rsa::pss::BlindedSigningKey<Sha256>),
    Rs256(rsa::pkcs1v15::SigningKey<Sha256>),
}

/// Signing key wrapped for request signing
///
/// Immutable once built and safe to share across tasks.
pub struct SigningCapability {
    algorithm: SigningAlgorithm,
    key: SignerKey,
    verification_key: VerificationKey,
    fingerprint: Fingerprint,
}

impl SigningCapability {
    /// Derive a signing capability, consuming the material
    ///
    /// `algorithm` overrides the key-type default. Fails with
    /// [`MtlsError::SigningKeyInvalid`] when the key cannot sign with the
    /// chosen algorithm.
    pub fn new(material: SigningMaterial, algorithm: Option<SigningAlgorithm>) -> Result<Self> {
        let key_algorithm = material.algorithm();
        let algorithm = algorithm.unwrap_or_else(|| SigningAlgorithm::default_for(key_algorithm));

        if !algorithm.supports(key_algorithm) {
            return Err(MtlsError::SigningKeyInvalid {
                reason: format!("{algorithm} cannot be used with an {key_algorithm} key"),
            });
        }
        if let KeyAlgorithm::Rsa { bits } = key_algorithm
            && bits < MIN_RSA_BITS
        {
            return Err(MtlsError::SigningKeyInvalid {
                reason: format!("RSA key has {bits} bits, at least {MIN_RSA_BITS} required"),
            });
        }

        let private_key = material
            .decode_private_key()
            .map_err(|reason| MtlsError::SigningKeyInvalid { reason })?;
        let fingerprint = material.fingerprint();
        let public_key = material.public_key().clone();
        // Raw key bytes are scrubbed here; only the decoded key lives on
        drop(material);

        let key = match (algorithm, private_key) {
            (SigningAlgorithm::ES256, PrivateKey::EcdsaP256(secret)) => {
                SignerKey::Es256(p256::ecdsa::SigningKey::from(&secret))
            }
            (SigningAlgorithm::PS256, PrivateKey::Rsa(secret)) => {
                SignerKey::Ps256(rsa::pss::BlindedSigningKey::<Sha256>::new(*secret))
            }
            (SigningAlgorithm::RS256, PrivateKey::Rsa(secret)) => {
                SignerKey::Rs256(rsa::pkcs1v15::SigningKey::<Sha256>::new(*secret))
            }
            _ => {
                return Err(MtlsError::SigningKeyInvalid {
                    reason: format!("{algorithm} does not match the decoded key"),
                });
            }
        };

        let verification_key = VerificationKey::new(public_key, algorithm)?;

        info!(
            algorithm = %algorithm,
            kid = %verification_key.key_id(),
            fingerprint = %fingerprint,
            "Signing capability ready"
        );

        Ok(Self {
            algorithm,
            key,
            verification_key,
            fingerprint,
        })
    }

    /// Signature algorithm
    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    /// JWK thumbprint of the public key
    pub fn key_id(&self) -> &str {
        self.verification_key.key_id()
    }

    /// Fingerprint of the public key
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Public half for signature verification
    pub fn verification_key(&self) -> &VerificationKey {
        &self.verification_key
    }

    fn sign_raw(&self, data: &[u8]) -> Result<Vec<u8>> {
        let failure = |e: signature::Error| MtlsError::SigningFailure {
            reason: format!("{} signing failed: {e}", self.algorithm),
        };

        let signature = match &self.key {
            SignerKey::Es256(key) => {
                let signature: p256::ecdsa::Signature = key.try_sign(data).map_err(failure)?;
                signature.to_bytes().to_vec()
            }
            SignerKey::Ps256(key) => {
                let mut rng = rand::thread_rng();
                key.try_sign_with_rng(&mut rng, data)
                    .map_err(failure)?
                    .to_vec()
            }
            SignerKey::Rs256(key) => key.try_sign(data).map_err(failure)?.to_vec(),
        };

        if signature.is_empty() {
            return Err(MtlsError::SigningFailure {
                reason: "signature is empty".to_string(),
            });
        }
        Ok(signature)
    }
}

impl fmt::Debug for SigningCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCapability")
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id())
            .field("fingerprint", &self.fingerprint)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Produces signatures over outbound payloads
///
/// Stateless with respect to connections. Clones share the same capability.
#[derive(Debug, Clone)]
pub struct RequestSigner {
    capability: Arc<SigningCapability>,
}

impl RequestSigner {
    /// Create a signer over a capability
    pub fn new(capability: Arc<SigningCapability>) -> Self {
        Self { capability }
    }

    /// Sign `payload`, returning a detached signature
    pub fn sign(&self, payload: &[u8]) -> Result<SignatureArtifact> {
        let signature = self.capability.sign_raw(payload)?;
        debug!(
            algorithm = %self.capability.algorithm,
            payload_len = payload.len(),
            "Signed payload"
        );

        Ok(SignatureArtifact {
            algorithm: self.capability.algorithm,
            key_id: self.capability.key_id().to_string(),
            signature,
        })
    }

    /// Sign `payload` as a detached compact JWS: `<header>..<signature>`
    pub fn sign_detached_jws(&self, payload: &[u8]) -> Result<String> {
        let header = JwsHeader {
            alg: self.capability.algorithm.as_str().to_string(),
            kid: self.capability.key_id().to_string(),
            typ: "JOSE".to_string(),
        };
        let header_json = serde_json::to_vec(&header).map_err(|e| MtlsError::SigningFailure {
            reason: format!("failed to encode JWS header: {e}"),
        })?;

        let encoded_header = URL_SAFE_NO_PAD.encode(header_json);
        let signing_input = format!("{encoded_header}.{}", URL_SAFE_NO_PAD.encode(payload));
        let signature = self.capability.sign_raw(signing_input.as_bytes())?;

        Ok(format!("{encoded_header}..{}", URL_SAFE_NO_PAD.encode(signature)))
    }

    /// Underlying capability
    pub fn capability(&self) -> &Arc<SigningCapability> {
        &self.capability
    }

    /// Public half for signature verification
    pub fn verification_key(&self) -> &VerificationKey {
        self.capability.verification_key()
    }
}

enum VerifierKey {
    Es256(p256::ecdsa::VerifyingKey),
    Ps256(rsa::pss::VerifyingKey<Sha256>),
    Rs256(rsa::pkcs1v15::VerifyingKey<Sha256>),
}

/// Public key able to verify signatures from one [`SigningCapability`]
pub struct VerificationKey {
    algorithm: SigningAlgorithm,
    key_id: String,
    public_key: PublicKey,
    key: VerifierKey,
}

impl VerificationKey {
    /// Build a verifier for `public_key` under `algorithm`
    pub fn new(public_key: PublicKey, algorithm: SigningAlgorithm) -> Result<Self> {
        let key = match (&public_key, algorithm) {
            (PublicKey::EcdsaP256(key), SigningAlgorithm::ES256) => {
                VerifierKey::Es256(p256::ecdsa::VerifyingKey::from(key))
            }
            (PublicKey::Rsa(key), SigningAlgorithm::PS256) => {
                VerifierKey::Ps256(rsa::pss::VerifyingKey::<Sha256>::new(key.clone()))
            }
            (PublicKey::Rsa(key), SigningAlgorithm::RS256) => {
                VerifierKey::Rs256(rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key.clone()))
            }
            _ => {
                return Err(MtlsError::SigningKeyInvalid {
                    reason: format!(
                        "{algorithm} cannot verify with an {} key",
                        public_key.algorithm()
                    ),
                });
            }
        };

        Ok(Self {
            algorithm,
            key_id: public_key.jwk_thumbprint(),
            public_key,
            key,
        })
    }

    /// Algorithm this key verifies
    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    /// JWK thumbprint
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Verify a detached signature artifact over `payload`
    pub fn verify(&self, payload: &[u8], artifact: &SignatureArtifact) -> Result<()> {
        if artifact.algorithm != self.algorithm {
            return Err(MtlsError::SigningFailure {
                reason: format!(
                    "algorithm mismatch: expected {}, got {}",
                    self.algorithm, artifact.algorithm
                ),
            });
        }
        if artifact.key_id != self.key_id {
            return Err(MtlsError::SigningFailure {
                reason: format!("unknown key id {}", artifact.key_id),
            });
        }
        self.verify_raw(payload, &artifact.signature)
    }

    /// Verify a detached compact JWS produced by [`RequestSigner::sign_detached_jws`]
    pub fn verify_detached_jws(&self, payload: &[u8], jws: &str) -> Result<()> {
        let invalid = |reason: String| MtlsError::SigningFailure { reason };

        let mut parts = jws.split('.');
        let (Some(encoded_header), Some(""), Some(encoded_signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("not a detached compact JWS".to_string()));
        };

        let header_json = URL_SAFE_NO_PAD
            .decode(encoded_header)
            .map_err(|e| invalid(format!("invalid JWS header encoding: {e}")))?;
        let header: JwsHeader = serde_json::from_slice(&header_json)
            .map_err(|e| invalid(format!("invalid JWS header: {e}")))?;

        if header.alg != self.algorithm.as_str() {
            return Err(invalid(format!("unexpected JWS alg {}", header.alg)));
        }
        if header.kid != self.key_id {
            return Err(invalid(format!("unexpected JWS kid {}", header.kid)));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(encoded_signature)
            .map_err(|e| invalid(format!("invalid JWS signature encoding: {e}")))?;
        let signing_input = format!("{encoded_header}.{}", URL_SAFE_NO_PAD.encode(payload));

        self.verify_raw(signing_input.as_bytes(), &signature)
    }

    fn verify_raw(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        let invalid_format = |e: signature::Error| MtlsError::SigningFailure {
            reason: format!("invalid {} signature format: {e}", self.algorithm),
        };
        let rejected = |e: signature::Error| MtlsError::SigningFailure {
            reason: format!("{} signature verification failed: {e}", self.algorithm),
        };

        match &self.key {
            VerifierKey::Es256(key) => {
                let signature =
                    p256::ecdsa::Signature::try_from(signature).map_err(invalid_format)?;
                key.verify(data, &signature).map_err(rejected)
            }
            VerifierKey::Ps256(key) => {
                let signature = rsa::pss::Signature::try_from(signature).map_err(invalid_format)?;
                key.verify(data, &signature).map_err(rejected)
            }
            VerifierKey::Rs256(key) => {
                let signature =
                    rsa::pkcs1v15::Signature::try_from(signature).map_err(invalid_format)?;
                key.verify(data, &signature).map_err(rejected)
            }
        }
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id)
            .field("public_key", &self.public_key.algorithm())
            .finish()
    }
}
