//! Certificate and key fixtures generated at test time
//!
//! Shared by unit tests and the integration suite (included there by path), so this
//! module only depends on external crates.

#![allow(dead_code)]

use pkcs8::pkcs5::pbes2;
use pkcs8::{EncodePrivateKey, LineEnding, PrivateKeyInfo};
use rand::RngCore;
use rand::rngs::OsRng;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use time::{Duration, OffsetDateTime};

/// Password used for encrypted fixture bundles
pub const TEST_PASSWORD: &str = "correct horse battery staple";

/// A throwaway certificate authority
pub struct TestCa {
    cert: rcgen::Certificate,
    key: KeyPair,
}

/// A leaf certificate and its PKCS#8 private key
#[derive(Clone)]
pub struct IssuedCert {
    /// DER-encoded certificate
    pub cert_der: Vec<u8>,
    /// PEM-encoded certificate
    pub cert_pem: String,
    /// PKCS#8 DER private key
    pub key_der: Vec<u8>,
    /// PKCS#8 PEM private key
    pub key_pem: String,
}

impl TestCa {
    /// Create a self-signed CA
    pub fn new(name: &str) -> Self {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).expect("CA key");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("CA params");
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = OffsetDateTime::now_utc() - Duration::days(30);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(3650);
        let cert = params.self_signed(&key).expect("CA certificate");
        Self { cert, key }
    }

    /// PEM of the CA certificate
    pub fn pem(&self) -> String {
        self.cert.pem()
    }

    /// DER of the CA certificate
    pub fn der(&self) -> Vec<u8> {
        self.cert.der().to_vec()
    }

    /// Issue a server certificate for `host`
    pub fn issue_server(&self, host: &str) -> IssuedCert {
        let mut params = CertificateParams::new(vec![host.to_string()]).expect("server params");
        params.distinguished_name.push(DnType::CommonName, host);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(365);
        self.sign(params)
    }

    /// Issue a client certificate valid from yesterday for a year
    pub fn issue_client(&self, common_name: &str) -> IssuedCert {
        self.issue_client_between(
            common_name,
            OffsetDateTime::now_utc() - Duration::days(1),
            OffsetDateTime::now_utc() + Duration::days(365),
        )
    }

    /// Issue a client certificate with an explicit validity window
    pub fn issue_client_between(
        &self,
        common_name: &str,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> IssuedCert {
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("client params");
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.not_before = not_before;
        params.not_after = not_after;
        self.sign(params)
    }

    fn sign(&self, params: CertificateParams) -> IssuedCert {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).expect("leaf key");
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .expect("leaf certificate");
        IssuedCert {
            cert_der: cert.der().to_vec(),
            cert_pem: cert.pem(),
            key_der: key.serialize_der(),
            key_pem: key.serialize_pem(),
        }
    }
}

impl IssuedCert {
    /// Certificate followed by the key encrypted under `password`
    pub fn encrypted_bundle(&self, password: &str) -> String {
        format!("{}{}", self.cert_pem, encrypt_pkcs8_pem(&self.key_der, password))
    }

    /// Certificate followed by the unencrypted key
    pub fn plain_bundle(&self) -> String {
        format!("{}{}", self.cert_pem, self.key_pem)
    }

    /// Same certificate with someone else's key
    pub fn bundle_with_foreign_key(&self, other: &IssuedCert, password: &str) -> String {
        format!("{}{}", self.cert_pem, encrypt_pkcs8_pem(&other.key_der, password))
    }
}

/// Encrypt a PKCS#8 key with PBES2 (PBKDF2-SHA256, AES-256-CBC)
pub fn encrypt_pkcs8_pem(key_der: &[u8], password: &str) -> String {
    let info = PrivateKeyInfo::try_from(key_der).expect("PKCS#8 key");
    let mut salt = [0u8; 16];
    let mut iv = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);
    let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(2048, &salt, &iv).expect("PBES2");
    let document = info
        .encrypt_with_params(params, password)
        .expect("encrypt key");
    document
        .to_pem("ENCRYPTED PRIVATE KEY", LineEnding::LF)
        .expect("encrypted PEM")
        .to_string()
}

/// Fresh P-256 signing key as PKCS#8 PEM
pub fn p256_pkcs8_pem() -> String {
    let key = p256::SecretKey::random(&mut OsRng);
    key.to_pkcs8_pem(LineEnding::LF).expect("PKCS#8 PEM").to_string()
}

/// Fresh P-256 signing key as SEC1 PEM
pub fn p256_sec1_pem() -> String {
    let key = p256::SecretKey::random(&mut OsRng);
    key.to_sec1_pem(LineEnding::LF).expect("SEC1 PEM").to_string()
}

/// Fresh RSA signing key as PKCS#8 PEM
pub fn rsa_pkcs8_pem(bits: usize) -> String {
    let key = rsa::RsaPrivateKey::new(&mut OsRng, bits).expect("RSA key");
    key.to_pkcs8_pem(LineEnding::LF).expect("PKCS#8 PEM").to_string()
}
