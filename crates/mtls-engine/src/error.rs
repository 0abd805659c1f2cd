//! Error types for the mTLS engine
//!
//! Every failure the engine can surface is a variant of [`MtlsError`]. Variants are
//! grouped into an [`ErrorCategory`] so callers can decide on retry policy without
//! matching every variant: network failures are retryable, material and validity
//! failures are fatal until the credentials change.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Which of the two independent credentials an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    /// Payload signing key
    Signing,
    /// TLS client certificate and key
    Transport,
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signing => f.write_str("signing key"),
            Self::Transport => f.write_str("transport certificate"),
        }
    }
}

/// Errors produced while loading credentials, establishing connections or signing
#[derive(Error, Debug)]
pub enum MtlsError {
    /// A configured location did not resolve to readable bytes
    #[error("{purpose} not found at '{location}': {reason}")]
    MaterialNotFound {
        /// Credential the location belongs to
        purpose: KeyPurpose,
        /// Location as configured
        location: String,
        /// Resolver failure details
        reason: String,
    },

    /// Bytes were read but do not parse as a key or certificate
    #[error("{purpose} is malformed: {reason}")]
    MaterialMalformed {
        /// Credential that failed to parse
        purpose: KeyPurpose,
        /// Parse failure details
        reason: String,
    },

    /// The transport certificate password does not decrypt the private key
    #[error("transport certificate password does not decrypt the key at '{location}'")]
    PasswordMismatch {
        /// Location of the encrypted bundle
        location: String,
    },

    /// The transport private key does not belong to the leaf certificate
    #[error("transport private key does not match certificate {fingerprint}")]
    KeyCertificateMismatch {
        /// Fingerprint of the leaf certificate
        fingerprint: String,
    },

    /// The signing key parsed but cannot be used for signing
    #[error("signing key is not usable: {reason}")]
    SigningKeyInvalid {
        /// Why the key was rejected
        reason: String,
    },

    /// The transport certificate's validity window has not started
    #[error("transport certificate is not valid before {not_before}")]
    CertificateNotYetValid {
        /// Start of the validity window
        not_before: DateTime<Utc>,
    },

    /// The transport certificate has expired, or will within the safety margin
    #[error("transport certificate expired at {not_after}")]
    CertificateExpired {
        /// End of the validity window
        not_after: DateTime<Utc>,
    },

    /// Could not open a connection to the proxy
    #[error("proxy {proxy} unreachable: {reason}")]
    ProxyUnreachable {
        /// Proxy authority
        proxy: String,
        /// Connection failure details
        reason: String,
    },

    /// The proxy answered the tunnel request with a non-success status
    #[error("proxy refused tunnel to {target}: {reason}")]
    ProxyTunnelRejected {
        /// Tunnel target authority
        target: String,
        /// HTTP status returned by the proxy, if one could be parsed
        status: Option<u16>,
        /// Status line or protocol failure details
        reason: String,
    },

    /// The proxy did not answer the tunnel request in time
    #[error("proxy {proxy} did not answer within {waited:?}")]
    ProxyTimeout {
        /// Proxy authority
        proxy: String,
        /// How long the engine waited
        waited: Duration,
    },

    /// Direct TCP connection to the target failed
    #[error("failed to connect to {target}: {reason}")]
    ConnectFailed {
        /// Target authority
        target: String,
        /// Connection failure details
        reason: String,
    },

    /// The TLS handshake with the target failed
    #[error("TLS handshake with {target} failed: {reason}")]
    HandshakeFailed {
        /// Target authority
        target: String,
        /// Handshake failure details
        reason: String,
    },

    /// The TLS handshake did not complete in time
    #[error("TLS handshake with {target} timed out after {waited:?}")]
    HandshakeTimeout {
        /// Target authority
        target: String,
        /// How long the engine waited
        waited: Duration,
    },

    /// No connection slot became available before the acquire deadline
    #[error("connection pool exhausted: {max_connections} connections in use, waited {waited:?}")]
    PoolExhausted {
        /// Configured pool bound
        max_connections: usize,
        /// How long the caller waited
        waited: Duration,
    },

    /// The pool has been shut down
    #[error("connection pool is shut down")]
    PoolClosed,

    /// The caller cancelled a blocking operation
    #[error("operation cancelled: {operation}")]
    Cancelled {
        /// Operation that was cancelled
        operation: &'static str,
    },

    /// A cryptographic signing operation failed
    #[error("signing failed: {reason}")]
    SigningFailure {
        /// Failure details
        reason: String,
    },

    /// Invalid engine configuration
    #[error("configuration error: {reason}")]
    Configuration {
        /// Configuration error details
        reason: String,
    },

    /// Unexpected I/O failure outside the classified cases
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Several independent failures, reported together
    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<MtlsError>),
}

fn join_errors(errors: &[MtlsError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Coarse classification used for retry and alerting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Credentials could not be read or parsed
    Material,
    /// Credentials are outside their validity window
    Validity,
    /// Transient proxy, socket or handshake failure
    Network,
    /// Pool capacity or lifecycle
    Pool,
    /// Payload signing
    Signing,
    /// Invalid configuration values
    Configuration,
    /// Anything else
    Internal,
}

impl MtlsError {
    /// Collapse a list of independent failures into one error
    ///
    /// Returns `None` for an empty list and the error itself for a single entry.
    /// Nested aggregates are flattened.
    pub fn aggregate(errors: Vec<MtlsError>) -> Option<Self> {
        let mut errors: Vec<MtlsError> = errors
            .into_iter()
            .flat_map(|e| match e {
                Self::Multiple(inner) => inner,
                other => vec![other],
            })
            .collect();

        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple(errors)),
        }
    }

    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MaterialNotFound { .. }
            | Self::MaterialMalformed { .. }
            | Self::PasswordMismatch { .. }
            | Self::KeyCertificateMismatch { .. }
            | Self::SigningKeyInvalid { .. } => ErrorCategory::Material,

            Self::CertificateNotYetValid { .. } | Self::CertificateExpired { .. } => {
                ErrorCategory::Validity
            }

            Self::ProxyUnreachable { .. }
            | Self::ProxyTunnelRejected { .. }
            | Self::ProxyTimeout { .. }
            | Self::ConnectFailed { .. }
            | Self::HandshakeFailed { .. }
            | Self::HandshakeTimeout { .. } => ErrorCategory::Network,

            Self::PoolExhausted { .. } | Self::PoolClosed | Self::Cancelled { .. } => {
                ErrorCategory::Pool
            }

            Self::SigningFailure { .. } => ErrorCategory::Signing,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Io(_) => ErrorCategory::Internal,

            // An aggregate is as severe as its worst member
            Self::Multiple(errors) => errors
                .iter()
                .map(Self::category)
                .find(|c| matches!(c, ErrorCategory::Material | ErrorCategory::Validity))
                .unwrap_or(ErrorCategory::Internal),
        }
    }

    /// Whether a caller-level retry may succeed without changing credentials
    ///
    /// The engine never retries internally.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Network
    }

    /// Whether the error indicates unusable credentials or configuration
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Material | ErrorCategory::Validity | ErrorCategory::Configuration
        )
    }

    /// Check if this error came from the proxy hop rather than the target
    pub fn is_proxy_error(&self) -> bool {
        matches!(
            self,
            Self::ProxyUnreachable { .. } | Self::ProxyTunnelRejected { .. } | Self::ProxyTimeout { .. }
        )
    }

    /// Suggested remediation for operators
    pub fn remediation_hint(&self) -> &'static str {
        match self {
            Self::MaterialNotFound { .. } => "Check the configured key and certificate locations",
            Self::MaterialMalformed { .. } => "Verify the PEM contents of the configured material",
            Self::PasswordMismatch { .. } => "Check the transport certificate password",
            Self::KeyCertificateMismatch { .. } => {
                "Bundle the private key that belongs to the leaf certificate"
            }
            Self::SigningKeyInvalid { .. } => "Use an ECDSA P-256 or RSA-2048+ signing key",
            Self::CertificateNotYetValid { .. } => "Check the system clock or wait for notBefore",
            Self::CertificateExpired { .. } => "Rotate the transport certificate",
            Self::ProxyUnreachable { .. } | Self::ProxyTimeout { .. } => {
                "Check proxy availability and retry with backoff"
            }
            Self::ProxyTunnelRejected { .. } => "Check the proxy allow-list for the target",
            Self::ConnectFailed { .. } | Self::HandshakeFailed { .. } | Self::HandshakeTimeout { .. } => {
                "Check target availability and server trust, then retry"
            }
            Self::PoolExhausted { .. } => "Release connections sooner or raise max_connections",
            Self::SigningFailure { .. } => "Do not send the request unsigned; inspect the signing key",
            Self::Configuration { .. } => "Review engine configuration values",
            _ => "Check logs for detailed error information",
        }
    }
}
