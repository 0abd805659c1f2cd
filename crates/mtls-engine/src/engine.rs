//! Engine facade
//!
//! [`MtlsEngine`] ties the pieces together: it loads both credentials, derives the
//! trust context and the signing capability, and serves pooled connections to one
//! target. Construction goes through [`MtlsEngineBuilder`], which validates
//! everything before an engine exists.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use rustls::pki_types::CertificateDer;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ConnectionConfig, MtlsConfiguration, PoolConfig};
use crate::connection::{ConnectionObserver, Connector, Target};
use crate::error::{KeyPurpose, MtlsError};
use crate::material::KeyMaterialLoader;
use crate::pool::{ConnectionPool, PoolStats, PooledConnection};
use crate::proxy::{ProxyCredentials, ProxyEndpoint, ProxyTunnel, TunnelTimeouts};
use crate::resolver::{FileSystemResolver, ResourceResolver};
use crate::signing::{RequestSigner, SignatureArtifact, SigningCapability};
use crate::trust::{TrustContext, parse_ca_bundle};
use crate::Result;

/// Derived credentials for one generation
struct Credentials {
    trust: TrustContext,
    signing: SigningCapability,
}

/// Loads and derives credentials from a configuration
#[derive(Debug, Clone)]
struct CredentialSource {
    resolver: Arc<dyn ResourceResolver>,
    loader: KeyMaterialLoader,
    connection_config: ConnectionConfig,
}

impl CredentialSource {
    fn new(resolver: Arc<dyn ResourceResolver>, connection_config: ConnectionConfig) -> Self {
        Self {
            loader: KeyMaterialLoader::new(resolver.clone()),
            resolver,
            connection_config,
        }
    }

    /// Load both materials, then derive both capabilities
    ///
    /// Each stage runs its independent parts to completion and reports every failure.
    async fn derive(&self, configuration: &MtlsConfiguration, generation: u64) -> Result<Credentials> {
        let (materials, ca_certificates) = tokio::join!(
            self.loader.load(configuration),
            self.load_ca_bundle(configuration),
        );
        let ((signing, transport), ca_certificates) = match (materials, ca_certificates) {
            (Ok(materials), Ok(ca)) => (materials, ca),
            (materials, ca) => return Err(collect_errors([materials.err(), ca.err()])),
        };

        let trust = TrustContext::builder(transport)
            .ca_certificates(ca_certificates)
            .use_webpki_roots(self.connection_config.use_webpki_roots)
            .alpn_protocols(&self.connection_config.alpn_protocols)
            .generation(generation)
            .build();
        let signing = SigningCapability::new(signing, configuration.signing_algorithm);

        match (trust, signing) {
            (Ok(trust), Ok(signing)) => Ok(Credentials { trust, signing }),
            (trust, signing) => Err(collect_errors([trust.err(), signing.err()])),
        }
    }

    async fn load_ca_bundle(
        &self,
        configuration: &MtlsConfiguration,
    ) -> Result<Vec<CertificateDer<'static>>> {
        let Some(location) = configuration.ca_bundle_location.as_deref() else {
            return Ok(Vec::new());
        };

        let bytes = self
            .resolver
            .resolve(location)
            .await
            .map_err(|e| MtlsError::MaterialNotFound {
                purpose: KeyPurpose::Transport,
                location: location.to_string(),
                reason: format!("CA bundle: {}", e.reason),
            })?;
        parse_ca_bundle(&bytes)
    }
}

fn collect_errors<const N: usize>(errors: [Option<MtlsError>; N]) -> MtlsError {
    MtlsError::aggregate(errors.into_iter().flatten().collect()).unwrap_or_else(|| {
        MtlsError::Configuration {
            reason: "credential derivation failed without an error".to_string(),
        }
    })
}

/// Builder for [`MtlsEngine`]
pub struct MtlsEngineBuilder {
    configuration: MtlsConfiguration,
    target: Option<Target>,
    resolver: Arc<dyn ResourceResolver>,
    pool_config: PoolConfig,
    connection_config: ConnectionConfig,
    observer: Option<Arc<dyn ConnectionObserver>>,
    proxy_credentials: Option<ProxyCredentials>,
}

impl MtlsEngineBuilder {
    fn new(configuration: MtlsConfiguration) -> Self {
        Self {
            configuration,
            target: None,
            resolver: Arc::new(FileSystemResolver::new()),
            pool_config: PoolConfig::default(),
            connection_config: ConnectionConfig::default(),
            observer: None,
            proxy_credentials: None,
        }
    }

    /// Remote endpoint; required
    pub fn target(mut self, host: impl Into<String>, port: u16) -> Self {
        self.target = Some(Target::new(host, port));
        self
    }

    /// Resolver for configured locations; defaults to [`FileSystemResolver`]
    pub fn resolver(mut self, resolver: Arc<dyn ResourceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Pool settings
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Connection settings
    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection_config = config;
        self
    }

    /// Receive every connection state transition
    pub fn observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Authenticate to the proxy
    pub fn proxy_credentials(mut self, credentials: ProxyCredentials) -> Self {
        self.proxy_credentials = Some(credentials);
        self
    }

    /// Validate settings, load and derive credentials, and start the pool
    pub async fn build(self) -> Result<MtlsEngine> {
        self.configuration.validate()?;
        self.pool_config.validate()?;
        self.connection_config.validate()?;

        let target = self.target.ok_or_else(|| MtlsError::Configuration {
            reason: "target host and port are required".to_string(),
        })?;
        if target.host().trim().is_empty() || target.port() == 0 {
            return Err(MtlsError::Configuration {
                reason: format!("invalid target '{target}'"),
            });
        }

        let proxy = self.configuration.proxy_endpoint()?;
        if proxy.is_none() && self.proxy_credentials.is_some() {
            warn!("Proxy credentials supplied without a proxy; they will not be used");
        }

        let source = CredentialSource::new(self.resolver, self.connection_config.clone());
        let credentials = source.derive(&self.configuration, 0).await?;

        let tunnel = proxy.clone().map(|endpoint| {
            ProxyTunnel::new(
                endpoint,
                self.proxy_credentials,
                TunnelTimeouts {
                    connect: self.connection_config.connect_timeout,
                    response: self.connection_config.proxy_response_timeout,
                },
            )
        });

        let mut connector = Connector::new(target, tunnel, self.connection_config);
        if let Some(observer) = self.observer {
            connector = connector.with_observer(observer);
        }

        let pool = ConnectionPool::new(self.pool_config, connector, Arc::new(credentials.trust))?;
        let signing = Arc::new(credentials.signing);

        info!(
            target = %pool.target(),
            proxy = proxy.as_ref().map(ToString::to_string).unwrap_or_default(),
            fingerprint = %pool.trust_context().fingerprint(),
            kid = %signing.key_id(),
            "mTLS engine ready"
        );

        Ok(MtlsEngine {
            pool,
            signing: ArcSwap::new(signing),
            source,
            proxy,
            generation: AtomicU64::new(0),
            rotation: tokio::sync::Mutex::new(()),
        })
    }
}

impl fmt::Debug for MtlsEngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MtlsEngineBuilder")
            .field("configuration", &self.configuration)
            .field("target", &self.target)
            .field("resolver", &self.resolver)
            .field("pool_config", &self.pool_config)
            .field("connection_config", &self.connection_config)
            .field("proxy_credentials", &self.proxy_credentials)
            .finish_non_exhaustive()
    }
}

/// mTLS connection establishment engine
///
/// Serves pooled, mutually authenticated connections to one target and signs
/// payloads with a separate signing key.
pub struct MtlsEngine {
    pool: ConnectionPool,
    signing: ArcSwap<SigningCapability>,
    source: CredentialSource,
    proxy: Option<ProxyEndpoint>,
    generation: AtomicU64,
    rotation: tokio::sync::Mutex<()>,
}

impl MtlsEngine {
    /// Start building an engine from a configuration
    pub fn builder(configuration: MtlsConfiguration) -> MtlsEngineBuilder {
        MtlsEngineBuilder::new(configuration)
    }

    /// Acquire an established connection using the pool's acquire timeout
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.pool.acquire().await
    }

    /// Acquire an established connection, waiting at most `timeout` for a slot
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        self.pool.acquire_timeout(timeout).await
    }

    /// Acquire with a cancellation signal
    pub async fn acquire_cancellable(
        &self,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<PooledConnection> {
        self.pool.acquire_cancellable(timeout, cancel).await
    }

    /// Hand a connection back to the pool
    pub fn release(&self, connection: PooledConnection) {
        self.pool.release(connection);
    }

    /// Sign a payload with the current signing key
    pub fn sign(&self, payload: &[u8]) -> Result<SignatureArtifact> {
        self.signer().sign(payload)
    }

    /// Sign a payload as a detached compact JWS
    pub fn sign_detached_jws(&self, payload: &[u8]) -> Result<String> {
        self.signer().sign_detached_jws(payload)
    }

    /// Signer over the current signing key; unaffected by later rotations
    pub fn signer(&self) -> RequestSigner {
        RequestSigner::new(self.signing.load_full())
    }

    /// Current trust context
    pub fn trust_context(&self) -> Arc<TrustContext> {
        self.pool.trust_context()
    }

    /// Current rotation generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// The underlying pool
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Replace both credentials from `configuration`
    ///
    /// Everything is loaded and validated before anything is swapped; on error the
    /// engine keeps serving with the previous credentials. The target and proxy are
    /// fixed for the engine's lifetime.
    pub async fn rotate(&self, configuration: &MtlsConfiguration) -> Result<()> {
        let _guard = self.rotation.lock().await;

        configuration.validate()?;
        if configuration.proxy_endpoint()? != self.proxy {
            return Err(MtlsError::Configuration {
                reason: "the proxy cannot change on rotation".to_string(),
            });
        }

        let generation = self.generation.load(Ordering::Acquire) + 1;
        let credentials = self.source.derive(configuration, generation).await?;

        let previous = self.pool.trust_context().fingerprint();
        let fingerprint = credentials.trust.fingerprint();

        self.signing.store(Arc::new(credentials.signing));
        self.pool.rotate(Arc::new(credentials.trust));
        self.generation.store(generation, Ordering::Release);

        info!(
            generation,
            previous = %previous,
            fingerprint = %fingerprint,
            "Credentials rotated"
        );
        Ok(())
    }

    /// Close idle connections and refuse further acquires
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

impl fmt::Debug for MtlsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MtlsEngine")
            .field("pool", &self.pool)
            .field("signing", &self.signing.load_full())
            .field("proxy", &self.proxy)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}
