//! The certificate resolution entry point.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, error};

use crate::cache::{CachedCertificate, CertificateCache};
use crate::events::{Event, EventHandler, TLS_GET_CERTIFICATE};
use crate::upstream::{
    AcmeIssuer, ChallengeRegistry, ManagedCertificateStore, MemoryStore, OcspStapler,
    RawCertificate,
};

use super::config::ResolverConfig;
use super::error::{HandshakeError, HandshakeResult};
use super::hello::ClientHelloInfo;
use super::lookup::LookupOutcome;
use super::name::name_from_hello;
use super::singleflight::{wait_for_flight, Flight};

/// Counters for handshake-time certificate activity.
#[derive(Debug, Default)]
pub struct HandshakeStats {
    /// Handshakes answered straight from the cache.
    pub cache_hits: AtomicU64,
    /// Handshakes that missed the cache.
    pub cache_misses: AtomicU64,
    /// Certificates loaded from storage during handshakes.
    pub storage_loads: AtomicU64,
    /// Certificates obtained anew from the CA during handshakes.
    pub certificates_obtained: AtomicU64,
    /// Certificates renewed because of a handshake.
    pub certificates_renewed: AtomicU64,
    /// OCSP staples refreshed during handshakes.
    pub ocsp_refreshes: AtomicU64,
    /// TLS-ALPN-01 challenge certificates served.
    pub challenges_served: AtomicU64,
}

/// The certificate a handshake should present.
pub enum ResolvedCertificate {
    /// A certificate record from the cache (possibly just loaded,
    /// obtained, or supplied by an external manager).
    Certificate(CachedCertificate),

    /// A TLS-ALPN-01 key-authorization certificate; never cached.
    Challenge(RawCertificate),
}

impl std::fmt::Debug for ResolvedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Certificate(cert) => f.debug_tuple("Certificate").field(cert).finish(),
            Self::Challenge(_) => f.debug_tuple("Challenge").finish(),
        }
    }
}

impl ResolvedCertificate {
    /// The certificate chain to present, leaf first.
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        match self {
            Self::Certificate(cert) => cert.chain(),
            Self::Challenge(raw) => &raw.chain,
        }
    }

    /// The private key for the leaf.
    #[must_use]
    pub fn key(&self) -> &PrivateKeyDer<'static> {
        match self {
            Self::Certificate(cert) => cert.key(),
            Self::Challenge(raw) => &raw.key,
        }
    }

    /// The underlying cache record, when this is a normal certificate.
    #[must_use]
    pub fn record(&self) -> Option<&CachedCertificate> {
        match self {
            Self::Certificate(cert) => Some(cert),
            Self::Challenge(_) => None,
        }
    }

    /// Build a rustls `CertifiedKey` for the TLS stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the private key is not supported by the
    /// crypto provider.
    pub fn to_certified_key(
        &self,
    ) -> Result<tokio_rustls::rustls::sign::CertifiedKey, tokio_rustls::rustls::Error> {
        use tokio_rustls::rustls::crypto::aws_lc_rs::sign::any_supported_type;
        use tokio_rustls::rustls::sign::CertifiedKey;

        let signing_key = any_supported_type(self.key())?;
        Ok(CertifiedKey::new(self.chain().to_vec(), signing_key))
    }
}

struct ResolverInner {
    config: ResolverConfig,
    cache: Arc<CertificateCache>,
    storage: Arc<dyn ManagedCertificateStore>,
    issuer: Option<Arc<dyn AcmeIssuer>>,
    ocsp: Option<Arc<dyn OcspStapler>>,
    challenges: Option<Arc<dyn ChallengeRegistry>>,
    events: Option<Arc<dyn EventHandler>>,
    stats: HandshakeStats,
}

/// Resolves certificates for TLS handshakes.
///
/// Cloning is cheap; clones share the cache, upstreams, and stats, so a
/// resolver can be handed to every connection task.
#[derive(Clone)]
pub struct CertificateResolver {
    inner: Arc<ResolverInner>,
}

impl std::fmt::Debug for CertificateResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateResolver")
            .field("config", &self.inner.config)
            .field("cached_certificates", &self.inner.cache.len())
            .finish()
    }
}

/// Builder for [`CertificateResolver`].
#[derive(Default)]
pub struct ResolverBuilder {
    config: ResolverConfig,
    cache: Option<Arc<CertificateCache>>,
    storage: Option<Arc<dyn ManagedCertificateStore>>,
    issuer: Option<Arc<dyn AcmeIssuer>>,
    ocsp: Option<Arc<dyn OcspStapler>>,
    challenges: Option<Arc<dyn ChallengeRegistry>>,
    events: Option<Arc<dyn EventHandler>>,
}

impl ResolverBuilder {
    /// Start a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: ResolverConfig::new(),
            ..Self::default()
        }
    }

    /// Set the resolver configuration.
    #[must_use]
    pub fn config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing certificate cache.
    #[must_use]
    pub fn cache(mut self, cache: Arc<CertificateCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the persistent certificate storage.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn ManagedCertificateStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the certificate authority used for issuance and renewal.
    #[must_use]
    pub fn issuer(mut self, issuer: Arc<dyn AcmeIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Set the OCSP stapler.
    #[must_use]
    pub fn ocsp(mut self, ocsp: Arc<dyn OcspStapler>) -> Self {
        self.ocsp = Some(ocsp);
        self
    }

    /// Set the ACME challenge registry.
    #[must_use]
    pub fn challenges(mut self, challenges: Arc<dyn ChallengeRegistry>) -> Self {
        self.challenges = Some(challenges);
        self
    }

    /// Set the event handler.
    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the resolver. A private cache and in-memory storage are
    /// created when none were supplied.
    #[must_use]
    pub fn build(self) -> CertificateResolver {
        CertificateResolver {
            inner: Arc::new(ResolverInner {
                config: self.config,
                cache: self
                    .cache
                    .unwrap_or_else(|| Arc::new(CertificateCache::new())),
                storage: self
                    .storage
                    .unwrap_or_else(|| Arc::new(MemoryStore::new())),
                issuer: self.issuer,
                ocsp: self.ocsp,
                challenges: self.challenges,
                events: self.events,
                stats: HandshakeStats::default(),
            }),
        }
    }
}

impl CertificateResolver {
    /// Get a certificate satisfying `hello`.
    ///
    /// Resolution order: TLS-ALPN-01 challenge shortcut, then exact
    /// cache match, wildcard cache match, external managers, storage
    /// (when on-demand is enabled or the cache is almost full), and
    /// finally the certificate authority (when on-demand is enabled).
    /// Concurrent handshakes for the same name collapse to one load or
    /// issuance; dropping the returned future cancels this handshake's
    /// participation without disturbing the in-flight work.
    ///
    /// # Errors
    ///
    /// Fails if and only if no certificate can be served; see
    /// [`HandshakeError`] for the cases.
    pub async fn get_certificate(
        &self,
        hello: &ClientHelloInfo,
    ) -> HandshakeResult<ResolvedCertificate> {
        self.emit_tls_get_certificate(hello).await?;

        // Special case: a TLS-ALPN ACME challenge handshake gets the
        // key authentication certificate, never a real one (RFC 8737).
        if hello.is_tls_alpn_challenge() {
            let resolved = self.tls_alpn_challenge_cert(hello).await.map_err(|e| {
                error!(
                    server_name = %hello.server_name,
                    remote = ?hello.remote_addr,
                    error = %e,
                    "tls-alpn challenge"
                );
                e
            })?;
            self.stats().challenges_served.fetch_add(1, Ordering::Relaxed);
            return Ok(resolved);
        }

        let cert = self.get_cert_during_handshake(hello, true).await?;
        Ok(ResolvedCertificate::Certificate(cert))
    }

    /// Like [`get_certificate`](Self::get_certificate), bounded by the
    /// caller's handshake budget. On expiry the resolution is abandoned
    /// (in-flight singleflight owners keep running for the benefit of
    /// other waiters) and [`HandshakeError::Cancelled`] is returned.
    pub async fn get_certificate_with_timeout(
        &self,
        hello: &ClientHelloInfo,
        budget: Duration,
    ) -> HandshakeResult<ResolvedCertificate> {
        match tokio::time::timeout(budget, self.get_certificate(hello)).await {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::Cancelled {
                message: format!(
                    "handshake budget of {budget:?} exhausted resolving '{}'",
                    hello.server_name
                ),
            }),
        }
    }

    /// Resolve a certificate for `hello` from cache, managers, storage,
    /// or the CA.
    ///
    /// `load_or_obtain` permits storage loads and CA issuance; waiters
    /// woken by a singleflight signal re-enter with it unset, expecting
    /// the owner to have populated the cache. An error is returned if
    /// and only if no certificate is available.
    pub(crate) fn get_cert_during_handshake<'a>(
        &'a self,
        hello: &'a ClientHelloInfo,
        load_or_obtain: bool,
    ) -> Pin<Box<dyn Future<Output = HandshakeResult<CachedCertificate>> + Send + 'a>> {
        Box::pin(async move {
            let defaulted = match self.lookup_for_hello(hello) {
                LookupOutcome::Matched(cert) => {
                    self.stats().cache_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        subjects = ?cert.names(),
                        managed = cert.managed(),
                        hash = %cert.hash(),
                        "matched certificate in cache"
                    );
                    // On-demand certificates are maintained by the
                    // handshakes that use them rather than by the
                    // background maintenance schedule.
                    if cert.managed() && self.config().on_demand.is_some() && load_or_obtain {
                        return self.optional_maintenance(hello, cert).await;
                    }
                    return Ok(cert);
                },
                LookupOutcome::Defaulted(cert) => Some(cert),
                LookupOutcome::Miss => None,
            };
            self.stats().cache_misses.fetch_add(1, Ordering::Relaxed);

            let name = name_from_hello(hello, self.config())?;
            if name.is_empty() {
                // No SNI, no default name, no local address to go by.
                if let Some(cert) = defaulted {
                    return Ok(cert);
                }
                return Err(HandshakeError::NoCertificate {
                    name: hello.server_name.clone(),
                });
            }

            // A swarm of handshakes for one name must not pound storage
            // or the CA; collapse them to a single load.
            match self.cache().load_waiters.acquire(&name) {
                Flight::Waiter(rx) => {
                    wait_for_flight(rx, &name, "load").await?;
                    // The owner has populated the cache (or failed);
                    // either way the cache now has the answer.
                    self.get_cert_during_handshake(hello, false).await
                },
                Flight::Owner(slot) => {
                    let result = self
                        .resolve_uncached(hello, &name, load_or_obtain, defaulted)
                        .await;
                    slot.release();
                    result
                },
            }
        })
    }

    /// The owner's share of a cache miss: managers, policy, storage,
    /// issuance, fallback.
    async fn resolve_uncached(
        &self,
        hello: &ClientHelloInfo,
        name: &str,
        load_or_obtain: bool,
        defaulted: Option<CachedCertificate>,
    ) -> HandshakeResult<CachedCertificate> {
        // External managers get the first shot; our own logic only runs
        // when they all decline.
        if let Some(cert) = self.cert_from_any_manager(hello).await? {
            return Ok(cert);
        }

        // If no certificate is allowed for this name there is no sense
        // in hitting storage or an issuer for it.
        self.check_if_cert_should_be_obtained(name, hello, false)
            .await?;

        // Storage is consulted when on-demand is enabled, and also when
        // the cache is nearly full: a statically-managed record may
        // have been evicted and still be loadable from disk.
        let cache_almost_full = self.cache().almost_full();
        let on_demand = self.config().on_demand.is_some();
        let load_dynamically = on_demand || cache_almost_full;

        if load_dynamically && load_or_obtain {
            match self.load_cert_from_storage(hello, name).await {
                Ok(cert) => return Ok(cert),
                Err(e) => {
                    debug!(
                        server_name = %hello.server_name,
                        error = %e,
                        "did not load certificate from storage"
                    );
                    if on_demand {
                        return self.obtain_on_demand_certificate(hello).await;
                    }
                },
            }
        }

        if let Some(cert) = defaulted {
            debug!(
                subjects = ?cert.names(),
                managed = cert.managed(),
                hash = %cert.hash(),
                "fell back to default certificate"
            );
            return Ok(cert);
        }

        debug!(
            server_name = %hello.server_name,
            identifier = %name,
            cipher_suites = ?hello.cipher_suites,
            cache_almost_full,
            load_or_obtain_if_necessary = load_or_obtain,
            on_demand,
            "no certificate matching TLS ClientHello"
        );

        Err(HandshakeError::NoCertificate {
            name: name.to_string(),
        })
    }

    /// Ask the configured external managers for a certificate, in
    /// order; the first one to produce a certificate wins. Manager
    /// errors are logged and the next manager is tried; an error from
    /// the final manager with no certificate produced aborts.
    async fn cert_from_any_manager(
        &self,
        hello: &ClientHelloInfo,
    ) -> HandshakeResult<Option<CachedCertificate>> {
        let managers = match &self.config().on_demand {
            Some(on_demand) if !on_demand.managers.is_empty() => &on_demand.managers,
            _ => return Ok(None),
        };

        let mut last_err = None;
        for (idx, manager) in managers.iter().enumerate() {
            match manager.get_certificate(hello).await {
                Ok(Some(raw)) => {
                    let cert = CachedCertificate::from_der(raw.chain, raw.key).map_err(|e| {
                        HandshakeError::upstream(
                            format!(
                                "external certificate manager: {}: filling record from leaf",
                                hello.server_name
                            ),
                            crate::upstream::UpstreamError::Storage {
                                message: e.to_string(),
                            },
                        )
                    })?;
                    debug!(
                        sni = %hello.server_name,
                        names = ?cert.names(),
                        "using externally-managed certificate"
                    );
                    return Ok(Some(cert));
                },
                Ok(None) => {
                    last_err = None;
                },
                Err(e) => {
                    error!(
                        sni = %hello.server_name,
                        cert_manager_idx = idx,
                        error = %e,
                        "external certificate manager"
                    );
                    last_err = Some(e);
                },
            }
        }

        match last_err {
            Some(e) => Err(HandshakeError::upstream(
                "external certificate manager indicated that it is unable to yield certificate",
                e,
            )),
            None => {
                debug!(
                    sni = %hello.server_name,
                    "all external certificate managers yielded no certificates and no errors"
                );
                Ok(None)
            },
        }
    }

    async fn emit_tls_get_certificate(&self, hello: &ClientHelloInfo) -> HandshakeResult<()> {
        let Some(events) = self.events() else {
            return Ok(());
        };
        let event = Event {
            id: TLS_GET_CERTIFICATE,
            payload: serde_json::json!({ "client_hello": hello }),
        };
        if let Err(e) = events.handle(event).await {
            error!(
                server_name = %hello.server_name,
                remote = ?hello.remote_addr,
                error = %e,
                "TLS handshake aborted by event handler"
            );
            return Err(HandshakeError::EventAborted { reason: e.message });
        }
        Ok(())
    }

    /// The resolver's configuration.
    #[must_use]
    pub fn config(&self) -> &ResolverConfig {
        &self.inner.config
    }

    /// The shared certificate cache.
    #[must_use]
    pub fn cache(&self) -> &CertificateCache {
        &self.inner.cache
    }

    /// Handshake activity counters.
    #[must_use]
    pub fn stats(&self) -> &HandshakeStats {
        &self.inner.stats
    }

    pub(crate) fn storage(&self) -> &Arc<dyn ManagedCertificateStore> {
        &self.inner.storage
    }

    pub(crate) fn issuer(&self) -> Option<&Arc<dyn AcmeIssuer>> {
        self.inner.issuer.as_ref()
    }

    pub(crate) fn ocsp(&self) -> Option<&Arc<dyn OcspStapler>> {
        self.inner.ocsp.as_ref()
    }

    pub(crate) fn challenges(&self) -> Option<&Arc<dyn ChallengeRegistry>> {
        self.inner.challenges.as_ref()
    }

    fn events(&self) -> Option<&Arc<dyn EventHandler>> {
        self.inner.events.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::self_signed;
    use crate::events::EventError;
    use async_trait::async_trait;

    struct Veto;

    #[async_trait]
    impl EventHandler for Veto {
        async fn handle(&self, event: Event) -> Result<(), EventError> {
            assert_eq!(event.id, TLS_GET_CERTIFICATE);
            assert!(event.payload["client_hello"]["server_name"].is_string());
            Err(EventError::new("not today"))
        }
    }

    #[tokio::test]
    async fn test_event_handler_can_abort_the_handshake() {
        let resolver = ResolverBuilder::new().events(Arc::new(Veto)).build();
        let hello = ClientHelloInfo::new("example.com");

        let err = resolver.get_certificate(&hello).await.unwrap_err();
        assert!(matches!(err, HandshakeError::EventAborted { .. }));
        assert!(err.to_string().contains("not today"));
    }

    #[tokio::test]
    async fn test_empty_sni_without_default_or_connection_is_not_found() {
        let resolver = ResolverBuilder::new().build();
        let hello = ClientHelloInfo::new("");

        let err = resolver.get_certificate(&hello).await.unwrap_err();
        assert!(matches!(err, HandshakeError::NoCertificate { .. }));
    }

    #[tokio::test]
    async fn test_exact_cache_hit_is_served() {
        let resolver = ResolverBuilder::new().build();
        let cert = self_signed(&["example.com"]);
        let hash = cert.hash().to_string();
        resolver.cache().insert(cert);

        let hello = ClientHelloInfo::new("example.com");
        let resolved = resolver.get_certificate(&hello).await.unwrap();
        assert_eq!(resolved.record().unwrap().hash(), hash);
        assert_eq!(resolver.stats().cache_hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_fallback_server_name_serves_unmatched_sni() {
        let config = ResolverConfig::new().with_fallback_server_name("fallback.example.com");
        let resolver = ResolverBuilder::new().config(config).build();
        resolver.cache().insert(self_signed(&["fallback.example.com"]));

        let hello = ClientHelloInfo::new("unknown.example.net");
        let resolved = resolver.get_certificate(&hello).await.unwrap();
        assert_eq!(
            resolved.record().unwrap().names(),
            ["fallback.example.com"]
        );
    }

    #[tokio::test]
    async fn test_resolution_within_budget() {
        let resolver = ResolverBuilder::new().build();
        resolver.cache().insert(self_signed(&["example.com"]));
        let hello = ClientHelloInfo::new("example.com");

        resolver
            .get_certificate_with_timeout(&hello, Duration::from_secs(5))
            .await
            .unwrap();
    }
}
