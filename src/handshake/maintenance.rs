//! Certificate upkeep triggered by handshakes.
//!
//! On-demand certificates are not visited by a background maintenance
//! schedule; the handshakes that use them check expiration, OCSP
//! freshness, and ARI status, and trigger refreshes or renewals as
//! needed — in the foreground when the certificate is unusable, in the
//! background otherwise.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::cache::{CachedCertificate, RenewalInfo};
use crate::upstream::UpstreamError;

use super::error::{HandshakeError, HandshakeResult};
use super::hello::ClientHelloInfo;
use super::resolver::CertificateResolver;

/// Budget for a detached ARI update plus any renewal it triggers.
pub(crate) const ARI_UPDATE_TIMEOUT: Duration = Duration::from_secs(8 * 60);

impl CertificateResolver {
    /// Maintain a cache-hit certificate, preferring to keep the
    /// handshake alive: when maintenance fails but the certificate is
    /// still unexpired, it is served anyway and the failure is logged.
    pub(crate) async fn optional_maintenance(
        &self,
        hello: &ClientHelloInfo,
        cert: CachedCertificate,
    ) -> HandshakeResult<CachedCertificate> {
        match self.handshake_maintenance(hello, cert.clone()).await {
            Ok(maintained) => Ok(maintained),
            Err(e) => {
                error!(
                    subjects = ?cert.names(),
                    error = %e,
                    "renewing certificate on-demand failed"
                );
                if cert.expired() {
                    return Err(e);
                }
                // Still has time remaining, so serve it anyway.
                Ok(cert)
            },
        }
    }

    /// Check a certificate's OCSP staple, ARI status, revocation, and
    /// renewal window, refreshing or renewing as required. Returns the
    /// record the handshake should use, which the caller substitutes
    /// for the one it held.
    pub(crate) async fn handshake_maintenance(
        &self,
        hello: &ClientHelloInfo,
        mut cert: CachedCertificate,
    ) -> HandshakeResult<CachedCertificate> {
        // Refresh a stale OCSP staple synchronously; the refreshed
        // record replaces the cache entry under its unchanged hash.
        if let Some(stapler) = self.ocsp() {
            if cert.ocsp().is_some_and(|staple| !staple.fresh()) {
                debug!(
                    subjects = ?cert.names(),
                    "OCSP response needs refreshing"
                );
                match stapler.staple(&cert).await {
                    Ok(staple) => {
                        cert = cert.with_ocsp(staple);
                        self.cache().update(cert.clone());
                        self.stats().ocsp_refreshes.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            subjects = ?cert.names(),
                            "successfully stapled new OCSP response"
                        );
                    },
                    Err(e) => {
                        // Quite common: not every issuer URL supports
                        // OCSP. Never the end of the handshake.
                        warn!(error = %e, "stapling OCSP");
                    },
                }
            }
        }

        // ARI runs off the handshake path: the update lands in the
        // cache and in storage, so future handshakes see it. Only
        // relevant while the certificate is unexpired; an expired one
        // already needs renewal.
        if !self.config().disable_ari
            && self.issuer().is_some()
            && cert.ari().map_or(true, RenewalInfo::needs_refresh)
            && !cert.expired()
        {
            let resolver = self.clone();
            let hello = hello.clone();
            let cert_bg = cert.clone();
            tokio::spawn(async move {
                let work = async {
                    let cert = match resolver.update_ari(cert_bg).await {
                        Ok(updated) => updated,
                        Err(e) => {
                            error!(error = %e, "updating ARI");
                            return;
                        },
                    };
                    if let Err(e) = resolver.renew_if_necessary(&hello, cert).await {
                        error!(error = %e, "renewing certificate based on updated ARI");
                    }
                };
                if tokio::time::timeout(ARI_UPDATE_TIMEOUT, work).await.is_err() {
                    warn!("ARI update timed out");
                }
            });
        }

        // Replace revoked certificates before anything else; crucially
        // this happens outside any lock on the cache.
        if cert.revoked() {
            if let Some(staple) = cert.ocsp() {
                warn!(
                    subjects = ?cert.names(),
                    revoked_at = ?staple.revoked_at,
                    "certificate's OCSP status is REVOKED; will try to forcefully renew"
                );
            }
            return self.renew_dynamic_certificate(hello, cert).await;
        }

        // Renewal conditions may have changed above, so check last.
        self.renew_if_necessary(hello, cert).await
    }

    /// Renew the certificate if its window (or ARI) says so. A record
    /// whose storage resources were cleaned up while it sat in the
    /// cache goes straight to a fresh obtain instead.
    pub(crate) async fn renew_if_necessary(
        &self,
        hello: &ClientHelloInfo,
        cert: CachedCertificate,
    ) -> HandshakeResult<CachedCertificate> {
        let ratio = self.config().effective_renewal_window_ratio();
        if !cert.needs_renewal(ratio, true) {
            return Ok(cert);
        }

        let name = cert.names().first().cloned().unwrap_or_default();
        if !self.storage().has_certificate_resources(&name).await {
            debug!(
                subjects = ?cert.names(),
                "certificate not found on disk; obtaining new certificate"
            );
            return self.obtain_on_demand_certificate(hello).await;
        }

        self.renew_dynamic_certificate(hello, cert).await
    }

    /// Fetch updated renewal info and store it on the cached record.
    pub(crate) async fn update_ari(
        &self,
        cert: CachedCertificate,
    ) -> HandshakeResult<CachedCertificate> {
        let issuer = self.issuer().cloned().ok_or_else(|| {
            HandshakeError::upstream(
                "updating renewal info",
                UpstreamError::Issuer {
                    message: "no certificate issuer configured".to_string(),
                },
            )
        })?;

        let ari = issuer
            .update_renewal_info(&cert)
            .await
            .map_err(|e| HandshakeError::upstream("updating renewal info", e))?;

        let updated = cert.with_ari(ari);
        self.cache().update(updated.clone());
        Ok(updated)
    }
}
