//! Storage loads, on-demand issuance, and dynamic renewal.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::cache::CachedCertificate;
use crate::upstream::UpstreamError;

use super::error::{HandshakeError, HandshakeResult};
use super::hello::ClientHelloInfo;
use super::name::{name_from_hello, wildcard_variant};
use super::resolver::CertificateResolver;
use super::singleflight::{wait_for_flight, Flight, OwnerSlot};

/// Budget for obtaining a brand-new certificate during a handshake,
/// covering the CA round trips and the reload from storage.
pub(crate) const OBTAIN_TIMEOUT: Duration = Duration::from_secs(180);

/// Budget for renewing an expired (or revoked) certificate while the
/// handshake blocks on it.
pub(crate) const FOREGROUND_RENEWAL_TIMEOUT: Duration = Duration::from_secs(90);

/// Budget for renewing a still-valid certificate behind the handshake's
/// back.
pub(crate) const BACKGROUND_RENEWAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

impl CertificateResolver {
    /// Load the certificate for `name` from storage into the cache and
    /// maintain it.
    ///
    /// When storage has no exact-name certificate, a wildcard variant
    /// (leftmost label replaced by `*`) is still usable and is tried
    /// next. The freshly-loaded record is maintained before it is
    /// returned; if maintenance fails the loaded record is served
    /// anyway and the failure is logged.
    pub(crate) async fn load_cert_from_storage(
        &self,
        hello: &ClientHelloInfo,
        name: &str,
    ) -> HandshakeResult<CachedCertificate> {
        let loaded = match self.storage().load_certificate(name).await {
            Err(e) if e.is_not_found() => {
                self.storage()
                    .load_certificate(&wildcard_variant(name))
                    .await
            },
            result => result,
        }
        .map_err(|e| {
            HandshakeError::upstream(format!("no matching certificate to load for {name}"), e)
        })?;

        self.cache().insert(loaded.clone());
        self.stats().storage_loads.fetch_add(1, Ordering::Relaxed);
        debug!(
            subjects = ?loaded.names(),
            managed = loaded.managed(),
            hash = %loaded.hash(),
            "loaded certificate from storage"
        );

        match self.handshake_maintenance(hello, loaded.clone()).await {
            Ok(maintained) => Ok(maintained),
            Err(e) => {
                error!(
                    server_name = %name,
                    error = %e,
                    "maintaining newly-loaded certificate"
                );
                Ok(loaded)
            },
        }
    }

    /// Obtain a certificate for `hello` from the CA.
    ///
    /// If another task is already obtaining one for this name, wait for
    /// it and read its result from the cache. The owner writes through
    /// storage and loads the new record into the cache before waiters
    /// are unblocked.
    pub(crate) fn obtain_on_demand_certificate<'a>(
        &'a self,
        hello: &'a ClientHelloInfo,
    ) -> Pin<Box<dyn Future<Output = HandshakeResult<CachedCertificate>> + Send + 'a>> {
        Box::pin(async move {
            let name = name_from_hello(hello, self.config())?;

            let slot = match self.cache().obtain_waiters.acquire(&name) {
                Flight::Waiter(rx) => {
                    debug!(
                        subject = %name,
                        "new certificate is needed, but is already being obtained; waiting for that issuance to complete"
                    );
                    wait_for_flight(rx, &name, "obtain").await?;
                    // It should now be in the cache, ready to go; if
                    // not, the task in charge probably had an error.
                    return self.get_cert_during_handshake(hello, false).await;
                },
                Flight::Owner(slot) => slot,
            };

            info!(server_name = %name, "obtaining new certificate");

            let issuer = self.issuer().cloned().ok_or_else(|| {
                HandshakeError::upstream(
                    format!("obtaining certificate for {name}"),
                    UpstreamError::Issuer {
                        message: "no certificate issuer configured".to_string(),
                    },
                )
            })?;

            // Cap the whole operation so a slow CA cannot hold this
            // client handshake open indefinitely.
            let outcome = match tokio::time::timeout(OBTAIN_TIMEOUT, async {
                issuer.obtain_certificate(&name).await.map_err(|e| {
                    HandshakeError::upstream(format!("obtaining certificate for {name}"), e)
                })?;
                // Issuance wrote through storage; load from storage
                // while others wait so the cache holds the record
                // before the slot is released.
                self.load_cert_from_storage(hello, &name).await
            })
            .await
            {
                Ok(result) => result,
                Err(_) => Err(HandshakeError::upstream(
                    format!("obtaining certificate for {name}"),
                    UpstreamError::timeout(format!(
                        "issuance did not finish within {OBTAIN_TIMEOUT:?}"
                    )),
                )),
            };

            match &outcome {
                Ok(cert) => {
                    self.stats()
                        .certificates_obtained
                        .fetch_add(1, Ordering::Relaxed);
                    info!(
                        server_name = %name,
                        subjects = ?cert.names(),
                        "obtained and cached new certificate"
                    );
                },
                Err(e) => {
                    error!(server_name = %name, error = %e, "obtaining certificate");
                },
            }

            // Immediately unblock anyone waiting for it.
            slot.release();

            outcome
        })
    }

    /// Renew the certificate behind `current` because a handshake found
    /// it expiring, expired, or revoked.
    ///
    /// While the certificate still has time left (and is not revoked),
    /// the current record is served and the renewal runs on a detached
    /// background task; otherwise the handshake blocks on the renewal.
    /// A revoked certificate is forcefully renewed so its key material
    /// is replaced.
    pub(crate) async fn renew_dynamic_certificate(
        &self,
        hello: &ClientHelloInfo,
        current: CachedCertificate,
    ) -> HandshakeResult<CachedCertificate> {
        let name = name_from_hello(hello, self.config())?;
        let usable = !current.expired() && !current.revoked();
        let revoked = current.revoked();

        let slot = match self.cache().obtain_waiters.acquire(&name) {
            Flight::Waiter(rx) => {
                if usable {
                    // Another task is on it and what we have is still
                    // good; no reason to block this handshake.
                    debug!(
                        subjects = ?current.names(),
                        "certificate expires soon but is already being renewed; serving current certificate"
                    );
                    return Ok(current);
                }

                debug!(
                    subjects = ?current.names(),
                    revoked,
                    "certificate is unusable, but is already being renewed; waiting for renewal to complete"
                );
                wait_for_flight(rx, &name, "renew").await?;
                return self.get_cert_during_handshake(hello, false).await;
            },
            Flight::Owner(slot) => slot,
        };

        if usable {
            // Serve what we have and renew behind the handshake's back.
            let resolver = self.clone();
            let hello = hello.clone();
            let cert = current.clone();
            let task_name = name.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(
                    BACKGROUND_RENEWAL_TIMEOUT,
                    resolver.renew_and_reload(slot, &task_name, &hello, cert, revoked),
                )
                .await
                {
                    Ok(Ok(_)) | Ok(Err(_)) => {}, // renew_and_reload logs its own outcome
                    Err(_) => {
                        error!(server_name = %task_name, "background renewal timed out");
                    },
                }
            });
            return Ok(current);
        }

        // Expired or revoked: block, bounded so the handshake cannot
        // hang on a slow CA.
        match tokio::time::timeout(
            FOREGROUND_RENEWAL_TIMEOUT,
            self.renew_and_reload(slot, &name, hello, current, revoked),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::upstream(
                format!("renewing certificate for {name}"),
                UpstreamError::timeout(format!(
                    "renewal did not finish within {FOREGROUND_RENEWAL_TIMEOUT:?}"
                )),
            )),
        }
    }

    /// The owner's renewal work: policy re-check, renew with the
    /// issuer, reload the new record into the cache, release waiters.
    async fn renew_and_reload(
        &self,
        slot: OwnerSlot,
        name: &str,
        hello: &ClientHelloInfo,
        current: CachedCertificate,
        force: bool,
    ) -> HandshakeResult<CachedCertificate> {
        // The on-demand decision may have changed since issuance; an
        // unrenewable certificate also stops being served from cache.
        if let Err(e) = self
            .check_if_cert_should_be_obtained(name, hello, true)
            .await
        {
            self.cache().remove(current.hash());
            slot.release();
            error!(server_name = %name, error = %e, "certificate should not be obtained");
            return Err(e);
        }

        info!(
            server_name = %name,
            subjects = ?current.names(),
            force,
            "attempting certificate renewal"
        );

        let issuer = self.issuer().cloned().ok_or_else(|| {
            HandshakeError::upstream(
                format!("renewing certificate for {name}"),
                UpstreamError::Issuer {
                    message: "no certificate issuer configured".to_string(),
                },
            )
        })?;

        let outcome = match issuer.renew_certificate(name, force).await {
            Ok(()) => self.reload_managed_certificate(&current).await,
            Err(e) => Err(HandshakeError::upstream(
                format!("renewing certificate for {name}"),
                e,
            )),
        };

        // Unblock waiters now that the cache reflects the result; doing
        // this before any further resolution avoids waiters piling onto
        // a slot whose work is already done.
        slot.release();

        match &outcome {
            Ok(cert) => {
                self.stats()
                    .certificates_renewed
                    .fetch_add(1, Ordering::Relaxed);
                info!(
                    server_name = %name,
                    subjects = ?cert.names(),
                    "renewed and reloaded certificate"
                );
            },
            Err(e) => {
                error!(server_name = %name, error = %e, "renewing and reloading certificate");
            },
        }

        outcome
    }

    /// Replace the cached record behind `old` with the certificate now
    /// in storage for its primary name.
    pub(crate) async fn reload_managed_certificate(
        &self,
        old: &CachedCertificate,
    ) -> HandshakeResult<CachedCertificate> {
        let name = old.names().first().cloned().unwrap_or_default();
        let new = self
            .storage()
            .load_certificate(&name)
            .await
            .map_err(|e| {
                HandshakeError::upstream(format!("reloading renewed certificate for {name}"), e)
            })?;
        self.cache().replace(old.hash(), new.clone());
        Ok(new)
    }
}
