//! Cache lookup and certificate selection.

use tracing::debug;

use crate::cache::CachedCertificate;

use super::hello::ClientHelloInfo;
use super::name::{local_ip, normalized_name};
use super::resolver::CertificateResolver;

/// What a cache lookup produced for a handshake.
#[derive(Debug)]
pub(crate) enum LookupOutcome {
    /// A certificate matching the requested name (exact or wildcard).
    Matched(CachedCertificate),
    /// No match, but a configured default/fallback certificate exists.
    Defaulted(CachedCertificate),
    /// Nothing usable in the cache.
    Miss,
}

/// Custom certificate selection logic.
///
/// Given the candidates that matched a name, pick the one to serve. An
/// error is treated as "no match" for that name and the search
/// continues.
pub trait CertificateSelector: Send + Sync {
    /// Choose a certificate from `choices` for this handshake.
    ///
    /// # Errors
    ///
    /// Any error makes the resolver treat the name as unmatched.
    fn select_certificate(
        &self,
        hello: &ClientHelloInfo,
        choices: &[CachedCertificate],
    ) -> Result<CachedCertificate, Box<dyn std::error::Error + Send + Sync>>;
}

/// Default selection rule: with a single candidate, return it
/// unconditionally. Otherwise prefer the first client-compatible
/// candidate that is currently within its validity window; failing
/// that, the last client-compatible candidate; failing that, the first
/// candidate.
#[must_use]
pub fn default_certificate_selector(
    hello: &ClientHelloInfo,
    choices: &[CachedCertificate],
) -> Option<CachedCertificate> {
    match choices {
        [] => None,
        // Fast path: one choice means no compatibility or expiry checks.
        [only] => Some(only.clone()),
        _ => {
            let mut best = &choices[0];
            for choice in choices {
                if !hello.supports_certificate(choice) {
                    continue;
                }
                best = choice;
                if choice.currently_valid() {
                    return Some(choice.clone());
                }
            }
            // All matching certs are expired or incompatible, oh well.
            Some(best.clone())
        },
    }
}

impl CertificateResolver {
    /// Find a certificate for the handshake in the in-memory cache.
    ///
    /// For a non-empty SNI: exact name first, then single-label
    /// wildcard candidates in label-index order (RFC 6125; multi-label
    /// wildcards are never tried). For an empty SNI: the connection's
    /// local IP, then the configured default server name. When nothing
    /// matched, the configured fallback server name may still supply a
    /// default certificate.
    pub(crate) fn lookup_for_hello(&self, hello: &ClientHelloInfo) -> LookupOutcome {
        let name = normalized_name(&hello.server_name);

        if name.is_empty() {
            // No SNI: prefer matching the IP the client dialed.
            if let Some(addr) = hello.local_addr {
                if let Some(cert) = self.select_cert(hello, &local_ip(addr)) {
                    return LookupOutcome::Matched(cert);
                }
            }
            if let Some(default) = &self.config().default_server_name {
                if let Some(cert) = self.select_cert(hello, &normalized_name(default)) {
                    return LookupOutcome::Defaulted(cert);
                }
            }
        } else {
            if let Some(cert) = self.select_cert(hello, &name) {
                return LookupOutcome::Matched(cert);
            }

            // Substitute a wildcard at each label position in turn,
            // leaving the other labels literal.
            let labels: Vec<&str> = name.split('.').collect();
            for i in 0..labels.len() {
                let mut candidate_labels = labels.clone();
                candidate_labels[i] = "*";
                let candidate = candidate_labels.join(".");
                if let Some(cert) = self.select_cert(hello, &candidate) {
                    return LookupOutcome::Matched(cert);
                }
            }
        }

        if let Some(fallback) = &self.config().fallback_server_name {
            if let Some(cert) = self.select_cert(hello, &normalized_name(fallback)) {
                return LookupOutcome::Defaulted(cert);
            }
        }

        LookupOutcome::Miss
    }

    /// Select a certificate for `name` from the cache.
    ///
    /// With no candidates and a custom selector configured, the whole
    /// cache becomes the candidate list and the selector makes the
    /// final call.
    fn select_cert(&self, hello: &ClientHelloInfo, name: &str) -> Option<CachedCertificate> {
        let mut choices = self.cache().all_matching(name);

        let custom = self.config().cert_selection.clone();
        if choices.is_empty() {
            match &custom {
                None => {
                    return None;
                },
                Some(_) => {
                    debug!(
                        identifier = %name,
                        "no matching certificate; will choose from all certificates"
                    );
                    choices = self.cache().all_certs();
                },
            }
        }

        debug!(
            identifier = %name,
            num_choices = choices.len(),
            "choosing certificate"
        );

        match custom {
            None => default_certificate_selector(hello, &choices),
            Some(selector) => match selector.select_certificate(hello, &choices) {
                Ok(cert) => {
                    debug!(
                        identifier = %name,
                        subjects = ?cert.names(),
                        managed = cert.managed(),
                        hash = %cert.hash(),
                        "custom certificate selection results"
                    );
                    Some(cert)
                },
                Err(e) => {
                    debug!(identifier = %name, error = %e, "custom selector declined");
                    None
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::{self_signed, self_signed_with_validity};

    #[test]
    fn test_single_candidate_returned_unconditionally() {
        // Even an expired certificate is returned when it is the only
        // choice.
        let expired = self_signed_with_validity(
            &["example.com"],
            time::Duration::days(-60),
            time::Duration::days(-30),
        );
        let hello = ClientHelloInfo::new("example.com");

        let picked = default_certificate_selector(&hello, &[expired.clone()]).unwrap();
        assert_eq!(picked.hash(), expired.hash());
    }

    #[test]
    fn test_unexpired_candidate_preferred() {
        let expired = self_signed_with_validity(
            &["example.com"],
            time::Duration::days(-60),
            time::Duration::days(-30),
        );
        let valid = self_signed(&["example.com"]);
        let hello = ClientHelloInfo::new("example.com");

        let picked =
            default_certificate_selector(&hello, &[expired, valid.clone()]).unwrap();
        assert_eq!(picked.hash(), valid.hash());
    }

    #[test]
    fn test_incompatible_candidates_skipped() {
        let a = self_signed(&["example.com"]);
        let b = self_signed(&["example.com"]);
        // Test certificates carry ECDSA keys; an RSA-only client
        // supports neither, so the first candidate wins by default.
        let rsa_only = ClientHelloInfo::new("example.com").with_signature_schemes(vec![0x0401]);

        let picked = default_certificate_selector(&rsa_only, &[a.clone(), b]).unwrap();
        assert_eq!(picked.hash(), a.hash());
    }

    #[test]
    fn test_empty_choices_yield_none() {
        let hello = ClientHelloInfo::new("example.com");
        assert!(default_certificate_selector(&hello, &[]).is_none());
    }

    struct FirstOrBust;

    impl CertificateSelector for FirstOrBust {
        fn select_certificate(
            &self,
            _hello: &ClientHelloInfo,
            choices: &[CachedCertificate],
        ) -> Result<CachedCertificate, Box<dyn std::error::Error + Send + Sync>> {
            choices
                .first()
                .cloned()
                .ok_or_else(|| "nothing to choose from".into())
        }
    }

    #[test]
    fn test_custom_selector_gets_whole_cache_on_miss() {
        use crate::handshake::resolver::ResolverBuilder;
        use std::sync::Arc;

        let mut config = crate::handshake::config::ResolverConfig::new();
        config.cert_selection = Some(Arc::new(FirstOrBust));
        let resolver = ResolverBuilder::new().config(config).build();

        let cert = self_signed(&["other.example.com"]);
        let hash = cert.hash().to_string();
        resolver.cache().insert(cert);

        // No entry matches this name, so the selector is offered every
        // cached certificate and picks one.
        let outcome = resolver.lookup_for_hello(&ClientHelloInfo::new("miss.example.com"));
        match outcome {
            LookupOutcome::Matched(picked) => assert_eq!(picked.hash(), hash),
            other => panic!("expected a match, got {other:?}"),
        }
    }
}
