//! On-demand issuance policy.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::upstream::{CertificateManager, UpstreamResult};

use super::error::{HandshakeError, HandshakeResult};
use super::hello::ClientHelloInfo;
use super::name::{normalized_name, subject_qualifies_for_cert};
use super::resolver::CertificateResolver;

/// Per-request decision on whether a name may have a certificate
/// issued for it.
///
/// The decision should be based on the name alone; the client hello is
/// provided for logging and diagnostics, not as an access-control
/// input.
#[async_trait]
pub trait DecisionPolicy: Send + Sync {
    /// Permit or refuse issuance for `name`; the error is final and its
    /// message is surfaced in the denial.
    async fn allow(&self, name: &str, hello: &ClientHelloInfo) -> UpstreamResult<()>;
}

/// Configuration enabling certificate work at handshake time.
#[derive(Clone, Default)]
pub struct OnDemandConfig {
    /// Names allowed to have certificates issued on demand. Ignored
    /// when a decision policy is set; an empty list allows every
    /// qualifying name.
    pub allowlist: HashSet<String>,

    /// Callback making the per-name decision. Takes precedence over the
    /// allowlist.
    pub decision: Option<Arc<dyn DecisionPolicy>>,

    /// External certificate sources tried before this library loads or
    /// obtains anything itself.
    pub managers: Vec<Arc<dyn CertificateManager>>,
}

impl std::fmt::Debug for OnDemandConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnDemandConfig")
            .field("allowlist", &self.allowlist)
            .field("decision", &self.decision.is_some())
            .field("managers", &self.managers.len())
            .finish()
    }
}

impl OnDemandConfig {
    /// Create an empty on-demand configuration (every qualifying name
    /// allowed).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict issuance to the given names (normalized on the way in).
    #[must_use]
    pub fn with_allowlist<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowlist = names
            .into_iter()
            .map(|n| normalized_name(n.as_ref()))
            .collect();
        self
    }

    /// Install a per-request decision policy.
    #[must_use]
    pub fn with_decision(mut self, decision: Arc<dyn DecisionPolicy>) -> Self {
        self.decision = Some(decision);
        self
    }

    /// Append an external certificate manager.
    #[must_use]
    pub fn with_manager(mut self, manager: Arc<dyn CertificateManager>) -> Self {
        self.managers.push(manager);
        self
    }
}

impl CertificateResolver {
    /// Check whether a certificate may be loaded or obtained for `name`.
    ///
    /// With `require_on_demand` set, the check fails outright when
    /// on-demand issuance is not configured (used on the renewal path,
    /// which must never issue for unconfigured deployments).
    pub(crate) async fn check_if_cert_should_be_obtained(
        &self,
        name: &str,
        hello: &ClientHelloInfo,
        require_on_demand: bool,
    ) -> HandshakeResult<()> {
        let on_demand = self.config().on_demand.as_ref();

        if require_on_demand && on_demand.is_none() {
            return Err(HandshakeError::PolicyDenied {
                name: name.to_string(),
                reason: "not configured for on-demand certificate issuance".to_string(),
            });
        }

        if !subject_qualifies_for_cert(name) {
            return Err(HandshakeError::InvalidName {
                name: name.to_string(),
                message: "subject name does not qualify for a certificate".to_string(),
            });
        }

        let Some(on_demand) = on_demand else {
            return Ok(());
        };

        if let Some(decision) = &on_demand.decision {
            // The decision callback is the final answer either way.
            return decision
                .allow(name, hello)
                .await
                .map_err(|e| HandshakeError::PolicyDenied {
                    name: name.to_string(),
                    reason: format!("decision func: {e}"),
                });
        }

        if !on_demand.allowlist.is_empty() && !on_demand.allowlist.contains(name) {
            return Err(HandshakeError::PolicyDenied {
                name: name.to_string(),
                reason: format!("certificate for '{name}' is not managed"),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::resolver::ResolverBuilder;
    use crate::upstream::UpstreamError;

    struct DenyAll;

    #[async_trait]
    impl DecisionPolicy for DenyAll {
        async fn allow(&self, name: &str, _hello: &ClientHelloInfo) -> UpstreamResult<()> {
            Err(UpstreamError::Denied {
                message: format!("{name} is not welcome here"),
            })
        }
    }

    struct AllowAll;

    #[async_trait]
    impl DecisionPolicy for AllowAll {
        async fn allow(&self, _name: &str, _hello: &ClientHelloInfo) -> UpstreamResult<()> {
            Ok(())
        }
    }

    fn resolver_with(on_demand: Option<OnDemandConfig>) -> CertificateResolver {
        let mut config = crate::handshake::config::ResolverConfig::new();
        config.on_demand = on_demand;
        ResolverBuilder::new().config(config).build()
    }

    #[tokio::test]
    async fn test_require_on_demand_without_config_is_denied() {
        let resolver = resolver_with(None);
        let hello = ClientHelloInfo::new("example.com");
        let err = resolver
            .check_if_cert_should_be_obtained("example.com", &hello, true)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::PolicyDenied { .. }));
        assert!(err.to_string().contains("not configured for on-demand"));
    }

    #[tokio::test]
    async fn test_unqualified_subjects_are_rejected() {
        let resolver = resolver_with(Some(OnDemandConfig::new()));
        let hello = ClientHelloInfo::new("*.example.com");
        let err = resolver
            .check_if_cert_should_be_obtained("*.example.com", &hello, false)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidName { .. }));
    }

    #[tokio::test]
    async fn test_decision_policy_is_final() {
        let allowed = OnDemandConfig::new()
            .with_allowlist(["other.example.com"])
            .with_decision(Arc::new(AllowAll));
        let resolver = resolver_with(Some(allowed));
        let hello = ClientHelloInfo::new("example.com");

        // Decision says yes even though the allowlist would say no.
        resolver
            .check_if_cert_should_be_obtained("example.com", &hello, false)
            .await
            .unwrap();

        let denied = OnDemandConfig::new().with_decision(Arc::new(DenyAll));
        let resolver = resolver_with(Some(denied));
        let err = resolver
            .check_if_cert_should_be_obtained("example.com", &hello, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("decision func"));
    }

    #[tokio::test]
    async fn test_allowlist_membership() {
        let on_demand = OnDemandConfig::new().with_allowlist(["Example.COM"]);
        let resolver = resolver_with(Some(on_demand));
        let hello = ClientHelloInfo::new("example.com");

        resolver
            .check_if_cert_should_be_obtained("example.com", &hello, false)
            .await
            .unwrap();

        let err = resolver
            .check_if_cert_should_be_obtained("other.example.com", &hello, false)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::PolicyDenied { .. }));
    }

    #[tokio::test]
    async fn test_empty_allowlist_allows_qualifying_names() {
        let resolver = resolver_with(Some(OnDemandConfig::new()));
        let hello = ClientHelloInfo::new("anything.example.com");
        resolver
            .check_if_cert_should_be_obtained("anything.example.com", &hello, false)
            .await
            .unwrap();
    }
}
