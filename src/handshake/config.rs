//! Resolver configuration.

use std::sync::Arc;

use super::lookup::CertificateSelector;
use super::policy::OnDemandConfig;

/// Behavioral configuration for certificate resolution.
#[derive(Clone, Default)]
pub struct ResolverConfig {
    /// Name to use when the client sends no SNI (tried before the
    /// connection's local IP address).
    pub default_server_name: Option<String>,

    /// Name whose certificate is served when nothing matches the SNI.
    /// Some clients send one SNI value but accept a certificate for a
    /// different name in return; this covers that niche.
    pub fallback_server_name: Option<String>,

    /// Disable ACME Renewal Information handling entirely.
    pub disable_ari: bool,

    /// Fraction of a certificate's lifetime that may remain before it
    /// counts as needing renewal.
    pub renewal_window_ratio: f64,

    /// On-demand issuance policy; `None` disables issuing certificates
    /// at handshake time.
    pub on_demand: Option<OnDemandConfig>,

    /// Custom certificate selection logic, replacing the default
    /// first-compatible-unexpired rule.
    pub cert_selection: Option<Arc<dyn CertificateSelector>>,
}

impl std::fmt::Debug for ResolverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverConfig")
            .field("default_server_name", &self.default_server_name)
            .field("fallback_server_name", &self.fallback_server_name)
            .field("disable_ari", &self.disable_ari)
            .field("renewal_window_ratio", &self.renewal_window_ratio)
            .field("on_demand", &self.on_demand.is_some())
            .field("cert_selection", &self.cert_selection.is_some())
            .finish()
    }
}

impl ResolverConfig {
    /// Default fraction of lifetime remaining at which renewal starts.
    pub const DEFAULT_RENEWAL_WINDOW_RATIO: f64 = 1.0 / 3.0;

    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            renewal_window_ratio: Self::DEFAULT_RENEWAL_WINDOW_RATIO,
            ..Self::default()
        }
    }

    /// Set the default server name for SNI-less handshakes.
    #[must_use]
    pub fn with_default_server_name(mut self, name: impl Into<String>) -> Self {
        self.default_server_name = Some(name.into());
        self
    }

    /// Set the fallback server name for unmatched SNI.
    #[must_use]
    pub fn with_fallback_server_name(mut self, name: impl Into<String>) -> Self {
        self.fallback_server_name = Some(name.into());
        self
    }

    /// Enable on-demand issuance with the given policy.
    #[must_use]
    pub fn with_on_demand(mut self, on_demand: OnDemandConfig) -> Self {
        self.on_demand = Some(on_demand);
        self
    }

    /// The effective renewal window ratio (defaulted when unset).
    #[must_use]
    pub fn effective_renewal_window_ratio(&self) -> f64 {
        if self.renewal_window_ratio > 0.0 && self.renewal_window_ratio <= 1.0 {
            self.renewal_window_ratio
        } else {
            Self::DEFAULT_RENEWAL_WINDOW_RATIO
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first invalid setting.
    pub fn validate(&self) -> Result<(), String> {
        if self.renewal_window_ratio < 0.0 || self.renewal_window_ratio > 1.0 {
            return Err(format!(
                "renewal window ratio must be within [0, 1], got {}",
                self.renewal_window_ratio
            ));
        }
        for (field, value) in [
            ("default server name", &self.default_server_name),
            ("fallback server name", &self.fallback_server_name),
        ] {
            if let Some(name) = value {
                if name.trim().is_empty() {
                    return Err(format!("{field} must not be blank"));
                }
            }
        }
        Ok(())
    }
}
