//! Interfaces to the external systems the resolver drives.
//!
//! The resolver itself never talks to disks, certificate authorities,
//! OCSP responders, or challenge state directly; the surrounding system
//! implements these traits. Every method is a suspension point and is
//! cancelled by dropping the resolver's future.

mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::cache::{CachedCertificate, OcspStaple, RenewalInfo};
use crate::handshake::ClientHelloInfo;

pub use memory::MemoryStore;

/// Errors returned by external collaborators.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The requested resource does not exist.
    #[error("not found: {subject}")]
    NotFound {
        /// What was looked up.
        subject: String,
    },

    /// The storage backend failed.
    #[error("storage: {message}")]
    Storage {
        /// Error message.
        message: String,
    },

    /// The certificate authority failed.
    #[error("issuer: {message}")]
    Issuer {
        /// Error message.
        message: String,
    },

    /// The OCSP responder failed.
    #[error("ocsp: {message}")]
    Ocsp {
        /// Error message.
        message: String,
    },

    /// A policy callback refused the operation.
    #[error("{message}")]
    Denied {
        /// The refusal reason.
        message: String,
    },

    /// The operation ran out of time.
    #[error("timed out: {message}")]
    Timeout {
        /// What timed out.
        message: String,
    },
}

impl UpstreamError {
    /// Whether this error means "the thing does not exist" rather than
    /// "something broke".
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }
}

/// Result type alias for upstream operations.
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// A plain chain-plus-key pair handed across an upstream boundary.
pub struct RawCertificate {
    /// Certificate chain, leaf first.
    pub chain: Vec<CertificateDer<'static>>,

    /// Private key for the leaf.
    pub key: PrivateKeyDer<'static>,
}

impl std::fmt::Debug for RawCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawCertificate")
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

/// Persistent storage of managed certificates.
#[async_trait]
pub trait ManagedCertificateStore: Send + Sync {
    /// Load and parse the managed certificate stored for `name`.
    ///
    /// The returned record must be flagged managed and carry its issuer
    /// key. A missing certificate is reported as
    /// [`UpstreamError::NotFound`] so the caller can fall back to a
    /// wildcard variant or to issuance.
    async fn load_certificate(&self, name: &str) -> UpstreamResult<CachedCertificate>;

    /// Whether storage holds certificate resources for `name` under any
    /// issuer. Used to distinguish "renew" from "obtain anew" when a
    /// cached record's backing files may have been cleaned up.
    async fn has_certificate_resources(&self, name: &str) -> bool;
}

/// The certificate authority driving issuance and renewal.
///
/// Both operations write their results through storage; the resolver
/// reloads from storage afterwards so the cache is the rendezvous for
/// waiting handshakes.
#[async_trait]
pub trait AcmeIssuer: Send + Sync {
    /// Obtain a brand-new certificate for `name` and persist it.
    async fn obtain_certificate(&self, name: &str) -> UpstreamResult<()>;

    /// Renew the certificate for `name` and persist it. With `force`
    /// set the current key material is considered compromised (revoked)
    /// and must be replaced regardless of time remaining.
    async fn renew_certificate(&self, name: &str, force: bool) -> UpstreamResult<()>;

    /// Fetch updated ACME renewal info for the certificate.
    async fn update_renewal_info(&self, cert: &CachedCertificate) -> UpstreamResult<RenewalInfo>;
}

/// Fetches fresh OCSP staples for cached certificates.
#[async_trait]
pub trait OcspStapler: Send + Sync {
    /// Fetch a fresh staple for the record's leaf.
    async fn staple(&self, cert: &CachedCertificate) -> UpstreamResult<OcspStaple>;
}

/// Challenge state looked up while answering a TLS-ALPN-01 handshake.
#[derive(Debug)]
pub struct ChallengeLookup {
    /// A certificate precomputed by the solver, to be served as-is.
    pub precomputed: Option<RawCertificate>,

    /// The key authorization for the pending challenge, used to
    /// synthesize the certificate when none was precomputed.
    pub key_authorization: String,

    /// Whether the challenge is being solved by another instance
    /// (distributed solving). Logged; no semantic difference.
    pub distributed: bool,
}

/// Registry of pending ACME challenges, possibly shared across
/// instances.
#[async_trait]
pub trait ChallengeRegistry: Send + Sync {
    /// Look up challenge state for the validated name.
    async fn challenge_info(&self, name: &str) -> UpstreamResult<ChallengeLookup>;
}

/// An external source of certificates consulted before this library
/// loads or obtains anything itself.
///
/// Managers are tried in configured order; the first one returning a
/// certificate wins. A manager returning `Ok(None)` simply has nothing
/// for this handshake.
#[async_trait]
pub trait CertificateManager: Send + Sync {
    /// Produce a certificate for the handshake, or decline.
    async fn get_certificate(
        &self,
        hello: &ClientHelloInfo,
    ) -> UpstreamResult<Option<RawCertificate>>;
}
