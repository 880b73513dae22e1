//! Handshake resolution error types.

use thiserror::Error;

use crate::upstream::UpstreamError;

/// Errors surfaced to the TLS library from certificate resolution.
///
/// Wherever an error still allows serving a usable (unexpired,
/// non-revoked) certificate, the resolver prefers to serve it; these
/// variants are the cases where the handshake cannot proceed.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// An event handler refused the handshake.
    #[error("handshake aborted by event handler: {reason}")]
    EventAborted {
        /// The handler's error message.
        reason: String,
    },

    /// The server name could not be normalized, or does not qualify for
    /// a certificate.
    #[error("invalid server name '{name}': {message}")]
    InvalidName {
        /// The offending name.
        name: String,
        /// What was wrong with it.
        message: String,
    },

    /// The on-demand policy refused issuance for this name.
    #[error("certificate is not allowed for server name {name}: {reason}")]
    PolicyDenied {
        /// The denied name.
        name: String,
        /// Why it was denied.
        reason: String,
    },

    /// No matching certificate in cache or storage, and no way to
    /// obtain one.
    #[error("no certificate available for '{name}'")]
    NoCertificate {
        /// The unmatched name.
        name: String,
    },

    /// Waiting on another task's in-flight operation exceeded the
    /// safety timeout. The in-flight owner keeps going.
    #[error("timed out waiting to {operation} certificate for {name}")]
    WaitTimeout {
        /// The name being waited on.
        name: String,
        /// The in-flight operation kind ("load", "obtain", "renew").
        operation: &'static str,
    },

    /// The caller's handshake context ended before resolution finished.
    #[error("handshake cancelled: {message}")]
    Cancelled {
        /// Details of the cancellation.
        message: String,
    },

    /// An external collaborator (manager, storage, CA, OCSP responder)
    /// failed in a way the resolver could not absorb.
    #[error("{context}: {source}")]
    Upstream {
        /// What the resolver was doing.
        context: String,
        /// The underlying failure.
        #[source]
        source: UpstreamError,
    },

    /// A TLS-ALPN-01 challenge certificate could not be produced.
    #[error("making TLS-ALPN challenge certificate: {message}")]
    ChallengeSolveFailed {
        /// Error message.
        message: String,
    },
}

impl HandshakeError {
    pub(crate) fn upstream(context: impl Into<String>, source: UpstreamError) -> Self {
        Self::Upstream {
            context: context.into(),
            source,
        }
    }
}

/// Result type alias for handshake resolution.
pub type HandshakeResult<T> = Result<T, HandshakeError>;
