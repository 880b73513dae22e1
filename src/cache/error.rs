//! Certificate cache error types.

use thiserror::Error;

/// Errors that can occur while building or storing certificate records.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// The certificate chain was empty.
    #[error("no certificates in chain")]
    EmptyChain,

    /// The leaf certificate could not be parsed.
    #[error("parsing leaf certificate: {message}")]
    ParseError {
        /// Error message.
        message: String,
    },

    /// The leaf certifies no usable names.
    #[error("leaf certificate has no subject names")]
    NoNames,

    /// PEM decoding failed.
    #[error("decoding PEM: {message}")]
    PemError {
        /// Error message.
        message: String,
    },

    /// No private key was found in the PEM input.
    #[error("no private key found")]
    MissingKey,
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CertificateError>;
