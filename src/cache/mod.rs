//! Certificate records and the process-wide in-memory cache.
//!
//! The cache maps a content hash to an immutable certificate record and
//! keeps an auxiliary index from certified name (wildcards stored
//! literally) to the set of matching hashes. It also hosts the two
//! singleflight wait tables that collapse concurrent loads and
//! obtain/renew operations per name.

mod certificate;
mod error;
mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use certificate::{
    CachedCertificate, KeyAlgorithm, OcspStaple, OcspStatus, RenewalInfo,
};
pub use error::{CacheResult, CertificateError};
pub use store::{CacheOptions, CertificateCache};
