//! Helpers for minting real self-signed certificates in unit tests.

use rcgen::{CertificateParams, KeyPair};
use tokio_rustls::rustls::pki_types::PrivateKeyDer;

use super::certificate::CachedCertificate;

/// Generate a self-signed certificate record for the given names,
/// valid from an hour ago until 30 days from now.
pub(crate) fn self_signed<S: AsRef<str>>(names: &[S]) -> CachedCertificate {
    self_signed_with_validity(names, time::Duration::hours(-1), time::Duration::days(30))
}

/// Generate a self-signed certificate record whose validity window is
/// offset from now by the given amounts.
pub(crate) fn self_signed_with_validity<S: AsRef<str>>(
    names: &[S],
    not_before_offset: time::Duration,
    not_after_offset: time::Duration,
) -> CachedCertificate {
    let names: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
    let mut params = CertificateParams::new(names).expect("valid subject names");
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now + not_before_offset;
    params.not_after = now + not_after_offset;

    let key_pair = KeyPair::generate().expect("key generation");
    let cert = params.self_signed(&key_pair).expect("self-signed cert");

    CachedCertificate::from_der(
        vec![cert.der().clone()],
        PrivateKeyDer::Pkcs8(key_pair.serialize_der().into()),
    )
    .expect("record from generated cert")
}
