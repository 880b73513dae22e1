//! TLS-ALPN-01 challenge certificates.
//!
//! During a TLS-ALPN-01 validation (RFC 8737) the ACME server opens a
//! TLS handshake with ALPN `acme-tls/1` and SNI set to the name being
//! validated, and expects a self-signed certificate whose critical
//! `acmeIdentifier` extension carries the SHA-256 digest of the key
//! authorization.

use sha2::{Digest, Sha256};
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tracing::info;

use crate::upstream::RawCertificate;

use super::error::{HandshakeError, HandshakeResult};
use super::hello::ClientHelloInfo;
use super::resolver::{CertificateResolver, ResolvedCertificate};

/// The reserved ALPN protocol identifier for TLS-ALPN-01 (RFC 8737).
pub const ACME_TLS_ALPN_PROTOCOL: &str = "acme-tls/1";

impl CertificateResolver {
    /// Produce the certificate answering a TLS-ALPN-01 handshake.
    ///
    /// The challenge registry may hold a precomputed certificate (the
    /// usual case for locally-solved challenges, and it spares
    /// re-creating one for every validation attempt); otherwise the
    /// solution certificate is synthesized from the key authorization.
    pub(crate) async fn tls_alpn_challenge_cert(
        &self,
        hello: &ClientHelloInfo,
    ) -> HandshakeResult<ResolvedCertificate> {
        let registry = self.challenges().ok_or_else(|| {
            HandshakeError::ChallengeSolveFailed {
                message: format!(
                    "no challenge registry configured to answer validation of {}",
                    hello.server_name
                ),
            }
        })?;

        let lookup = registry
            .challenge_info(&hello.server_name)
            .await
            .map_err(|e| {
                HandshakeError::upstream(
                    format!("looking up tls-alpn challenge for {}", hello.server_name),
                    e,
                )
            })?;

        info!(
            server_name = %hello.server_name,
            challenge = "tls-alpn-01",
            distributed = lookup.distributed,
            "serving key authentication certificate"
        );

        if let Some(precomputed) = lookup.precomputed {
            return Ok(ResolvedCertificate::Challenge(precomputed));
        }

        let raw = synthesize_challenge_cert(&hello.server_name, &lookup.key_authorization)
            .map_err(|e| HandshakeError::ChallengeSolveFailed {
                message: e.to_string(),
            })?;

        Ok(ResolvedCertificate::Challenge(raw))
    }
}

/// Build the self-signed solution certificate for a TLS-ALPN-01
/// challenge: SAN = the validated name, plus a critical acmeIdentifier
/// extension containing SHA-256(key authorization).
pub(crate) fn synthesize_challenge_cert(
    server_name: &str,
    key_authorization: &str,
) -> Result<RawCertificate, rcgen::Error> {
    let digest = Sha256::digest(key_authorization.as_bytes());

    let mut params = rcgen::CertificateParams::new(vec![server_name.to_string()])?;
    params.custom_extensions = vec![rcgen::CustomExtension::new_acme_identifier(digest.as_slice())];

    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    Ok(RawCertificate {
        chain: vec![cert.der().clone()],
        key: PrivateKeyDer::Pkcs8(key_pair.serialize_der().into()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    const ACME_IDENTIFIER_OID: &str = "1.3.6.1.5.5.7.1.31";

    #[test]
    fn test_challenge_cert_carries_key_authorization_digest() {
        let raw = synthesize_challenge_cert("example.com", "token.thumbprint").unwrap();
        assert_eq!(raw.chain.len(), 1);

        let (_, cert) = X509Certificate::from_der(raw.chain[0].as_ref()).unwrap();

        let acme_ext = cert
            .extensions()
            .iter()
            .find(|ext| ext.oid.to_id_string() == ACME_IDENTIFIER_OID)
            .expect("acmeIdentifier extension present");
        assert!(acme_ext.critical);

        let digest = Sha256::digest("token.thumbprint".as_bytes());
        // Extension value is an OCTET STRING wrapping the 32-byte digest.
        assert!(acme_ext
            .value
            .windows(digest.len())
            .any(|w| w == digest.as_slice()));
    }

    #[test]
    fn test_challenge_cert_names_the_validated_domain() {
        let raw = synthesize_challenge_cert("x.example.com", "auth").unwrap();
        let (_, cert) = X509Certificate::from_der(raw.chain[0].as_ref()).unwrap();

        let san = cert
            .subject_alternative_name()
            .unwrap()
            .expect("SAN present");
        assert!(san.value.general_names.iter().any(
            |name| matches!(name, GeneralName::DNSName(dns) if *dns == "x.example.com")
        ));
    }

    #[test]
    fn test_different_authorizations_differ() {
        let a = synthesize_challenge_cert("example.com", "auth-a").unwrap();
        let b = synthesize_challenge_cert("example.com", "auth-b").unwrap();
        assert_ne!(a.chain[0].as_ref(), b.chain[0].as_ref());
    }
}
