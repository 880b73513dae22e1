//! Serializable projection of a TLS client hello.

use std::net::SocketAddr;

use serde::Serialize;

use crate::cache::{CachedCertificate, KeyAlgorithm};

use super::challenge::ACME_TLS_ALPN_PROTOCOL;

/// The data of a client hello, without any live connection attached.
///
/// This is the resolver's input and also the payload serialized into
/// the `tls_get_certificate` event; only address values are kept from
/// the connection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientHelloInfo {
    /// Raw SNI value as sent by the client.
    pub server_name: String,

    /// ALPN protocol identifiers offered by the client.
    pub alpn: Vec<String>,

    /// Offered cipher suites (IANA code points).
    pub cipher_suites: Vec<u16>,

    /// Offered signature schemes (IANA code points).
    pub signature_schemes: Vec<u16>,

    /// Offered TLS protocol versions.
    pub supported_versions: Vec<u16>,

    /// Offered named groups / curves.
    pub supported_groups: Vec<u16>,

    /// The client's address, if the connection is known.
    pub remote_addr: Option<SocketAddr>,

    /// The server's local address, if the connection is known.
    pub local_addr: Option<SocketAddr>,
}

impl ClientHelloInfo {
    /// Create a hello for the given server name with no other data.
    #[must_use]
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            ..Self::default()
        }
    }

    /// Set the ALPN protocol list.
    #[must_use]
    pub fn with_alpn(mut self, alpn: Vec<String>) -> Self {
        self.alpn = alpn;
        self
    }

    /// Set the offered signature schemes.
    #[must_use]
    pub fn with_signature_schemes(mut self, schemes: Vec<u16>) -> Self {
        self.signature_schemes = schemes;
        self
    }

    /// Set the connection addresses.
    #[must_use]
    pub fn with_addrs(mut self, remote: SocketAddr, local: SocketAddr) -> Self {
        self.remote_addr = Some(remote);
        self.local_addr = Some(local);
        self
    }

    /// Whether this hello is a TLS-ALPN-01 challenge handshake: SNI is
    /// present and `acme-tls/1` is the single offered protocol
    /// (RFC 8737).
    #[must_use]
    pub fn is_tls_alpn_challenge(&self) -> bool {
        !self.server_name.is_empty()
            && self.alpn.len() == 1
            && self.alpn[0] == ACME_TLS_ALPN_PROTOCOL
    }

    /// Whether the client can use the given certificate.
    ///
    /// A hello that offers no signature schemes is assumed compatible;
    /// otherwise at least one offered scheme must match the leaf's
    /// public-key algorithm.
    #[must_use]
    pub fn supports_certificate(&self, cert: &CachedCertificate) -> bool {
        if self.signature_schemes.is_empty() {
            return true;
        }
        self.signature_schemes
            .iter()
            .any(|&scheme| scheme_matches_key(scheme, cert.key_algorithm()))
    }
}

/// Map a TLS signature scheme code point to the key algorithm it signs
/// with.
fn scheme_matches_key(scheme: u16, algorithm: KeyAlgorithm) -> bool {
    match algorithm {
        KeyAlgorithm::Rsa => matches!(
            scheme,
            // rsa_pkcs1_sha{1,256,384,512}, rsa_pss_rsae_sha{256,384,512}
            0x0201 | 0x0401 | 0x0501 | 0x0601 | 0x0804 | 0x0805 | 0x0806
        ),
        KeyAlgorithm::Ecdsa => matches!(
            scheme,
            // ecdsa_sha1, ecdsa_secp{256,384,521}r1
            0x0203 | 0x0403 | 0x0503 | 0x0603
        ),
        KeyAlgorithm::Ed25519 => scheme == 0x0807,
        KeyAlgorithm::Unknown => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::self_signed;

    #[test]
    fn test_alpn_challenge_predicate() {
        let hello = ClientHelloInfo::new("example.com")
            .with_alpn(vec![ACME_TLS_ALPN_PROTOCOL.to_string()]);
        assert!(hello.is_tls_alpn_challenge());

        // Empty SNI never matches.
        let hello = ClientHelloInfo::new("").with_alpn(vec![ACME_TLS_ALPN_PROTOCOL.to_string()]);
        assert!(!hello.is_tls_alpn_challenge());

        // More than one protocol never matches.
        let hello = ClientHelloInfo::new("example.com").with_alpn(vec![
            ACME_TLS_ALPN_PROTOCOL.to_string(),
            "h2".to_string(),
        ]);
        assert!(!hello.is_tls_alpn_challenge());

        // A normal handshake never matches.
        let hello = ClientHelloInfo::new("example.com").with_alpn(vec!["h2".to_string()]);
        assert!(!hello.is_tls_alpn_challenge());
    }

    #[test]
    fn test_supports_certificate_by_signature_scheme() {
        // Generated test certs use ECDSA keys.
        let cert = self_signed(&["example.com"]);

        let no_schemes = ClientHelloInfo::new("example.com");
        assert!(no_schemes.supports_certificate(&cert));

        let ecdsa_client =
            ClientHelloInfo::new("example.com").with_signature_schemes(vec![0x0403]);
        assert!(ecdsa_client.supports_certificate(&cert));

        let rsa_only_client =
            ClientHelloInfo::new("example.com").with_signature_schemes(vec![0x0401, 0x0804]);
        assert!(!rsa_only_client.supports_certificate(&cert));
    }

    #[test]
    fn test_hello_serializes_without_connection_state() {
        let hello = ClientHelloInfo::new("example.com").with_addrs(
            "203.0.113.7:52801".parse().unwrap(),
            "192.0.2.1:443".parse().unwrap(),
        );
        let value = serde_json::to_value(&hello).unwrap();
        assert_eq!(value["server_name"], "example.com");
        assert_eq!(value["local_addr"], "192.0.2.1:443");
    }
}
