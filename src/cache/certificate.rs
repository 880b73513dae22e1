//! Certificate records and their derived metadata.

use std::io::Cursor;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use super::error::{CacheResult, CertificateError};

/// Public-key algorithm of a certificate's leaf, used for client
/// compatibility checks during selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// RSA keys (PKCS#1 and PSS signature schemes).
    Rsa,
    /// ECDSA keys on a NIST curve.
    Ecdsa,
    /// Ed25519 keys.
    Ed25519,
    /// Anything this crate does not recognize.
    Unknown,
}

/// Revocation status carried by a stapled OCSP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspStatus {
    /// The certificate is not known to be revoked.
    Good,
    /// The certificate has been revoked.
    Revoked,
    /// The responder does not know the certificate.
    Unknown,
}

/// A stapled OCSP response attached to a certificate record.
#[derive(Debug, Clone)]
pub struct OcspStaple {
    /// Revocation status reported by the responder.
    pub status: OcspStatus,

    /// When this response was produced.
    pub this_update: SystemTime,

    /// When the responder expects to have newer information.
    pub next_update: SystemTime,

    /// When the certificate was revoked, if it was.
    pub revoked_at: Option<SystemTime>,

    /// Raw DER of the response, as served in the handshake.
    pub der: Vec<u8>,
}

impl OcspStaple {
    /// Whether the staple is still fresh enough to serve.
    ///
    /// A response is considered stale once the current time passes the
    /// halfway point between `this_update` and `next_update`, which
    /// leaves the refresh plenty of margin before the response expires.
    #[must_use]
    pub fn fresh(&self) -> bool {
        let window = self
            .next_update
            .duration_since(self.this_update)
            .unwrap_or(Duration::ZERO);
        let refresh_at = self.this_update + window / 2;
        SystemTime::now() < refresh_at
    }

    /// Whether the staple reports the certificate as revoked.
    #[must_use]
    pub fn revoked(&self) -> bool {
        self.status == OcspStatus::Revoked
    }
}

/// ACME Renewal Information (ARI) for a managed certificate.
///
/// The window is the CA's suggested interval in which to renew; the
/// `retry_after` timestamp is when the ARI endpoint should be polled
/// again for updated guidance.
#[derive(Debug, Clone)]
pub struct RenewalInfo {
    /// Start of the CA-suggested renewal window.
    pub window_start: SystemTime,

    /// End of the CA-suggested renewal window.
    pub window_end: SystemTime,

    /// When to ask the CA for updated renewal info.
    pub retry_after: Option<SystemTime>,

    /// Optional URL explaining why the CA suggests this window.
    pub explanation_url: Option<String>,
}

impl RenewalInfo {
    /// Whether the renewal info itself should be re-fetched.
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        match self.retry_after {
            Some(at) => SystemTime::now() >= at,
            None => true,
        }
    }

    /// Whether the suggested renewal window has begun.
    #[must_use]
    pub fn window_started(&self) -> bool {
        SystemTime::now() >= self.window_start
    }
}

/// An immutable snapshot of a certificate chain plus derived metadata.
///
/// Records are replaced wholesale in the cache when anything changes;
/// the only field that is ever "updated" is the OCSP staple, and that
/// update composes a new record which overwrites the old map entry.
pub struct CachedCertificate {
    /// DNS names and IP addresses the leaf certifies, lower-cased.
    /// Wildcard names keep their literal `*` in the leftmost label.
    names: Vec<String>,

    /// Certificate chain, leaf first.
    chain: Vec<CertificateDer<'static>>,

    /// Private key for the leaf.
    key: PrivateKeyDer<'static>,

    /// Leaf validity window start.
    not_before: SystemTime,

    /// Leaf validity window end.
    not_after: SystemTime,

    /// Leaf public-key algorithm.
    key_algorithm: KeyAlgorithm,

    /// SHA-256 over the chain bytes, lower-hex. Primary cache key.
    hash: String,

    /// Identifier of the issuing authority, for managed certificates.
    issuer_key: Option<String>,

    /// Whether this library owns the certificate's lifecycle.
    managed: bool,

    /// Stapled OCSP response, if any.
    ocsp: Option<OcspStaple>,

    /// ACME renewal info, if fetched.
    ari: Option<RenewalInfo>,
}

impl std::fmt::Debug for CachedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedCertificate")
            .field("names", &self.names)
            .field("hash", &self.hash)
            .field("managed", &self.managed)
            .field("issuer_key", &self.issuer_key)
            .field("not_after", &self.not_after)
            .finish()
    }
}

impl Clone for CachedCertificate {
    fn clone(&self) -> Self {
        Self {
            names: self.names.clone(),
            chain: self.chain.clone(),
            key: self.key.clone_key(),
            not_before: self.not_before,
            not_after: self.not_after,
            key_algorithm: self.key_algorithm,
            hash: self.hash.clone(),
            issuer_key: self.issuer_key.clone(),
            managed: self.managed,
            ocsp: self.ocsp.clone(),
            ari: self.ari.clone(),
        }
    }
}

impl CachedCertificate {
    /// Build a record from a DER chain (leaf first) and its private key.
    ///
    /// Names, validity, and the key algorithm are derived from the leaf;
    /// the content hash is computed over the chain bytes. The record is
    /// unmanaged; see [`CachedCertificate::into_managed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the chain is empty or the leaf cannot be
    /// parsed, or if the leaf certifies no names.
    pub fn from_der(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> CacheResult<Self> {
        let leaf = chain.first().ok_or(CertificateError::EmptyChain)?;
        let parsed = parse_leaf(leaf.as_ref())?;
        if parsed.names.is_empty() {
            return Err(CertificateError::NoNames);
        }

        let hash = chain_hash(&chain);

        Ok(Self {
            names: parsed.names,
            chain,
            key,
            not_before: parsed.not_before,
            not_after: parsed.not_after,
            key_algorithm: parsed.key_algorithm,
            hash,
            issuer_key: None,
            managed: false,
            ocsp: None,
            ari: None,
        })
    }

    /// Build a record from PEM-encoded certificate and key material.
    ///
    /// # Errors
    ///
    /// Returns an error if the PEM cannot be decoded, contains no
    /// certificates or no key, or the leaf cannot be parsed.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> CacheResult<Self> {
        let chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut Cursor::new(cert_pem.as_bytes()))
                .collect::<Result<_, _>>()
                .map_err(|e| CertificateError::PemError {
                    message: e.to_string(),
                })?;

        let key = rustls_pemfile::private_key(&mut Cursor::new(key_pem.as_bytes()))
            .map_err(|e| CertificateError::PemError {
                message: e.to_string(),
            })?
            .ok_or(CertificateError::MissingKey)?;

        Self::from_der(chain, key)
    }

    /// Mark the record as managed by the given issuing authority.
    #[must_use]
    pub fn into_managed(mut self, issuer_key: impl Into<String>) -> Self {
        self.managed = true;
        self.issuer_key = Some(issuer_key.into());
        self
    }

    /// Return a copy of the record carrying a new OCSP staple.
    ///
    /// The hash is unchanged: the staple is not part of the chain bytes,
    /// so the new record overwrites the old cache entry in place.
    #[must_use]
    pub fn with_ocsp(&self, staple: OcspStaple) -> Self {
        let mut copy = self.clone();
        copy.ocsp = Some(staple);
        copy
    }

    /// Return a copy of the record carrying new renewal info.
    #[must_use]
    pub fn with_ari(&self, ari: RenewalInfo) -> Self {
        let mut copy = self.clone();
        copy.ari = Some(ari);
        copy
    }

    /// Names the leaf certifies.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The certificate chain, leaf first.
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// The private key.
    #[must_use]
    pub fn key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }

    /// Content hash over the chain bytes; the cache's primary key.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Issuing authority identifier, when managed.
    #[must_use]
    pub fn issuer_key(&self) -> Option<&str> {
        self.issuer_key.as_deref()
    }

    /// Whether this library owns the certificate's lifecycle.
    #[must_use]
    pub fn managed(&self) -> bool {
        self.managed
    }

    /// The stapled OCSP response, if any.
    #[must_use]
    pub fn ocsp(&self) -> Option<&OcspStaple> {
        self.ocsp.as_ref()
    }

    /// The ACME renewal info, if fetched.
    #[must_use]
    pub fn ari(&self) -> Option<&RenewalInfo> {
        self.ari.as_ref()
    }

    /// Leaf validity window start.
    #[must_use]
    pub fn not_before(&self) -> SystemTime {
        self.not_before
    }

    /// Leaf validity window end.
    #[must_use]
    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }

    /// When the certificate stops being usable.
    #[must_use]
    pub fn expires_at(&self) -> SystemTime {
        self.not_after
    }

    /// Leaf public-key algorithm.
    #[must_use]
    pub fn key_algorithm(&self) -> KeyAlgorithm {
        self.key_algorithm
    }

    /// Whether the leaf has expired.
    #[must_use]
    pub fn expired(&self) -> bool {
        SystemTime::now() >= self.not_after
    }

    /// Whether the leaf is currently within its validity window.
    #[must_use]
    pub fn currently_valid(&self) -> bool {
        let now = SystemTime::now();
        now >= self.not_before && now < self.not_after
    }

    /// Whether the stapled OCSP response reports revocation.
    #[must_use]
    pub fn revoked(&self) -> bool {
        self.ocsp.as_ref().is_some_and(OcspStaple::revoked)
    }

    /// Whether the certificate should be renewed.
    ///
    /// When `include_ari` is set and renewal info is present, an open
    /// ARI window forces renewal. Otherwise the certificate needs
    /// renewal once its remaining lifetime drops below `window_ratio`
    /// of the total validity period.
    #[must_use]
    pub fn needs_renewal(&self, window_ratio: f64, include_ari: bool) -> bool {
        if include_ari {
            if let Some(ari) = &self.ari {
                if ari.window_started() {
                    return true;
                }
            }
        }

        let lifetime = match self.not_after.duration_since(self.not_before) {
            Ok(d) => d,
            Err(_) => return true,
        };
        let remaining = self
            .not_after
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);

        remaining.as_secs_f64() <= lifetime.as_secs_f64() * window_ratio
    }

    /// Whether this record covers `name` by exact or single-label
    /// wildcard match.
    #[must_use]
    pub fn covers(&self, name: &str) -> bool {
        for cert_name in &self.names {
            if cert_name == name {
                return true;
            }
            // *.example.com matches www.example.com but not example.com
            // or a.b.example.com (single label only, RFC 6125).
            if let Some(base) = cert_name.strip_prefix("*.") {
                if let Some(label) = name
                    .strip_suffix(base)
                    .and_then(|prefix| prefix.strip_suffix('.'))
                {
                    if !label.is_empty() && !label.contains('.') {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Build a rustls `CertifiedKey` from this record.
    ///
    /// # Errors
    ///
    /// Returns an error if the private key is not supported by the
    /// crypto provider.
    pub fn to_certified_key(
        &self,
    ) -> Result<tokio_rustls::rustls::sign::CertifiedKey, tokio_rustls::rustls::Error> {
        use tokio_rustls::rustls::crypto::aws_lc_rs::sign::any_supported_type;
        use tokio_rustls::rustls::sign::CertifiedKey;

        let signing_key = any_supported_type(&self.key)?;
        Ok(CertifiedKey::new(self.chain.clone(), signing_key))
    }
}

struct ParsedLeaf {
    names: Vec<String>,
    not_before: SystemTime,
    not_after: SystemTime,
    key_algorithm: KeyAlgorithm,
}

fn parse_leaf(der: &[u8]) -> CacheResult<ParsedLeaf> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|e| CertificateError::ParseError {
        message: e.to_string(),
    })?;

    let mut names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for general_name in &san.value.general_names {
            match general_name {
                GeneralName::DNSName(dns) => names.push(dns.to_ascii_lowercase()),
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_bytes(bytes.as_ref()) {
                        names.push(ip);
                    }
                },
                _ => {},
            }
        }
    }
    if names.is_empty() {
        if let Some(cn) = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
        {
            names.push(cn.to_ascii_lowercase());
        }
    }

    let key_algorithm = match cert.public_key().parsed() {
        Ok(PublicKey::RSA(_)) => KeyAlgorithm::Rsa,
        Ok(PublicKey::EC(_)) => KeyAlgorithm::Ecdsa,
        _ => {
            if cert.public_key().algorithm.algorithm.to_id_string() == "1.3.101.112" {
                KeyAlgorithm::Ed25519
            } else {
                KeyAlgorithm::Unknown
            }
        },
    };

    Ok(ParsedLeaf {
        names,
        not_before: asn1_to_system_time(&cert.validity().not_before),
        not_after: asn1_to_system_time(&cert.validity().not_after),
        key_algorithm,
    })
}

fn asn1_to_system_time(t: &ASN1Time) -> SystemTime {
    let ts = t.timestamp();
    if ts >= 0 {
        UNIX_EPOCH + Duration::from_secs(ts as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(ts.unsigned_abs())
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(std::net::Ipv4Addr::from(octets).to_string())
        },
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(std::net::Ipv6Addr::from(octets).to_string())
        },
        _ => None,
    }
}

/// SHA-256 over the concatenated chain bytes, lower-hex.
fn chain_hash(chain: &[CertificateDer<'static>]) -> String {
    let mut hasher = Sha256::new();
    for cert in chain {
        hasher.update(cert.as_ref());
    }
    let digest = hasher.finalize();
    digest.iter().fold(
        String::with_capacity(digest.len() * 2),
        |mut out, byte| {
            use std::fmt::Write;
            let _ = write!(out, "{byte:02x}");
            out
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staple(status: OcspStatus, this_update: SystemTime, next_update: SystemTime) -> OcspStaple {
        OcspStaple {
            status,
            this_update,
            next_update,
            revoked_at: None,
            der: Vec::new(),
        }
    }

    #[test]
    fn test_ocsp_freshness_window() {
        let now = SystemTime::now();

        // Issued just now, valid for a week: fresh.
        let fresh = staple(
            OcspStatus::Good,
            now,
            now + Duration::from_secs(7 * 24 * 3600),
        );
        assert!(fresh.fresh());

        // Past the halfway point: stale.
        let stale = staple(
            OcspStatus::Good,
            now - Duration::from_secs(5 * 24 * 3600),
            now + Duration::from_secs(24 * 3600),
        );
        assert!(!stale.fresh());
    }

    #[test]
    fn test_renewal_info_refresh() {
        let now = SystemTime::now();
        let mut ari = RenewalInfo {
            window_start: now + Duration::from_secs(3600),
            window_end: now + Duration::from_secs(7200),
            retry_after: Some(now + Duration::from_secs(600)),
            explanation_url: None,
        };

        assert!(!ari.needs_refresh());
        assert!(!ari.window_started());

        ari.retry_after = Some(now - Duration::from_secs(1));
        assert!(ari.needs_refresh());

        ari.retry_after = None;
        assert!(ari.needs_refresh());

        ari.window_start = now - Duration::from_secs(1);
        assert!(ari.window_started());
    }

    #[test]
    fn test_chain_hash_is_pure_function_of_bytes() {
        let a = vec![CertificateDer::from(vec![1u8, 2, 3])];
        let b = vec![CertificateDer::from(vec![1u8, 2, 3])];
        let c = vec![CertificateDer::from(vec![9u8, 9, 9])];

        assert_eq!(chain_hash(&a), chain_hash(&b));
        assert_ne!(chain_hash(&a), chain_hash(&c));
        assert_eq!(chain_hash(&a).len(), 64);
    }

    #[test]
    fn test_from_der_rejects_empty_chain() {
        let key = PrivateKeyDer::Pkcs8(vec![0u8; 8].into());
        let err = CachedCertificate::from_der(Vec::new(), key).unwrap_err();
        assert!(matches!(err, CertificateError::EmptyChain));
    }

    #[test]
    fn test_record_derives_metadata_from_leaf() {
        let record = crate::cache::test_support::self_signed(&["Example.COM", "www.example.com"]);

        assert_eq!(record.names(), ["example.com", "www.example.com"]);
        assert!(record.currently_valid());
        assert!(!record.expired());
        assert!(!record.managed());
        assert_eq!(record.key_algorithm(), KeyAlgorithm::Ecdsa);

        let managed = record.clone().into_managed("acme-staging");
        assert!(managed.managed());
        assert_eq!(managed.issuer_key(), Some("acme-staging"));
        // Managing a record does not change its content hash.
        assert_eq!(managed.hash(), record.hash());
    }

    #[test]
    fn test_wildcard_coverage_is_single_label() {
        let record = crate::cache::test_support::self_signed(&["*.example.com"]);

        assert!(record.covers("www.example.com"));
        assert!(record.covers("api.example.com"));
        assert!(!record.covers("example.com"));
        assert!(!record.covers("a.b.example.com"));
    }

    #[test]
    fn test_pem_and_der_construction_agree() {
        let mut params =
            rcgen::CertificateParams::new(vec!["example.com".to_string()]).unwrap();
        let now = ::time::OffsetDateTime::now_utc();
        params.not_before = now - ::time::Duration::hours(1);
        params.not_after = now + ::time::Duration::days(30);
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let from_der = CachedCertificate::from_der(
            vec![cert.der().clone()],
            PrivateKeyDer::Pkcs8(key_pair.serialize_der().into()),
        )
        .unwrap();
        let from_pem =
            CachedCertificate::from_pem(&cert.pem(), &key_pair.serialize_pem()).unwrap();

        assert_eq!(from_der.hash(), from_pem.hash());
        assert_eq!(from_der.names(), from_pem.names());
        assert_eq!(from_der.not_after(), from_pem.not_after());
    }

    #[test]
    fn test_certified_key_conversion() {
        let record = crate::cache::test_support::self_signed(&["example.com"]);
        let certified = record.to_certified_key().expect("supported key type");
        assert_eq!(certified.cert.len(), 1);
    }
}
