//! Server-name normalization and qualification.

use std::net::{IpAddr, SocketAddr};

use super::config::ResolverConfig;
use super::error::{HandshakeError, HandshakeResult};
use super::hello::ClientHelloInfo;

/// Cleaned form of a server name used for cache keys and comparisons:
/// trimmed and lower-cased. Idempotent.
#[must_use]
pub fn normalized_name(server_name: &str) -> String {
    server_name.trim().to_ascii_lowercase()
}

/// Resolve the name a handshake is asking about.
///
/// IDNs are converted to punycode with the IDNA lookup profile (which
/// rejects wildcard characters; they never belong in SNI). An empty
/// SNI falls back to the configured default server name, then to the
/// connection's local IP address.
///
/// # Errors
///
/// Returns [`HandshakeError::InvalidName`] if IDNA conversion fails.
pub fn name_from_hello(
    hello: &ClientHelloInfo,
    config: &ResolverConfig,
) -> HandshakeResult<String> {
    let trimmed = hello.server_name.trim();
    if !trimmed.is_empty() {
        // Not all clients pre-convert IDNs; the lookup profile keeps
        // the conversion 1:1 so equal names stay equal.
        let name =
            idna::domain_to_ascii_strict(trimmed).map_err(|e| HandshakeError::InvalidName {
                name: trimmed.to_string(),
                message: e.to_string(),
            })?;
        if !name.is_empty() {
            return Ok(name);
        }
    }

    if let Some(default) = &config.default_server_name {
        return Ok(normalized_name(default));
    }

    Ok(hello.local_addr.map(local_ip).unwrap_or_default())
}

/// Host portion of an address, with any IPv6 scope ID stripped
/// (RFC 4007 zones are useless for certificate lookup).
#[must_use]
pub fn local_ip(addr: SocketAddr) -> String {
    let ip = addr.ip().to_string();
    match ip.split_once('%') {
        Some((host, _zone)) => host.to_string(),
        None => ip,
    }
}

/// Whether a subject name is syntactically eligible for a certificate.
///
/// Rejects wildcards (never valid in SNI), malformed label structure,
/// and reserved internal forms that no public CA will issue for.
#[must_use]
pub fn subject_qualifies_for_cert(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    if name.contains('*') {
        return false;
    }
    if name.parse::<IpAddr>().is_ok() {
        return true;
    }
    if is_reserved_name(name) {
        return false;
    }

    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

fn is_reserved_name(name: &str) -> bool {
    const RESERVED_SUFFIXES: &[&str] = &[".localhost", ".local", ".internal", ".home.arpa"];

    name == "localhost"
        || RESERVED_SUFFIXES
            .iter()
            .any(|suffix| name.ends_with(suffix))
}

/// Rewrite a name with its leftmost label replaced by `*`, the wildcard
/// form tried when storage has no exact-name certificate.
#[must_use]
pub fn wildcard_variant(name: &str) -> String {
    match name.split_once('.') {
        Some((_, rest)) => format!("*.{rest}"),
        None => name.to_string(),
    }
}
