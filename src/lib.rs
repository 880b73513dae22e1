//! # autotls
//!
//! Handshake-time certificate resolution for automatic TLS.
//!
//! Given a TLS client hello, the resolver decides — under heavy
//! concurrency — whether to serve a cached certificate, load one from
//! persistent storage, obtain or renew one through an external
//! certificate authority, refresh a stapled OCSP response, or answer a
//! TLS-ALPN-01 challenge, without holding any single handshake open
//! past its budget and without stampeding upstreams when many
//! handshakes demand the same name at once.
//!
//! ## Architecture
//!
//! - [`cache`] holds immutable certificate records keyed by content
//!   hash, with a name index covering wildcards, and hosts the per-name
//!   singleflight tables.
//! - [`handshake`] is the resolution pipeline: the
//!   [`handshake::CertificateResolver`] entry point, name
//!   normalization, cache lookup and selection, the on-demand policy
//!   gate, the issuance/renewal driver, and handshake-triggered
//!   maintenance.
//! - [`upstream`] defines the traits the surrounding system implements:
//!   storage, the ACME issuer, the OCSP stapler, the challenge
//!   registry, and external certificate managers.
//! - [`events`] lets deployments observe (and veto) resolutions.
//!
//! ## Example
//!
//! ```ignore
//! use autotls::handshake::{ClientHelloInfo, OnDemandConfig, ResolverBuilder, ResolverConfig};
//!
//! let resolver = ResolverBuilder::new()
//!     .config(ResolverConfig::new().with_on_demand(
//!         OnDemandConfig::new().with_allowlist(["example.com"]),
//!     ))
//!     .storage(storage)
//!     .issuer(issuer)
//!     .build();
//!
//! let resolved = resolver
//!     .get_certificate(&ClientHelloInfo::new("example.com"))
//!     .await?;
//! let certified_key = resolved.to_certified_key()?;
//! ```

pub mod cache;
pub mod events;
pub mod handshake;
pub mod upstream;
