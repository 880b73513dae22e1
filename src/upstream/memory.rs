//! In-memory certificate storage (for testing and simple deployments).

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use super::{ManagedCertificateStore, UpstreamError, UpstreamResult};
use crate::cache::CachedCertificate;

/// Certificate store backed by a process-local map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredEntry>>,
}

struct StoredEntry {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    issuer_key: String,
}

impl std::fmt::Debug for StoredEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredEntry")
            .field("chain_len", &self.chain.len())
            .field("issuer_key", &self.issuer_key)
            .finish()
    }
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store certificate material under `name`.
    pub fn insert(
        &self,
        name: impl Into<String>,
        issuer_key: impl Into<String>,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) {
        self.write().insert(
            name.into(),
            StoredEntry {
                chain,
                key,
                issuer_key: issuer_key.into(),
            },
        );
    }

    /// Remove the material stored under `name`.
    pub fn remove(&self, name: &str) {
        self.write().remove(name);
    }

    /// Names with stored material.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, StoredEntry>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, StoredEntry>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ManagedCertificateStore for MemoryStore {
    async fn load_certificate(&self, name: &str) -> UpstreamResult<CachedCertificate> {
        let (chain, key, issuer_key) = {
            let entries = self.read();
            let entry = entries.get(name).ok_or_else(|| UpstreamError::NotFound {
                subject: name.to_string(),
            })?;
            (
                entry.chain.clone(),
                entry.key.clone_key(),
                entry.issuer_key.clone(),
            )
        };

        let record =
            CachedCertificate::from_der(chain, key).map_err(|e| UpstreamError::Storage {
                message: format!("parsing stored certificate for {name}: {e}"),
            })?;

        Ok(record.into_managed(issuer_key))
    }

    async fn has_certificate_resources(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::self_signed;

    fn stored_material() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let record = self_signed(&["example.com"]);
        (record.chain().to_vec(), record.key().clone_key())
    }

    #[tokio::test]
    async fn test_load_round_trips_through_parsing() {
        let store = MemoryStore::new();
        let (chain, key) = stored_material();
        store.insert("example.com", "test-ca", chain, key);

        let record = store.load_certificate("example.com").await.unwrap();
        assert!(record.managed());
        assert_eq!(record.issuer_key(), Some("test-ca"));
        assert_eq!(record.names(), ["example.com"]);
    }

    #[tokio::test]
    async fn test_missing_name_is_not_found() {
        let store = MemoryStore::new();
        let err = store.load_certificate("missing.example.com").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.has_certificate_resources("missing.example.com").await);
    }
}
