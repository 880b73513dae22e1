//! Process-wide in-memory certificate cache.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use super::certificate::CachedCertificate;
use crate::handshake::singleflight::WaitTable;

/// Tuning options for the certificate cache.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Maximum number of records the cache holds; 0 means unlimited.
    pub capacity: usize,

    /// Fill ratio at which the cache counts as "almost full" and
    /// handshakes start loading from storage even without on-demand,
    /// to cover records evicted from a (nearly) full cache.
    pub almost_full_ratio: f64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            almost_full_ratio: 0.9,
        }
    }
}

/// In-memory store mapping content hashes to certificate records, with
/// an auxiliary index from certified name to matching hashes.
///
/// The cache exclusively owns its records: readers copy records out
/// under the shared lock, and mutations replace whole map entries under
/// the exclusive lock. Wildcard names are indexed with their literal
/// `*` in the leftmost label.
#[derive(Debug, Default)]
pub struct CertificateCache {
    inner: RwLock<CacheInner>,
    options: RwLock<CacheOptions>,

    /// Coordinates at-most-one storage load per name.
    pub(crate) load_waiters: WaitTable,

    /// Coordinates at-most-one CA issuance or renewal per name.
    pub(crate) obtain_waiters: WaitTable,
}

#[derive(Debug, Default)]
struct CacheInner {
    certs: HashMap<String, CachedCertificate>,
    by_name: HashMap<String, Vec<String>>,
}

impl CertificateCache {
    /// Create an empty cache with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty cache with the given options.
    #[must_use]
    pub fn with_options(options: CacheOptions) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            options: RwLock::new(options),
            load_waiters: WaitTable::new(),
            obtain_waiters: WaitTable::new(),
        }
    }

    /// Insert a record, keyed by its content hash.
    ///
    /// When the cache is at capacity an arbitrary record is evicted
    /// first; real eviction policy belongs to the surrounding system,
    /// and every caller must tolerate records disappearing between
    /// operations.
    pub fn insert(&self, cert: CachedCertificate) {
        let capacity = self.read_options().capacity;
        let mut inner = self.write_inner();

        if capacity > 0 && inner.certs.len() >= capacity && !inner.certs.contains_key(cert.hash()) {
            if let Some(victim) = inner.certs.keys().next().cloned() {
                warn!(hash = %victim, "certificate cache at capacity; evicting a record");
                remove_locked(&mut inner, &victim);
            }
        }

        insert_locked(&mut inner, cert);
    }

    /// Remove the record with the given hash, if present.
    pub fn remove(&self, hash: &str) {
        let mut inner = self.write_inner();
        remove_locked(&mut inner, hash);
    }

    /// Replace the record keyed by `old_hash` with a new record.
    ///
    /// The removal and insertion happen under one write lock so no
    /// reader observes the name going dark in between.
    pub fn replace(&self, old_hash: &str, new_cert: CachedCertificate) {
        let mut inner = self.write_inner();
        remove_locked(&mut inner, old_hash);
        insert_locked(&mut inner, new_cert);
    }

    /// Overwrite the record with `cert`'s hash in place, if it is still
    /// cached. Used for OCSP staple refreshes, where the hash (and the
    /// name index) are unchanged.
    pub fn update(&self, cert: CachedCertificate) {
        let mut inner = self.write_inner();
        if inner.certs.contains_key(cert.hash()) {
            inner.certs.insert(cert.hash().to_string(), cert);
        } else {
            debug!(hash = %cert.hash(), "record evicted before update; skipping");
        }
    }

    /// Copy out the record with the given hash.
    #[must_use]
    pub fn get(&self, hash: &str) -> Option<CachedCertificate> {
        self.read_inner().certs.get(hash).cloned()
    }

    /// Copy out all records indexed under `name` (exact index key;
    /// wildcard keys are matched by passing the literal wildcard form).
    #[must_use]
    pub fn all_matching(&self, name: &str) -> Vec<CachedCertificate> {
        let inner = self.read_inner();
        inner
            .by_name
            .get(name)
            .map(|hashes| {
                hashes
                    .iter()
                    .filter_map(|h| inner.certs.get(h).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Copy out every record in the cache.
    #[must_use]
    pub fn all_certs(&self) -> Vec<CachedCertificate> {
        self.read_inner().certs.values().cloned().collect()
    }

    /// Number of cached records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_inner().certs.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the cache has reached its almost-full threshold.
    ///
    /// Always false for an unlimited cache.
    #[must_use]
    pub fn almost_full(&self) -> bool {
        let options = self.read_options();
        if options.capacity == 0 {
            return false;
        }
        let size = self.len();
        size as f64 >= options.capacity as f64 * options.almost_full_ratio
    }

    /// Copy of the current options.
    #[must_use]
    pub fn options(&self) -> CacheOptions {
        self.read_options().clone()
    }

    /// Replace the cache options.
    pub fn set_options(&self, options: CacheOptions) {
        *self
            .options
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = options;
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, CacheInner> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, CacheInner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_options(&self) -> RwLockReadGuard<'_, CacheOptions> {
        self.options
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn insert_locked(inner: &mut CacheInner, cert: CachedCertificate) {
    let hash = cert.hash().to_string();
    for name in cert.names() {
        let hashes = inner.by_name.entry(name.clone()).or_default();
        if !hashes.contains(&hash) {
            hashes.push(hash.clone());
        }
    }
    inner.certs.insert(hash, cert);
}

fn remove_locked(inner: &mut CacheInner, hash: &str) {
    let Some(cert) = inner.certs.remove(hash) else {
        return;
    };
    for name in cert.names() {
        if let Some(hashes) = inner.by_name.get_mut(name) {
            hashes.retain(|h| h != hash);
            if hashes.is_empty() {
                inner.by_name.remove(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::self_signed;

    #[test]
    fn test_insert_and_get_by_hash() {
        let cache = CertificateCache::new();
        let cert = self_signed(&["example.com"]);
        let hash = cert.hash().to_string();

        cache.insert(cert);

        let found = cache.get(&hash).expect("record should be cached");
        assert_eq!(found.hash(), hash);
        assert_eq!(found.names(), ["example.com"]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_name_index_serves_lookups() {
        let cache = CertificateCache::new();
        cache.insert(self_signed(&["example.com", "www.example.com"]));
        cache.insert(self_signed(&["*.example.net"]));

        assert_eq!(cache.all_matching("example.com").len(), 1);
        assert_eq!(cache.all_matching("www.example.com").len(), 1);
        assert_eq!(cache.all_matching("*.example.net").len(), 1);
        assert!(cache.all_matching("api.example.net").is_empty());
        assert!(cache.all_matching("nowhere.invalid").is_empty());
    }

    #[test]
    fn test_remove_cleans_the_index() {
        let cache = CertificateCache::new();
        let cert = self_signed(&["example.com"]);
        let hash = cert.hash().to_string();
        cache.insert(cert);

        cache.remove(&hash);

        assert!(cache.get(&hash).is_none());
        assert!(cache.all_matching("example.com").is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replace_swaps_records_atomically() {
        let cache = CertificateCache::new();
        let old = self_signed(&["example.com"]);
        let old_hash = old.hash().to_string();
        cache.insert(old);

        let new = self_signed(&["example.com"]);
        let new_hash = new.hash().to_string();
        assert_ne!(old_hash, new_hash);

        cache.replace(&old_hash, new);

        assert!(cache.get(&old_hash).is_none());
        assert!(cache.get(&new_hash).is_some());
        assert_eq!(cache.all_matching("example.com").len(), 1);
    }

    #[test]
    fn test_update_skips_evicted_records() {
        let cache = CertificateCache::new();
        let cert = self_signed(&["example.com"]);

        // Never inserted: update must not resurrect it.
        cache.update(cert);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_eviction() {
        let cache = CertificateCache::with_options(CacheOptions {
            capacity: 2,
            almost_full_ratio: 0.9,
        });
        cache.insert(self_signed(&["a.example.com"]));
        cache.insert(self_signed(&["b.example.com"]));
        cache.insert(self_signed(&["c.example.com"]));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.all_matching("c.example.com").len(), 1);
    }

    #[test]
    fn test_almost_full_boundary() {
        let cache = CertificateCache::with_options(CacheOptions {
            capacity: 1000,
            almost_full_ratio: 0.9,
        });
        for i in 0..899 {
            cache.insert(self_signed(&[&format!("h{i}.example.com")]));
        }
        assert!(!cache.almost_full());

        cache.insert(self_signed(&["h899.example.com"]));
        assert!(cache.almost_full());
    }

    #[test]
    fn test_unlimited_cache_is_never_almost_full() {
        let cache = CertificateCache::with_options(CacheOptions {
            capacity: 0,
            almost_full_ratio: 0.9,
        });
        cache.insert(self_signed(&["example.com"]));
        assert!(!cache.almost_full());
    }
}
