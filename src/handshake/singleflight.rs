//! Per-name singleflight coordination for load and obtain/renew work.
//!
//! A wait table maps a normalized name to a one-shot broadcast signal.
//! The first task to ask for a name becomes the owner and does the work;
//! everyone else gets a receiver and waits. The signal carries no data:
//! the owner publishes its result to the certificate cache *before*
//! releasing the slot, and woken waiters re-enter resolution from the
//! top expecting the cache to now contain the result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use super::error::{HandshakeError, HandshakeResult};

/// Hard cap on how long a waiter blocks for another task's result, so a
/// wedged owner cannot hold handshakes open indefinitely.
pub(crate) const WAIT_TIMEOUT: Duration = Duration::from_secs(120);

type Entries = Arc<Mutex<HashMap<String, watch::Receiver<()>>>>;

/// A table of in-flight operations keyed by normalized name.
///
/// The mutex only guards map lookups and insertions; no task ever
/// blocks while holding it.
#[derive(Debug, Default)]
pub(crate) struct WaitTable {
    entries: Entries,
}

/// Outcome of asking the table for a name.
pub(crate) enum Flight {
    /// This task owns the operation and must release the slot when the
    /// cache has been populated (or the operation failed).
    Owner(OwnerSlot),
    /// Another task is already on it; wait on the receiver.
    Waiter(watch::Receiver<()>),
}

/// Owner's handle on a wait-table slot.
///
/// Dropping the slot removes the table entry and closes the signal,
/// waking every waiter. Drop-based release also covers early returns
/// and panics in the owner's work.
pub(crate) struct OwnerSlot {
    name: String,
    entries: Entries,
    _signal: watch::Sender<()>,
}

impl OwnerSlot {
    /// Release the slot, waking all waiters for this name.
    pub(crate) fn release(self) {}
}

impl Drop for OwnerSlot {
    fn drop(&mut self) {
        lock_entries(&self.entries).remove(&self.name);
        // The sender drops with the slot, which closes every receiver.
    }
}

impl WaitTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Find the in-flight operation for `name`, or claim it.
    ///
    /// The find-or-insert is atomic under the table mutex: a caller
    /// either sees an existing signal (and only waits on it) or installs
    /// its own (and owns completion).
    pub(crate) fn acquire(&self, name: &str) -> Flight {
        let mut entries = lock_entries(&self.entries);
        if let Some(rx) = entries.get(name) {
            return Flight::Waiter(rx.clone());
        }
        let (tx, rx) = watch::channel(());
        entries.insert(name.to_string(), rx);
        Flight::Owner(OwnerSlot {
            name: name.to_string(),
            entries: Arc::clone(&self.entries),
            _signal: tx,
        })
    }

    /// Number of in-flight operations, for diagnostics.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock_entries(&self.entries).len()
    }
}

fn lock_entries(entries: &Entries) -> MutexGuard<'_, HashMap<String, watch::Receiver<()>>> {
    entries.lock().unwrap_or_else(|poisoned| {
        warn!("wait table mutex poisoned; recovering");
        poisoned.into_inner()
    })
}

/// Block on another task's in-flight operation for `name`.
///
/// Resolves when the owner releases the slot, or fails with
/// [`HandshakeError::WaitTimeout`] after the safety timeout. Caller
/// cancellation is observed by dropping the returned future.
pub(crate) async fn wait_for_flight(
    mut rx: watch::Receiver<()>,
    name: &str,
    operation: &'static str,
) -> HandshakeResult<()> {
    match tokio::time::timeout(WAIT_TIMEOUT, rx.changed()).await {
        // Either a value was sent or the sender dropped; both mean the
        // owner is done and the cache holds whatever it produced.
        Ok(_) => Ok(()),
        Err(_) => Err(HandshakeError::WaitTimeout {
            name: name.to_string(),
            operation,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_caller_owns_the_slot() {
        let table = WaitTable::new();
        let flight = table.acquire("example.com");
        assert!(matches!(flight, Flight::Owner(_)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_second_caller_waits() {
        let table = WaitTable::new();
        let first = table.acquire("example.com");
        let second = table.acquire("example.com");
        assert!(matches!(first, Flight::Owner(_)));
        assert!(matches!(second, Flight::Waiter(_)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_names_are_independent() {
        let table = WaitTable::new();
        let a = table.acquire("a.example.com");
        let b = table.acquire("b.example.com");
        assert!(matches!(a, Flight::Owner(_)));
        assert!(matches!(b, Flight::Owner(_)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_release_clears_the_entry() {
        let table = WaitTable::new();
        let Flight::Owner(slot) = table.acquire("example.com") else {
            panic!("expected ownership");
        };
        slot.release();
        assert_eq!(table.len(), 0);
        assert!(matches!(table.acquire("example.com"), Flight::Owner(_)));
    }

    #[tokio::test]
    async fn test_waiters_wake_on_release() {
        let table = WaitTable::new();
        let Flight::Owner(slot) = table.acquire("example.com") else {
            panic!("expected ownership");
        };
        let Flight::Waiter(rx) = table.acquire("example.com") else {
            panic!("expected a waiter");
        };

        let waiter = tokio::spawn(wait_for_flight(rx, "example.com", "load"));
        slot.release();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_time_out() {
        let table = WaitTable::new();
        let Flight::Owner(_slot) = table.acquire("example.com") else {
            panic!("expected ownership");
        };
        let Flight::Waiter(rx) = table.acquire("example.com") else {
            panic!("expected a waiter");
        };

        let err = wait_for_flight(rx, "example.com", "load")
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::WaitTimeout { .. }));
    }
}
