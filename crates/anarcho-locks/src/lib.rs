//! anarcho-locks: the key-lock table.
//!
//! A local embedded map from key to a lock sentinel, used to gate
//! replies on durability. A lock on `k` means "some session has a write
//! on `k` in flight that has not yet been confirmed durable"; readers
//! and subsequent writers of `k` wait until the lock disappears.
//!
//! Locks live in a sled tree under the `anarcho:key:` prefix with the
//! two-byte value `OK`. Waiting is event-driven through sled's prefix
//! watch: an unlock (or a TTL sweep) deletes the entry and every waiter
//! sees the deletion. TTL bounds worst-case head-of-line blocking when a
//! replication-side acknowledgement is lost; it is a safety net, not a
//! correctness mechanism.
//!
//! The table is local to one proxy instance. There is no cross-process
//! coordination.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Prefix for every lock entry. No other keys are written by this
/// system.
const KEY_PREFIX: &str = "anarcho:key:";

/// Value stored for a held lock.
const SENTINEL: &[u8] = b"OK";

/// Errors from the key-lock table.
#[derive(Debug, Error)]
pub enum LockError {
    /// The embedded store failed underneath us.
    #[error("lock store error: {0}")]
    Store(#[from] sled::Error),

    /// The wait was cancelled while keys were still locked.
    #[error("cancelled while awaiting key locks")]
    Cancelled,

    /// The store's event stream ended while keys were still locked.
    #[error("lock subscription closed")]
    SubscriptionClosed,
}

/// The key-lock table. Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct KeyLockStore {
    db: sled::Db,
    lock_ttl: Duration,
    deadlines: Arc<Mutex<HashMap<String, Instant>>>,
}

impl KeyLockStore {
    /// Opens the table at `path`, or an in-memory store when `path` is
    /// `None`.
    ///
    /// Any lock entries left behind by a previous process are cleared:
    /// a freshly started proxy has no writes in flight, so a surviving
    /// entry can only be stale.
    pub fn open(path: Option<&Path>, lock_ttl: Duration) -> Result<Self, LockError> {
        let db = match path {
            Some(p) => sled::Config::new().path(p).open()?,
            None => sled::Config::new().temporary(true).open()?,
        };

        let store = KeyLockStore {
            db,
            lock_ttl,
            deadlines: Arc::new(Mutex::new(HashMap::new())),
        };
        let cleared = store.clear_all()?;
        if cleared > 0 {
            debug!(cleared, "dropped stale lock entries at open");
        }
        Ok(store)
    }

    /// Locks every key in one atomic batch, each with a fresh TTL.
    /// Re-locking an already-locked key resets its TTL: a new in-flight
    /// write subsumes the old one.
    pub fn lock_keys(&self, keys: &[String]) -> Result<(), LockError> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut batch = sled::Batch::default();
        for key in keys {
            batch.insert(prefixed(key).into_bytes(), SENTINEL);
            debug!(%key, "lock created");
        }
        self.db.apply_batch(batch)?;

        let deadline = Instant::now() + self.lock_ttl;
        let mut deadlines = self.deadlines.lock().expect("deadline map poisoned");
        for key in keys {
            deadlines.insert(key.clone(), deadline);
        }
        Ok(())
    }

    /// Releases every key in one atomic batch. Unlocking an absent key
    /// is not an error.
    pub fn unlock_keys(&self, keys: &[String]) -> Result<(), LockError> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut batch = sled::Batch::default();
        for key in keys {
            batch.remove(prefixed(key).into_bytes());
            debug!(%key, "freeing");
        }
        self.db.apply_batch(batch)?;

        let mut deadlines = self.deadlines.lock().expect("deadline map poisoned");
        for key in keys {
            deadlines.remove(key);
        }
        Ok(())
    }

    /// Blocks until every key in `keys` is unlocked.
    ///
    /// The prefix subscription is registered before the lock scan, so an
    /// unlock landing between the two cannot be missed. Returns
    /// [`LockError::Cancelled`] if `cancel` fires while keys are still
    /// held.
    pub async fn await_unlocked(
        &self,
        keys: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), LockError> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut sub = self.db.watch_prefix(KEY_PREFIX);

        let mut waiting = HashSet::new();
        for key in keys {
            if self.db.contains_key(prefixed(key))? {
                debug!(%key, "locked");
                waiting.insert(key.clone());
            } else {
                debug!(%key, "no lock");
            }
        }
        if waiting.is_empty() {
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(LockError::Cancelled),
                event = &mut sub => match event {
                    Some(sled::Event::Remove { key }) => {
                        release(&mut waiting, &key);
                        if waiting.is_empty() {
                            return Ok(());
                        }
                    }
                    // an insert that is not the sentinel also counts as
                    // a release: the entry no longer marks a held lock
                    Some(sled::Event::Insert { key, value }) if value.as_ref() != SENTINEL => {
                        release(&mut waiting, &key);
                        if waiting.is_empty() {
                            return Ok(());
                        }
                    }
                    Some(_) => {}
                    None => return Err(LockError::SubscriptionClosed),
                },
            }
        }
    }

    /// Deletes every lock whose TTL deadline has passed. Returns how
    /// many were dropped. Deletions flow through the same watch stream
    /// the waiters use, so expiry wakes them like an unlock would.
    pub fn sweep_expired(&self) -> Result<usize, LockError> {
        let now = Instant::now();
        let expired: Vec<String> = {
            let deadlines = self.deadlines.lock().expect("deadline map poisoned");
            deadlines
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(key, _)| key.clone())
                .collect()
        };
        if expired.is_empty() {
            return Ok(0);
        }

        debug!(count = expired.len(), "sweeping expired locks");
        self.unlock_keys(&expired)?;
        Ok(expired.len())
    }

    /// Periodically sweeps expired locks until `cancel` fires.
    pub async fn run_ttl_sweeper(&self, cancel: CancellationToken) {
        let period = (self.lock_ttl / 10).max(Duration::from_millis(50));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_expired() {
                        tracing::warn!("lock sweep failed: {e}");
                    }
                }
            }
        }
    }

    /// True while `key` has a live lock entry.
    pub fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        Ok(self.db.contains_key(prefixed(key))?)
    }

    fn clear_all(&self) -> Result<usize, LockError> {
        let mut batch = sled::Batch::default();
        let mut count = 0usize;
        for entry in self.db.scan_prefix(KEY_PREFIX) {
            let (key, _) = entry?;
            batch.remove(key);
            count += 1;
        }
        if count > 0 {
            self.db.apply_batch(batch)?;
        }
        Ok(count)
    }
}

fn prefixed(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

/// Strips the store prefix from a raw event key and drops it from the
/// waiting set.
fn release(waiting: &mut HashSet<String>, raw: &[u8]) {
    if let Ok(text) = std::str::from_utf8(raw) {
        if let Some(key) = text.strip_prefix(KEY_PREFIX) {
            debug!(%key, "lock removed");
            waiting.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    fn store() -> KeyLockStore {
        KeyLockStore::open(None, TTL).expect("in-memory store")
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn lock_then_unlock() {
        let store = store();
        store.lock_keys(&keys(&["a", "b"])).unwrap();
        assert!(store.is_locked("a").unwrap());
        assert!(store.is_locked("b").unwrap());

        store.unlock_keys(&keys(&["a"])).unwrap();
        assert!(!store.is_locked("a").unwrap());
        assert!(store.is_locked("b").unwrap());
    }

    #[tokio::test]
    async fn unlock_absent_key_is_fine() {
        let store = store();
        store.unlock_keys(&keys(&["never-locked"])).unwrap();
    }

    #[tokio::test]
    async fn await_returns_immediately_without_locks() {
        let store = store();
        let cancel = CancellationToken::new();
        store
            .await_unlocked(&keys(&["a", "b"]), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn await_blocks_until_unlock() {
        let store = store();
        store.lock_keys(&keys(&["k"])).unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                store.await_unlocked(&keys(&["k"]), &cancel).await
            })
        };

        // give the waiter a chance to subscribe and block
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        store.unlock_keys(&keys(&["k"])).unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn await_waits_for_every_key() {
        let store = store();
        store.lock_keys(&keys(&["a", "b"])).unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                store.await_unlocked(&keys(&["a", "b"]), &cancel).await
            })
        };

        tokio::task::yield_now().await;
        store.unlock_keys(&keys(&["a"])).unwrap();
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished(), "b is still locked");

        store.unlock_keys(&keys(&["b"])).unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn relock_does_not_wake_waiters() {
        let store = store();
        store.lock_keys(&keys(&["k"])).unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                store.await_unlocked(&keys(&["k"]), &cancel).await
            })
        };

        tokio::task::yield_now().await;
        // overwriting with the sentinel resets TTL but keeps the lock
        store.lock_keys(&keys(&["k"])).unwrap();
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        store.unlock_keys(&keys(&["k"])).unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_reports_cancelled() {
        let store = store();
        store.lock_keys(&keys(&["k"])).unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let store = store.clone();
            let cancel = cancel.clone();
            tokio::spawn(
                async move { store.await_unlocked(&keys(&["k"]), &cancel).await },
            )
        };

        tokio::task::yield_now().await;
        cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, LockError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_expired_locks() {
        let store = store();
        store.lock_keys(&keys(&["k"])).unwrap();

        tokio::time::advance(TTL / 2).await;
        assert_eq!(store.sweep_expired().unwrap(), 0);
        assert!(store.is_locked("k").unwrap());

        tokio::time::advance(TTL).await;
        assert_eq!(store.sweep_expired().unwrap(), 1);
        assert!(!store.is_locked("k").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn relock_resets_ttl() {
        let store = store();
        store.lock_keys(&keys(&["k"])).unwrap();

        tokio::time::advance(TTL / 2).await;
        store.lock_keys(&keys(&["k"])).unwrap();

        // past the original deadline, within the refreshed one
        tokio::time::advance(TTL / 2 + Duration::from_millis(1)).await;
        assert_eq!(store.sweep_expired().unwrap(), 0);
        assert!(store.is_locked("k").unwrap());

        tokio::time::advance(TTL).await;
        assert_eq!(store.sweep_expired().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_wakes_waiters() {
        let store = store();
        store.lock_keys(&keys(&["k"])).unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                store.await_unlocked(&keys(&["k"]), &cancel).await
            })
        };

        tokio::task::yield_now().await;
        tokio::time::advance(TTL + Duration::from_millis(1)).await;
        store.sweep_expired().unwrap();

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reopen_clears_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = KeyLockStore::open(Some(dir.path()), TTL).unwrap();
            store.lock_keys(&keys(&["stale"])).unwrap();
            store.db.flush().unwrap();
        }
        let store = KeyLockStore::open(Some(dir.path()), TTL).unwrap();
        assert!(!store.is_locked("stale").unwrap());
    }
}
