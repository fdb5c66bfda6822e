use std::{fmt, hash::Hash, sync::Arc};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap<K> = FxHashMap<K, Arc<AsyncMutex<()>>>;

/// Asynchronous mutual exclusion scoped to a key.
///
/// Holders of different keys never wait on each other, holders of the same key are served
/// one at a time in FIFO order. Entries are removed once no guard or waiter references them,
/// so the map only grows with the number of keys currently in use.
pub struct KeyedLocks<K> {
    locks: Arc<Mutex<LockMap<K>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self { locks: Arc::new(Mutex::new(FxHashMap::default())) }
    }
}

impl<K> fmt::Debug for KeyedLocks<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLocks").field("active", &self.locks.lock().len()).finish()
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the lock for `key` is available and returns a guard holding it.
    ///
    /// Cancel safe: a waiter dropped before it got the lock releases its reference to the key.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let mutex = Arc::clone(self.locks.lock().entry(key.clone()).or_default());
        let entry = Entry { key, mutex, locks: Arc::clone(&self.locks) };

        let guard = Arc::clone(&entry.mutex).lock_owned().await;

        KeyedGuard { guard, entry }
    }

    /// Returns the number of keys that are currently locked or awaited.
    pub fn active(&self) -> usize {
        self.locks.lock().len()
    }
}

/// A reference to the map entry of a key, held by waiters and guards alike. The last one
/// dropped removes the entry.
struct Entry<K: Eq + Hash> {
    key: K,
    mutex: Arc<AsyncMutex<()>>,
    locks: Arc<Mutex<LockMap<K>>>,
}

impl<K: Eq + Hash> Drop for Entry<K> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // Every holder or waiter of the key keeps a reference: if the map and this entry are
        // the only ones left, the key is free.
        let last = locks
            .get(&self.key)
            .is_some_and(|m| Arc::ptr_eq(m, &self.mutex) && Arc::strong_count(m) == 2);
        if last {
            locks.remove(&self.key);
        }
    }
}

/// A held per-key lock. Releases the key when dropped.
pub struct KeyedGuard<K: Eq + Hash> {
    // Fields drop in order: the lock is released before the entry is checked.
    guard: OwnedMutexGuard<()>,
    entry: Entry<K>,
}

impl<K: Eq + Hash> KeyedGuard<K> {
    /// The key this guard is holding.
    pub fn key(&self) -> &K {
        &self.entry.key
    }
}

impl<K: Eq + Hash + fmt::Debug> fmt::Debug for KeyedGuard<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedGuard").field("key", &self.entry.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock("link").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiters_do_not_leak_entries() {
        let locks = KeyedLocks::new();

        let held = locks.lock("link").await;
        let mut waiter = Box::pin(locks.lock("link"));
        assert!(futures::poll!(&mut waiter).is_pending());

        // The waiter still references the key when the holder leaves.
        drop(held);
        assert_eq!(locks.active(), 1);

        drop(waiter);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::new();

        let a = locks.lock(1u32).await;
        let b = tokio::time::timeout(Duration::from_secs(1), locks.lock(2u32))
            .await
            .expect("independent key should not wait");

        assert_eq!(*a.key(), 1);
        assert_eq!(*b.key(), 2);
        assert_eq!(locks.active(), 2);

        drop(a);
        drop(b);
        assert_eq!(locks.active(), 0);
    }
}
