use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use flowem_wire::{ChangeEvent, EventKind};

use crate::{
    glob_match, ChangeFeed, ChangeStream, Directory, DirectoryError, Versioned, DEFAULT_NAMESPACE,
};

/// Default number of notifications a slow subscriber may fall behind before losing some.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Stored {
    value: String,
    revision: u64,
    expires_at: Option<Instant>,
}

impl Stored {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct State {
    entries: FxHashMap<String, Stored>,
    revision: u64,
}

impl State {
    /// Removes `key` if it has expired. Returns whether it did.
    fn expire_if_due(&mut self, key: &str, now: Instant) -> bool {
        if self.entries.get(key).is_some_and(|s| s.is_expired(now)) {
            self.entries.remove(key);
            return true;
        }

        false
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<ChangeEvent>,
    notify: AtomicBool,
    namespace: String,
}

/// An in-process directory with its change feed.
///
/// Behaves like a keyspace-notifying key-value store: writes get a monotonically increasing
/// revision, keys may carry a time-to-live, and every mutation publishes a `set`, `del` or
/// `expired` notification. The feed is lossy: subscribers that fall behind miss
/// notifications, and [`MemoryDirectory::set_notifications`] can suppress them altogether.
#[derive(Debug, Clone)]
pub struct MemoryDirectory {
    inner: Arc<Inner>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feed_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
                notify: AtomicBool::new(true),
                namespace: DEFAULT_NAMESPACE.to_string(),
            }),
        }
    }

    /// Enables or disables notifications. Mutations made while disabled are never notified.
    pub fn set_notifications(&self, enabled: bool) {
        self.inner.notify.store(enabled, Ordering::Relaxed);
    }

    /// The number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner.state.lock().entries.values().filter(|s| !s.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every expired key, notifying each. Returns how many expired.
    pub fn reap(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut state = self.inner.state.lock();
            let keys: Vec<_> = state
                .entries
                .iter()
                .filter(|(_, stored)| stored.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                state.entries.remove(key);
            }
            keys
        };

        for key in &expired {
            self.publish(EventKind::Expired, key);
        }

        expired.len()
    }

    /// Spawns a task that reaps expired keys every `interval` until `cancel` fires.
    pub fn spawn_reaper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let n = this.reap();
                        if n > 0 {
                            debug!(expired = n, "reaped expired keys");
                        }
                    }
                }
            }
        })
    }

    fn publish(&self, kind: EventKind, key: &str) {
        if !self.inner.notify.load(Ordering::Relaxed) {
            return;
        }

        // No subscribers is not an error, notifications are fire and forget.
        let _ = self.inner.events.send(ChangeEvent::new(kind, key));
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn put(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), DirectoryError> {
        {
            let mut state = self.inner.state.lock();
            state.revision += 1;
            let revision = state.revision;
            let expires_at = ttl.map(|ttl| Instant::now() + ttl);
            state.entries.insert(key.to_string(), Stored { value, revision, expires_at });
        }

        self.publish(EventKind::Set, key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Versioned<String>>, DirectoryError> {
        let (value, expired) = {
            let mut state = self.inner.state.lock();
            let expired = state.expire_if_due(key, Instant::now());
            let value = state
                .entries
                .get(key)
                .map(|s| Versioned { revision: Some(s.revision), value: s.value.clone() });
            (value, expired)
        };

        if expired {
            self.publish(EventKind::Expired, key);
        }

        Ok(value)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, DirectoryError> {
        let now = Instant::now();
        let state = self.inner.state.lock();

        let mut keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(key, stored)| key.starts_with(prefix) && !stored.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();

        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<bool, DirectoryError> {
        let existed = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();
            state.entries.remove(key).is_some_and(|s| !s.is_expired(now))
        };

        if existed {
            self.publish(EventKind::Delete, key);
        }

        Ok(existed)
    }
}

#[async_trait]
impl ChangeFeed for MemoryDirectory {
    async fn subscribe(&self, patterns: &[String]) -> Result<ChangeStream, DirectoryError> {
        let patterns = patterns.to_vec();
        let namespace = self.inner.namespace.clone();

        let stream = BroadcastStream::new(self.inner.events.subscribe()).filter_map(move |item| {
            match item {
                Ok(event) => {
                    let channel = ChangeEvent::channel(&namespace, event.kind);
                    patterns.iter().any(|p| glob_match(p, &channel)).then_some(event)
                }
                Err(e) => {
                    warn!(err = %e, "change feed subscriber fell behind, notifications lost");
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all() -> Vec<String> {
        vec![format!("{DEFAULT_NAMESPACE}:*")]
    }

    #[tokio::test]
    async fn revisions_increase() {
        let dir = MemoryDirectory::new();
        dir.put("a", "1".into(), None).await.unwrap();
        dir.put("b", "1".into(), None).await.unwrap();
        dir.put("a", "2".into(), None).await.unwrap();

        let a = dir.get("a").await.unwrap().unwrap();
        let b = dir.get("b").await.unwrap().unwrap();
        assert_eq!(a.value, "2");
        assert!(a.revision > b.revision);

        assert_eq!(dir.list("").await.unwrap(), vec!["a", "b"]);
        assert!(dir.delete("a").await.unwrap());
        assert!(!dir.delete("a").await.unwrap());
        assert_eq!(dir.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mutations_are_notified() {
        let dir = MemoryDirectory::new();
        let mut feed = dir.subscribe(&all()).await.unwrap();

        dir.put("k", "v".into(), None).await.unwrap();
        dir.delete("k").await.unwrap();

        let set = feed.next().await.unwrap();
        assert_eq!((set.kind, set.key.as_str()), (EventKind::Set, "k"));
        let del = feed.next().await.unwrap();
        assert_eq!((del.kind, del.key.as_str()), (EventKind::Delete, "k"));
    }

    #[tokio::test]
    async fn patterns_filter_channels() {
        let dir = MemoryDirectory::new();
        let mut feed = dir.subscribe(&[format!("{DEFAULT_NAMESPACE}:del")]).await.unwrap();

        dir.put("k", "v".into(), None).await.unwrap();
        dir.delete("k").await.unwrap();

        assert_eq!(feed.next().await.unwrap().kind, EventKind::Delete);
    }

    #[tokio::test]
    async fn suppressed_notifications_are_lost() {
        let dir = MemoryDirectory::new();
        let mut feed = dir.subscribe(&all()).await.unwrap();

        dir.set_notifications(false);
        dir.put("silent", "v".into(), None).await.unwrap();
        dir.set_notifications(true);
        dir.put("loud", "v".into(), None).await.unwrap();

        assert_eq!(feed.next().await.unwrap().key, "loud");
        assert_eq!(dir.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire() {
        let dir = MemoryDirectory::new();
        let mut feed = dir.subscribe(&all()).await.unwrap();
        let cancel = CancellationToken::new();
        let reaper = dir.spawn_reaper(Duration::from_millis(100), cancel.clone());

        dir.put("short", "v".into(), Some(Duration::from_secs(1))).await.unwrap();
        dir.put("long", "v".into(), None).await.unwrap();
        assert_eq!(feed.next().await.unwrap().kind, EventKind::Set);
        assert_eq!(feed.next().await.unwrap().kind, EventKind::Set);

        let expired = feed.next().await.unwrap();
        assert_eq!((expired.kind, expired.key.as_str()), (EventKind::Expired, "short"));
        assert_eq!(dir.list("").await.unwrap(), vec!["long"]);

        cancel.cancel();
        reaper.await.unwrap();
    }
}
