//! Keeping enforcement in step with the link directory.
//!
//! The [`Directory`] holds the declared links and is the source of truth. The
//! [`ChangeFeed`] notifies about mutations on a best-effort basis: notifications may be
//! duplicated, reordered or lost. The [`Synchronizer`] treats them as hints, re-reading the
//! directory for every notified key and periodically reconciling the whole table against it.
//!
//! Two backends are provided: an in-process [`MemoryDirectory`] and a Redis client
//! ([`RedisDirectory`], [`RedisFeed`]) listening to keyspace event notifications.

use std::{io, pin::Pin, time::Duration};

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use flowem_wire::{ChangeEvent, DecodeError, NetworkLink};

pub mod memory;
pub use memory::MemoryDirectory;

pub mod redis;
pub use redis::{RedisDirectory, RedisFeed, RedisOptions};

mod stats;
pub use stats::{SyncStats, SyncStatsSnapshot};

mod synchronizer;
pub use synchronizer::{
    Applied, FlowBinding, ReconcileReport, SyncError, SyncOptions, Synchronizer,
};

/// The channel namespace keyspace event notifications are published under.
pub const DEFAULT_NAMESPACE: &str = "__keyevent@0__";

/// The prefix of link declaration keys.
pub const DEFAULT_KEY_PREFIX: &str = "network_link:";

/// Returns the directory key of the link with `id`.
pub fn link_key(id: impl std::fmt::Display) -> String {
    format!("{DEFAULT_KEY_PREFIX}{id}")
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("directory error reply: {0}")]
    Server(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl DirectoryError {
    /// Whether the operation may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_) | Self::Io(_))
    }
}

/// A value read from the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    /// Monotonic revision of the write that produced `value`, if the backend tracks them.
    pub revision: Option<u64>,
    pub value: T,
}

/// The link directory.
///
/// Every operation is independently atomic; nothing is transactional across keys.
#[async_trait]
pub trait Directory: Send + Sync + 'static {
    /// Writes `value` under `key`, expiring after `ttl` if given.
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>)
        -> Result<(), DirectoryError>;

    /// Reads the current value of `key`.
    async fn get(&self, key: &str) -> Result<Option<Versioned<String>>, DirectoryError>;

    /// Lists the keys starting with `prefix`, as of the time of the call.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, DirectoryError>;

    /// Deletes `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, DirectoryError>;
}

/// A stream of change notifications.
pub type ChangeStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>;

/// The change feed of a directory.
#[async_trait]
pub trait ChangeFeed: Send + Sync + 'static {
    /// Subscribes to the notification channels matching any of the glob `patterns`.
    async fn subscribe(&self, patterns: &[String]) -> Result<ChangeStream, DirectoryError>;
}

/// Writes `link` under `key`.
pub async fn put_link<D: Directory + ?Sized>(
    directory: &D,
    key: &str,
    link: &NetworkLink,
    ttl: Option<Duration>,
) -> Result<(), DirectoryError> {
    link.validate()?;
    directory.put(key, link.to_json()?, ttl).await
}

/// Reads and decodes the link under `key`.
pub async fn get_link<D: Directory + ?Sized>(
    directory: &D,
    key: &str,
) -> Result<Option<Versioned<NetworkLink>>, DirectoryError> {
    let Some(Versioned { revision, value }) = directory.get(key).await? else {
        return Ok(None);
    };

    Ok(Some(Versioned { revision, value: NetworkLink::from_json(&value)? }))
}

/// Matches `text` against a glob `pattern` supporting `*`, `?` and `\` escapes, the way
/// channel patterns are matched by the directory.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let (p, t) = (pattern.as_bytes(), text.as_bytes());
    let (mut pi, mut ti) = (0, 0);
    // Position of the last `*` and the text position it was tried at.
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        let step = match p.get(pi) {
            Some(b'*') => {
                star = Some((pi, ti));
                pi += 1;
                continue;
            }
            Some(b'?') => Some(1),
            Some(b'\\') if pi + 1 < p.len() => (p[pi + 1] == t[ti]).then_some(2),
            Some(c) => (*c == t[ti]).then_some(1),
            None => None,
        };

        match (step, star) {
            (Some(n), _) => {
                pi += n;
                ti += 1;
            }
            // Let the last `*` swallow one more byte and retry from there.
            (None, Some((sp, st))) => {
                star = Some((sp, st + 1));
                pi = sp + 1;
                ti = st + 1;
            }
            (None, None) => return false,
        }
    }

    p[pi..].iter().all(|c| *c == b'*')
}
