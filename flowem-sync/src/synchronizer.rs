use std::{collections::BTreeSet, future::Future, path::PathBuf, sync::Arc, time::Duration};

use futures::StreamExt;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::{
    sync::{mpsc, Semaphore},
    task::{JoinHandle, JoinSet},
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use flowem_common::{ExponentialBackoff, KeyedLocks};
use flowem_shaper::{pin, ShapingTable, TableError, Upsert};
use flowem_wire::{ChangeEvent, DecodeError, FlowKey, NetworkLink, ShapingEntry};

use crate::{
    ChangeFeed, Directory, DirectoryError, SyncStats, Versioned, DEFAULT_KEY_PREFIX,
    DEFAULT_NAMESPACE,
};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Change feed channel patterns to subscribe to.
    pub patterns: Vec<String>,
    /// Only keys starting with one of these prefixes are synchronized. Empty means all keys.
    pub key_prefixes: Vec<String>,
    /// Maximum number of notifications handled concurrently.
    pub workers: usize,
    /// Notifications buffered between the change feed and the workers.
    pub queue_size: usize,
    /// Retries of a failing directory operation before giving up.
    pub max_retries: usize,
    pub retry_interval: Duration,
    pub max_retry_interval: Duration,
    /// Interval between full reconciliation passes.
    pub reconcile_interval: Duration,
    /// Grace period for in-flight handlers on shutdown.
    pub shutdown_timeout: Duration,
    /// Where to pin the table after each reconciliation pass, if anywhere.
    pub pin_path: Option<PathBuf>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            patterns: vec![format!("{DEFAULT_NAMESPACE}:*")],
            key_prefixes: vec![DEFAULT_KEY_PREFIX.to_string()],
            workers: 32,
            queue_size: 1024,
            max_retries: 5,
            retry_interval: Duration::from_millis(100),
            max_retry_interval: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            pin_path: None,
        }
    }
}

/// Binds directory records to this node: every link is enforced on the egress interface
/// `if_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowBinding {
    pub if_index: u32,
}

impl FlowBinding {
    pub fn new(if_index: u32) -> Self {
        Self { if_index }
    }

    /// Decodes a directory record into the flow it declares and its parameters.
    pub fn decode(&self, raw: &str) -> Result<(FlowKey, ShapingEntry), DecodeError> {
        let link = NetworkLink::from_json(raw)?;
        Ok((FlowKey::new(self.if_index, link.source()?), link.shaping_entry()?))
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to subscribe to the change feed: {0}")]
    Subscribe(#[source] DirectoryError),
    #[error("directory error on {key}: {source}")]
    Directory { key: String, source: DirectoryError },
    #[error("malformed record {key}: {source}")]
    Decode { key: String, source: DecodeError },
    #[error("cannot apply {key}: {source}")]
    Table { key: String, source: TableError },
}

/// What handling a key did to the table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Applied {
    Inserted(FlowKey),
    Updated { flow: FlowKey, previous: ShapingEntry },
    Unchanged(FlowKey),
    Removed(FlowKey),
    /// The key is not in the directory and nothing in the table belongs to it.
    Absent,
    /// The directory returned a value older than the last one applied for the key.
    Stale { observed: u64, applied: u64 },
    /// The key is outside the interest filter.
    Ignored,
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Keys listed in the directory.
    pub listed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Entries removed because their key left the directory.
    pub removed: usize,
    /// Entries removed because no directory key declares them.
    pub orphans: usize,
    pub stale: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ReconcileReport {
    fn count(&mut self, applied: &Applied) {
        match applied {
            Applied::Inserted(_) => self.inserted += 1,
            Applied::Updated { .. } => self.updated += 1,
            Applied::Unchanged(_) => self.unchanged += 1,
            Applied::Removed(_) => self.removed += 1,
            Applied::Stale { .. } => self.stale += 1,
            Applied::Absent | Applied::Ignored => {}
        }
    }

    fn count_error(&mut self, err: &SyncError) {
        match err {
            SyncError::Decode { .. } => self.skipped += 1,
            _ => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    flow: FlowKey,
    revision: Option<u64>,
}

/// Which directory key each flow in the table came from.
///
/// Notifications carry no value, so a removal can only be mapped to its flow through what was
/// applied for the key earlier. Two keys may declare the same flow: the last one applied holds
/// it, and only the holder removes it.
#[derive(Debug, Default)]
struct Ownership {
    by_key: FxHashMap<String, Claim>,
    by_flow: FxHashMap<FlowKey, String>,
}

impl Ownership {
    /// Drops `key`'s hold on `flow`, removing it from `table` if `key` was the holder.
    /// Returns whether the entry was removed, and another key still declaring the flow.
    fn release(&mut self, key: &str, flow: FlowKey, table: &ShapingTable) -> (bool, Option<String>) {
        if self.by_flow.get(&flow).map(String::as_str) != Some(key) {
            return (false, None);
        }

        self.by_flow.remove(&flow);
        table.remove(&flow);

        let shadowed = self
            .by_key
            .iter()
            .find(|(other, claim)| claim.flow == flow && other.as_str() != key)
            .map(|(other, _)| other.clone());

        (true, shadowed)
    }
}

/// Turns change notifications into shaping table mutations, and periodically reconciles the
/// table against the directory.
///
/// Notifications for different keys are handled concurrently, notifications for the same key
/// one at a time. Whatever the notification says, the handler reads the key's current value
/// and makes the table match it, so duplicated or reordered notifications converge to the
/// directory's state.
pub struct Synchronizer<D> {
    directory: Arc<D>,
    table: Arc<ShapingTable>,
    binding: FlowBinding,
    options: SyncOptions,
    locks: KeyedLocks<String>,
    ownership: Mutex<Ownership>,
    stats: Arc<SyncStats>,
}

impl<D: Directory> Synchronizer<D> {
    pub fn new(
        directory: Arc<D>,
        table: Arc<ShapingTable>,
        binding: FlowBinding,
        options: SyncOptions,
    ) -> Self {
        Self {
            directory,
            table,
            binding,
            options,
            locks: KeyedLocks::new(),
            ownership: Mutex::new(Ownership::default()),
            stats: Arc::new(SyncStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<SyncStats> {
        &self.stats
    }

    pub fn table(&self) -> &Arc<ShapingTable> {
        &self.table
    }

    pub fn binding(&self) -> FlowBinding {
        self.binding
    }

    /// The number of directory keys currently applied to the table.
    pub fn owned(&self) -> usize {
        self.ownership.lock().by_key.len()
    }

    fn is_interesting(&self, key: &str) -> bool {
        self.options.key_prefixes.is_empty()
            || self.options.key_prefixes.iter().any(|prefix| key.starts_with(prefix.as_str()))
    }

    /// Handles one change notification.
    pub async fn handle_event(&self, event: ChangeEvent) -> Result<Applied, SyncError> {
        self.stats.increment_events();

        if !self.is_interesting(&event.key) {
            trace!(key = %event.key, "outside the interest filter");
            self.stats.increment_ignored();
            return Ok(Applied::Ignored);
        }

        self.process(event).await
    }

    async fn process(&self, event: ChangeEvent) -> Result<Applied, SyncError> {
        let waited = event.timestamp.elapsed().unwrap_or_default();
        trace!(key = %event.key, kind = %event.kind, ?waited, "handling notification");

        let result = self.sync_key(&event.key).await;
        self.record(&event.key, event.kind.as_str(), &result);
        result
    }

    /// Makes the table match the directory's current value for `key`.
    pub async fn sync_key(&self, key: &str) -> Result<Applied, SyncError> {
        let (applied, shadowed) = self.sync_locked(key).await?;

        // The removed flow is still declared under another key: apply that one now rather
        // than waiting for the next reconciliation pass.
        if let Some(other) = shadowed {
            debug!(key, %other, "flow still declared by another key");
            let result = self.sync_locked(&other).await.map(|(applied, _)| applied);
            self.record(&other, "handover", &result);
        }

        Ok(applied)
    }

    async fn sync_locked(&self, key: &str) -> Result<(Applied, Option<String>), SyncError> {
        let _guard = self.locks.lock(key.to_string()).await;

        let fetched = self
            .retry("get", key, || self.directory.get(key))
            .await
            .map_err(|source| SyncError::Directory { key: key.to_string(), source })?;

        let Some(Versioned { revision, value }) = fetched else {
            return Ok(self.release(key));
        };

        let applied_revision = self.ownership.lock().by_key.get(key).and_then(|c| c.revision);
        if let (Some(observed), Some(applied)) = (revision, applied_revision) {
            if observed < applied {
                return Ok((Applied::Stale { observed, applied }, None));
            }
        }

        let (flow, entry) = self
            .binding
            .decode(&value)
            .map_err(|source| SyncError::Decode { key: key.to_string(), source })?;

        let mut owners = self.ownership.lock();

        // The record now declares another flow: let go of the previous one.
        let mut shadowed = None;
        if let Some(previous) = owners.by_key.get(key).copied() {
            if previous.flow != flow {
                shadowed = owners.release(key, previous.flow, &self.table).1;
            }
        }

        if let Some(holder) = owners.by_flow.get(&flow) {
            if holder != key {
                warn!(key, %holder, %flow, "flow declared by several keys, last write wins");
            }
        }

        let outcome = self
            .table
            .upsert(flow, entry)
            .map_err(|source| SyncError::Table { key: key.to_string(), source })?;

        owners.by_flow.insert(flow, key.to_string());
        owners.by_key.insert(key.to_string(), Claim { flow, revision });

        let applied = match outcome {
            Upsert::Inserted => Applied::Inserted(flow),
            Upsert::Updated { previous } => Applied::Updated { flow, previous },
            Upsert::Unchanged => Applied::Unchanged(flow),
        };

        Ok((applied, shadowed))
    }

    fn release(&self, key: &str) -> (Applied, Option<String>) {
        let mut owners = self.ownership.lock();

        let Some(claim) = owners.by_key.remove(key) else {
            return (Applied::Absent, None);
        };

        match owners.release(key, claim.flow, &self.table) {
            (true, shadowed) => (Applied::Removed(claim.flow), shadowed),
            (false, _) => (Applied::Absent, None),
        }
    }

    /// Runs a directory operation, retrying transient failures with exponential backoff.
    async fn retry<T, F, Fut>(&self, op: &'static str, key: &str, mut f: F) -> Result<T, DirectoryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DirectoryError>>,
    {
        let mut backoff =
            ExponentialBackoff::new(self.options.retry_interval, Some(self.options.max_retries))
                .with_max_backoff(self.options.max_retry_interval);

        loop {
            match f().await {
                Err(e) if e.is_transient() => {
                    debug!(key, op, attempt = backoff.retries() + 1, err = %e, "transient directory error");
                    if backoff.next().await.is_none() {
                        return Err(e);
                    }
                }
                result => return result,
            }
        }
    }

    /// Logs and counts the outcome of handling `key`.
    fn record(&self, key: &str, trigger: &str, result: &Result<Applied, SyncError>) {
        match result {
            Ok(Applied::Inserted(flow)) => {
                self.stats.increment_applied();
                info!(key, trigger, %flow, entry = ?self.table.entry(flow), "flow installed");
            }
            Ok(Applied::Updated { flow, previous }) => {
                self.stats.increment_applied();
                info!(key, trigger, %flow, ?previous, entry = ?self.table.entry(flow), "flow updated");
            }
            Ok(Applied::Unchanged(flow)) => {
                self.stats.increment_unchanged();
                debug!(key, trigger, %flow, "flow unchanged");
            }
            Ok(Applied::Removed(flow)) => {
                self.stats.add_removed(1);
                info!(key, trigger, %flow, "flow removed");
            }
            Ok(Applied::Absent) => debug!(key, trigger, "key absent, nothing to remove"),
            Ok(Applied::Stale { observed, applied }) => {
                self.stats.increment_stale();
                info!(key, trigger, observed, applied, "stale value skipped");
            }
            Ok(Applied::Ignored) => trace!(key, trigger, "ignored"),
            Err(e @ SyncError::Decode { .. }) => {
                self.stats.increment_skipped();
                warn!(key, trigger, err = %e, "malformed record skipped");
            }
            Err(e) => {
                self.stats.increment_failed();
                error!(key, trigger, err = %e, "failed to synchronize key");
            }
        }
    }

    /// Makes the table entries of the bound interface equal to the directory's declarations.
    pub async fn reconcile(&self) -> Result<ReconcileReport, SyncError> {
        let prefixes = if self.options.key_prefixes.is_empty() {
            vec![String::new()]
        } else {
            self.options.key_prefixes.clone()
        };

        let mut listed = BTreeSet::new();
        for prefix in &prefixes {
            let keys = self
                .retry("list", prefix, || self.directory.list(prefix))
                .await
                .map_err(|source| SyncError::Directory { key: prefix.clone(), source })?;
            listed.extend(keys);
        }

        // Keys applied earlier but gone from the listing are re-read too, which removes them.
        let vanished: Vec<String> = self
            .ownership
            .lock()
            .by_key
            .keys()
            .filter(|key| !listed.contains(*key))
            .cloned()
            .collect();

        let mut report = ReconcileReport { listed: listed.len(), ..Default::default() };

        for key in listed.iter().chain(vanished.iter()) {
            let result = self.sync_key(key).await;
            self.record(key, "reconcile", &result);
            match &result {
                Ok(applied) => report.count(applied),
                Err(e) => report.count_error(e),
            }
        }

        // Entries no key declares, e.g. restored from a pinned table or added by hand.
        report.orphans = {
            let owners = self.ownership.lock();
            let if_index = self.binding.if_index;
            self.table.retain(|flow, _| flow.if_index != if_index || owners.by_flow.contains_key(flow))
        };
        self.stats.add_removed(report.orphans as u64);
        self.stats.increment_reconciliations();

        info!(?report, "reconciliation pass complete");

        if let Some(path) = self.options.pin_path.clone() {
            let table = Arc::clone(&self.table);
            match tokio::task::spawn_blocking(move || pin::pin_table(&path, &table)).await {
                Ok(Ok(n)) => debug!(entries = n, "table pinned"),
                Ok(Err(e)) => warn!(err = %e, "failed to pin table"),
                Err(e) => warn!(err = %e, "pinning task failed"),
            }
        }

        Ok(report)
    }

    fn spawn_reconcile(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.reconcile().await {
                warn!(err = %e, "reconciliation pass failed, retrying at the next interval");
            }
        })
    }

    /// Runs until `cancel` fires: consumes `feed`, handles notifications on a bounded worker
    /// pool and reconciles every `reconcile_interval`, starting with a pass right away.
    ///
    /// On cancellation, queued notifications are discarded and in-flight handlers get
    /// `shutdown_timeout` to finish before they are aborted.
    pub async fn run<F>(self: Arc<Self>, feed: &F, cancel: CancellationToken) -> Result<(), SyncError>
    where
        F: ChangeFeed + ?Sized,
    {
        let mut events = feed.subscribe(&self.options.patterns).await.map_err(SyncError::Subscribe)?;

        info!(
            patterns = ?self.options.patterns,
            prefixes = ?self.options.key_prefixes,
            if_index = self.binding.if_index,
            "synchronizer started"
        );

        let (queue_tx, mut queue) = mpsc::channel::<ChangeEvent>(self.options.queue_size.max(1));

        let adapter = {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = events.next() => event,
                    };

                    let Some(event) = event else {
                        warn!("change feed ended, relying on reconciliation");
                        break;
                    };

                    this.stats.increment_events();
                    if !this.is_interesting(&event.key) {
                        trace!(key = %event.key, "outside the interest filter");
                        this.stats.increment_ignored();
                        continue;
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = queue_tx.send(event) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        let permits = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let mut workers = JoinSet::new();

        let interval = self.options.reconcile_interval;
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconciling = Some(self.spawn_reconcile());

        let mut feed_open = true;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(err = ?e, "notification handler panicked");
                        }
                    }
                }

                _ = ticker.tick() => {
                    if reconciling.as_ref().is_some_and(|task| !task.is_finished()) {
                        debug!("previous reconciliation pass still running, skipping");
                    } else {
                        reconciling = Some(self.spawn_reconcile());
                    }
                }

                event = queue.recv(), if feed_open => {
                    let Some(event) = event else {
                        feed_open = false;
                        continue;
                    };

                    let permit = tokio::select! {
                        _ = cancel.cancelled() => break,
                        permit = Arc::clone(&permits).acquire_owned() => permit,
                    };
                    let Ok(permit) = permit else { break };

                    let this = Arc::clone(&self);
                    workers.spawn(async move {
                        let _permit = permit;
                        // Outcomes are logged and counted by the handler.
                        let _ = this.process(event).await;
                    });
                }
            }
        }

        info!("synchronizer stopping");

        queue.close();
        let mut discarded = 0usize;
        while queue.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "queued notifications discarded, the next start reconciles them");
        }
        let _ = adapter.await;

        let grace = self.options.shutdown_timeout;
        let drained = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
            if let Some(task) = reconciling.as_mut() {
                let _ = task.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(in_flight = workers.len(), ?grace, "grace period expired, aborting handlers");
            workers.abort_all();
            if let Some(task) = reconciling.take() {
                task.abort();
            }
            while workers.join_next().await.is_some() {}
        }

        info!(stats = ?self.stats.snapshot(), "synchronizer stopped");
        Ok(())
    }
}
