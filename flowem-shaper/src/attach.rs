use std::{io, sync::Arc};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowem_common::KeyedLocks;

use crate::{
    engine::{EngineError, EngineOptions, ShapingEngine},
    stats::EngineStats,
    table::ShapingTable,
    tap::{InterfaceInfo, TapBackend},
};

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("unknown interface: {0}")]
    UnknownInterface(String),
    #[error("unsupported interception point: {0}")]
    Unsupported(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("shaping engine on {interface} failed: {reason}")]
    EngineFailed { interface: String, reason: String },
}

/// A running engine bound to an interface.
#[derive(Debug, Clone)]
pub struct AttachHandle {
    interface: InterfaceInfo,
    stats: Arc<EngineStats>,
}

impl AttachHandle {
    pub fn interface(&self) -> &InterfaceInfo {
        &self.interface
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }
}

/// Outcome of [`AttachmentManager::clear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearReport {
    /// Table entries removed for the interface.
    pub removed: usize,
    /// Whether an engine was attached and has been stopped.
    pub detached: bool,
}

struct Attachment {
    handle: AttachHandle,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), EngineError>>,
}

/// Binds shaping engines to interfaces.
///
/// Lifecycle operations are idempotent and serialized per interface: two operations on the
/// same interface never overlap, operations on different interfaces run independently.
pub struct AttachmentManager<B: TapBackend> {
    backend: B,
    table: Arc<ShapingTable>,
    options: EngineOptions,
    locks: KeyedLocks<String>,
    attachments: Mutex<FxHashMap<String, Attachment>>,
}

impl<B: TapBackend> AttachmentManager<B> {
    pub fn new(backend: B, table: Arc<ShapingTable>, options: EngineOptions) -> Self {
        Self {
            backend,
            table,
            options,
            locks: KeyedLocks::new(),
            attachments: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn table(&self) -> &Arc<ShapingTable> {
        &self.table
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Attaches a shaping engine to `interface`. Attaching an interface that is already
    /// attached returns the existing handle.
    pub async fn attach(&self, interface: &str) -> Result<AttachHandle, AttachError> {
        let _guard = self.locks.lock(interface.to_string()).await;

        let exited = {
            let mut attachments = self.attachments.lock();
            match attachments.get(interface) {
                Some(existing) if !existing.task.is_finished() => {
                    return Ok(existing.handle.clone());
                }
                Some(_) => attachments.remove(interface),
                None => None,
            }
        };

        if let Some(exited) = exited {
            warn!(interface, "shaping engine had exited, attaching again");
            reap(interface, exited.task).await;
        }

        let info = self.backend.resolve(interface).await?;
        let tap = self.backend.open(&info).await?;

        let engine = ShapingEngine::new(info.index, Arc::clone(&self.table), self.options.clone());
        let handle = AttachHandle { interface: info, stats: engine.stats() };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(engine.run(tap, cancel.clone()));

        info!(interface = %handle.interface, "attached");

        self.attachments
            .lock()
            .insert(interface.to_string(), Attachment { handle: handle.clone(), cancel, task });

        Ok(handle)
    }

    /// Detaches the engine from `interface`, draining its queue. Returns whether an engine
    /// was attached; detaching an unattached interface succeeds.
    pub async fn detach(&self, interface: &str) -> Result<bool, AttachError> {
        let _guard = self.locks.lock(interface.to_string()).await;
        self.detach_locked(interface).await
    }

    async fn detach_locked(&self, interface: &str) -> Result<bool, AttachError> {
        let Some(attachment) = self.attachments.lock().remove(interface) else {
            debug!(interface, "not attached");
            return Ok(false);
        };

        attachment.cancel.cancel();
        match attachment.task.await {
            Ok(Ok(())) => {
                info!(interface, stats = ?attachment.handle.stats.snapshot(), "detached");
                Ok(true)
            }
            Ok(Err(e)) => {
                warn!(interface, err = ?e, "engine stopped with an error");
                Ok(true)
            }
            Err(e) => Err(AttachError::EngineFailed {
                interface: interface.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Removes every table entry of `interface` and detaches it.
    pub async fn clear(&self, interface: &str) -> Result<ClearReport, AttachError> {
        let _guard = self.locks.lock(interface.to_string()).await;

        let attached = self.attachments.lock().get(interface).map(|a| a.handle.interface.index);
        let if_index = match attached {
            Some(index) => index,
            None => self.backend.resolve(interface).await?.index,
        };

        let removed = self.table.clear_interface(if_index);
        let detached = self.detach_locked(interface).await?;

        info!(interface, removed, detached, "cleared");

        Ok(ClearReport { removed, detached })
    }

    /// Detaches every attached interface. Returns how many were detached.
    pub async fn detach_all(&self) -> usize {
        let names: Vec<String> = self.attachments.lock().keys().cloned().collect();

        let mut detached = 0;
        for name in names {
            match self.detach(&name).await {
                Ok(true) => detached += 1,
                Ok(false) => {}
                Err(e) => error!(interface = %name, err = ?e, "failed to detach"),
            }
        }

        detached
    }

    pub fn is_attached(&self, interface: &str) -> bool {
        self.attachments.lock().get(interface).is_some_and(|a| !a.task.is_finished())
    }

    /// Handles of every attached interface, sorted by name.
    pub fn attached(&self) -> Vec<AttachHandle> {
        let mut handles: Vec<_> =
            self.attachments.lock().values().map(|a| a.handle.clone()).collect();
        handles.sort_by(|a, b| a.interface.name.cmp(&b.interface.name));
        handles
    }
}

async fn reap(interface: &str, task: JoinHandle<Result<(), EngineError>>) {
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(interface, err = ?e, "previous engine failed"),
        Err(e) => error!(interface, err = ?e, "previous engine panicked"),
    }
}
