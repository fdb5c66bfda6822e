//! The node daemon: a shaping table kept in step with the link directory and enforced on the
//! configured interfaces.

use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use flowem_shaper::{pin, AttachmentManager, ShapingTable, TapBackend};
use flowem_sync::{ChangeFeed, Directory, FlowBinding, SyncError, Synchronizer};

use crate::{config::Config, owner::PinOwner};

/// Everything a running node owns.
///
/// [`Context::run`] consumes the context, so teardown happens exactly once whichever way the
/// daemon stops.
pub struct Context<B: TapBackend, D, F> {
    config: Config,
    manager: AttachmentManager<B>,
    directory: Arc<D>,
    feed: F,
}

impl<B, D, F> std::fmt::Debug for Context<B, D, F>
where
    B: TapBackend,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("app", &self.config.app.name).finish_non_exhaustive()
    }
}

impl<B, D, F> Context<B, D, F>
where
    B: TapBackend,
    D: Directory,
    F: ChangeFeed,
{
    pub fn new(config: Config, backend: B, directory: Arc<D>, feed: F) -> Self {
        let table = Arc::new(ShapingTable::with_capacity(config.shaper.table_capacity));
        let manager = AttachmentManager::new(backend, table, config.engine_options());

        Self { config, manager, directory, feed }
    }

    pub fn table(&self) -> &Arc<ShapingTable> {
        self.manager.table()
    }

    pub fn manager(&self) -> &AttachmentManager<B> {
        &self.manager
    }

    /// Runs the node until `shutdown` fires or synchronization fails for good.
    ///
    /// Startup claims the pinned table, restores it and attaches every configured interface;
    /// if any attach fails, the ones already made are undone. Shutdown stops synchronization, then
    /// detaches every interface (draining queued packets), then pins the table.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let Self { config, manager, directory, feed } = self;
        let table = Arc::clone(manager.table());

        info!(name = %config.app.name, "starting");

        let bind = config
            .bind_interface()
            .ok_or_else(|| anyhow!("no interface configured in [[shaper.interfaces]]"))?
            .to_string();

        let _owner = match &config.shaper.pin_path {
            Some(path) => Some(PinOwner::acquire(path)?),
            None => None,
        };

        restore(&config, &table);

        if let Err(e) = attach_all(&config, &manager).await {
            manager.detach_all().await;
            return Err(e);
        }

        let Some(if_index) = manager
            .attached()
            .into_iter()
            .find(|handle| handle.interface().name == bind)
            .map(|handle| handle.interface().index)
        else {
            manager.detach_all().await;
            return Err(anyhow!("bound interface {bind} is not attached"));
        };

        let synchronizer = Arc::new(Synchronizer::new(
            directory,
            Arc::clone(&table),
            FlowBinding::new(if_index),
            config.sync_options(),
        ));

        let sync_cancel = shutdown.child_token();
        let mut sync_task: JoinHandle<Result<(), SyncError>> = {
            let synchronizer = Arc::clone(&synchronizer);
            let cancel = sync_cancel.clone();
            tokio::spawn(async move { synchronizer.run(&feed, cancel).await })
        };

        info!(interface = %bind, if_index, "running");

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested");
                sync_cancel.cancel();
                flatten((&mut sync_task).await)
            }
            result = &mut sync_task => flatten(result),
        };

        if let Err(e) = &outcome {
            error!(err = ?e, "synchronization stopped");
        }

        let detached = manager.detach_all().await;
        info!(detached, "interfaces detached");

        if let Some(path) = &config.shaper.pin_path {
            match pin::pin_table(path, &table) {
                Ok(entries) => info!(entries, path = %path.display(), "table pinned"),
                Err(e) => warn!(err = %e, path = %path.display(), "failed to pin table"),
            }
        }

        info!(sync = ?synchronizer.stats().snapshot(), "stopped");
        outcome
    }
}

fn restore(config: &Config, table: &ShapingTable) {
    let Some(path) = &config.shaper.pin_path else {
        return;
    };

    // A corrupt pin only costs the head start: reconciliation rebuilds the table.
    match pin::restore_table(path, table) {
        Ok(0) => {}
        Ok(entries) => info!(entries, path = %path.display(), "restored pinned table"),
        Err(e) => warn!(err = %e, path = %path.display(), "ignoring unreadable pinned table"),
    }
}

async fn attach_all<B: TapBackend>(config: &Config, manager: &AttachmentManager<B>) -> anyhow::Result<()> {
    for iface in &config.shaper.interfaces {
        let handle = manager
            .attach(&iface.name)
            .await
            .with_context(|| format!("failed to attach {}", iface.name))?;

        info!(interface = %handle.interface(), ingress = ?iface.ingress, "shaping");
    }

    Ok(())
}

fn flatten(result: Result<Result<(), SyncError>, tokio::task::JoinError>) -> anyhow::Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e).context("synchronizer failed"),
        Err(e) => Err(anyhow!("synchronizer task failed: {e}")),
    }
}
