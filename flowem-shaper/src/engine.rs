use std::{io, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::future;
use pnet::packet::ethernet::EthernetPacket;
use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use flowem_wire::FlowKey;

use crate::{
    scheduler::{Scheduler, SchedulerOptions, Verdict},
    stats::EngineStats,
    table::ShapingTable,
    tap::EgressTap,
};

/// Default time the dispatch loop keeps releasing queued packets after shutdown was requested.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("interception point failed: {0}")]
    Tap(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub scheduler: SchedulerOptions,
    /// Upper bound on the shutdown drain. Packets still queued afterwards are discarded.
    pub drain_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { scheduler: SchedulerOptions::default(), drain_timeout: DEFAULT_DRAIN_TIMEOUT }
    }
}

/// The enforcement core of one interface.
///
/// Every frame read from the tap is matched against the shared [`ShapingTable`] by its
/// [`FlowKey`]: frames without an entry are forwarded untouched, the others go through the
/// [`Scheduler`] and leave once their departure time has come.
pub struct ShapingEngine {
    if_index: u32,
    table: Arc<ShapingTable>,
    scheduler: Scheduler,
    drain_timeout: Duration,
    stats: Arc<EngineStats>,
}

impl ShapingEngine {
    pub fn new(if_index: u32, table: Arc<ShapingTable>, options: EngineOptions) -> Self {
        Self {
            if_index,
            table,
            scheduler: Scheduler::new(options.scheduler),
            drain_timeout: options.drain_timeout,
            stats: Arc::new(EngineStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    /// Runs the dispatch loop until `cancel` fires or the tap closes, then drains the queue.
    pub async fn run<T: EgressTap>(
        mut self,
        mut tap: T,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        debug!(if_index = self.if_index, "shaping engine started");

        let mut failure = None;

        loop {
            let next = self.scheduler.next_departure();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = async {
                    match next {
                        Some(at) => sleep_until(at).await,
                        None => future::pending().await,
                    }
                } => {
                    self.flush(&mut tap, Instant::now()).await;
                }

                frame = tap.recv() => match frame {
                    Ok(Some(frame)) => self.on_frame(&mut tap, frame).await,
                    Ok(None) => {
                        debug!(if_index = self.if_index, "interception point closed");
                        break;
                    }
                    Err(e) => {
                        error!(if_index = self.if_index, err = ?e, "failed to read from interception point");
                        failure = Some(e);
                        break;
                    }
                },
            }
        }

        self.drain(&mut tap).await;

        debug!(if_index = self.if_index, stats = ?self.stats.snapshot(), "shaping engine stopped");

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn on_frame<T: EgressTap>(&mut self, tap: &mut T, frame: Bytes) {
        self.stats.increment_received();

        let Some(source) = EthernetPacket::new(&frame).map(|eth| eth.get_source()) else {
            trace!(if_index = self.if_index, len = frame.len(), "dropping malformed frame");
            self.stats.increment_malformed();
            return;
        };

        let key = FlowKey::new(self.if_index, source);
        let Some(flow) = self.table.get(&key) else {
            self.stats.increment_bypassed();
            self.forward(tap, frame).await;
            return;
        };

        match self.scheduler.offer(&flow, frame, Instant::now()) {
            Verdict::Queued { departure, marked } => {
                trace!(%key, ?departure, marked, queued = self.scheduler.len(), "scheduled");
                if marked {
                    self.stats.increment_ecn_marked();
                }
            }
            Verdict::Dropped(reason) => {
                trace!(%key, ?reason, "dropped");
                self.stats.increment_dropped(reason);
            }
        }
    }

    /// Forwards every packet due at `now`.
    async fn flush<T: EgressTap>(&mut self, tap: &mut T, now: Instant) {
        while let Some(frame) = self.scheduler.pop_due(now) {
            self.forward(tap, frame).await;
        }
    }

    async fn forward<T: EgressTap>(&mut self, tap: &mut T, frame: Bytes) {
        match tap.send(frame).await {
            Ok(()) => self.stats.increment_forwarded(),
            Err(e) => {
                warn!(if_index = self.if_index, err = ?e, "failed to transmit frame");
                self.stats.increment_send_errors();
            }
        }
    }

    async fn drain<T: EgressTap>(&mut self, tap: &mut T) {
        let deadline = Instant::now() + self.drain_timeout;

        while let Some(next) = self.scheduler.next_departure() {
            if next > deadline {
                break;
            }

            sleep_until(next).await;
            self.flush(tap, next).await;
        }

        let discarded = self.scheduler.clear();
        if discarded > 0 {
            warn!(if_index = self.if_index, discarded, "drain deadline passed, discarding queued packets");
            self.stats.add_dropped_shutdown(discarded as u64);
        }
    }
}
