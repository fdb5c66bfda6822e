use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::time::Instant;

use flowem_wire::{FlowKey, ShapingEntry};

/// Maximum number of flows a table holds unless configured otherwise.
pub const DEFAULT_TABLE_CAPACITY: usize = 65_535;

type FlowMap = FxHashMap<FlowKey, Arc<Flow>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("shaping table is full ({capacity} flows)")]
    Full { capacity: usize },
}

/// Scheduling state of a flow, carried across parameter updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlowClock {
    /// Earliest time the next packet may start consuming rate credit. `None` means "now".
    pub(crate) next_departure: Option<Instant>,
    /// Departure time of the last packet queued for this flow.
    pub(crate) last_departure: Option<Instant>,
}

/// A shaped flow: its parameters and its scheduling clock.
///
/// The parameters are immutable, updates install a new `Flow` that shares the clock of the
/// previous one, so packets already accounted for keep their place in the schedule.
#[derive(Debug)]
pub struct Flow {
    key: FlowKey,
    entry: ShapingEntry,
    clock: Arc<Mutex<FlowClock>>,
}

impl Flow {
    fn new(key: FlowKey, entry: ShapingEntry) -> Self {
        Self { key, entry, clock: Arc::default() }
    }

    #[inline]
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    #[inline]
    pub fn entry(&self) -> &ShapingEntry {
        &self.entry
    }

    #[inline]
    pub(crate) fn clock(&self) -> &Mutex<FlowClock> {
        &self.clock
    }
}

/// Outcome of [`ShapingTable::upsert`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Upsert {
    /// The flow was not present before.
    Inserted,
    /// The flow existed with different parameters.
    Updated { previous: ShapingEntry },
    /// The flow existed with identical parameters, nothing changed.
    Unchanged,
}

/// The flow table consulted by every shaping engine on a node.
///
/// Reads are a single atomic load of the current map and never wait on writers. Writers
/// (synchronizer, administrative commands) are serialized among themselves and publish a
/// new copy of the map on every mutation, which suits the read-heavy, write-rarely access
/// pattern of a packet path fed by a control plane.
#[derive(Debug)]
pub struct ShapingTable {
    flows: ArcSwap<FlowMap>,
    /// Serializes writers so concurrent copy-on-write updates cannot lose each other.
    write: Mutex<()>,
    capacity: usize,
}

impl Default for ShapingTable {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TABLE_CAPACITY)
    }
}

impl ShapingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { flows: ArcSwap::from_pointee(FlowMap::default()), write: Mutex::new(()), capacity }
    }

    /// Looks up the flow for `key`.
    #[inline]
    pub fn get(&self, key: &FlowKey) -> Option<Arc<Flow>> {
        self.flows.load().get(key).cloned()
    }

    /// Returns the parameters currently installed for `key`.
    pub fn entry(&self, key: &FlowKey) -> Option<ShapingEntry> {
        self.flows.load().get(key).map(|flow| flow.entry)
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.flows.load().contains_key(key)
    }

    /// Installs `entry` for `key`. Applying the same entry twice leaves the table as applying
    /// it once.
    pub fn upsert(&self, key: FlowKey, entry: ShapingEntry) -> Result<Upsert, TableError> {
        let _w = self.write.lock();
        let current = self.flows.load_full();

        let (flow, outcome) = match current.get(&key) {
            Some(existing) if existing.entry == entry => return Ok(Upsert::Unchanged),
            Some(existing) => (
                Flow { key, entry, clock: Arc::clone(&existing.clock) },
                Upsert::Updated { previous: existing.entry },
            ),
            None if current.len() >= self.capacity => {
                return Err(TableError::Full { capacity: self.capacity })
            }
            None => (Flow::new(key, entry), Upsert::Inserted),
        };

        let mut next = FlowMap::clone(&current);
        next.insert(key, Arc::new(flow));
        self.flows.store(Arc::new(next));

        Ok(outcome)
    }

    /// Removes the flow for `key`, returning its parameters if it was present.
    pub fn remove(&self, key: &FlowKey) -> Option<ShapingEntry> {
        let _w = self.write.lock();
        let current = self.flows.load_full();

        let entry = current.get(key)?.entry;
        let mut next = FlowMap::clone(&current);
        next.remove(key);
        self.flows.store(Arc::new(next));

        Some(entry)
    }

    /// Keeps only the flows for which `keep` returns `true`. Returns the number removed.
    pub fn retain(&self, mut keep: impl FnMut(&FlowKey, &ShapingEntry) -> bool) -> usize {
        let _w = self.write.lock();
        let current = self.flows.load_full();

        let mut next = FlowMap::clone(&current);
        next.retain(|key, flow| keep(key, &flow.entry));

        let removed = current.len() - next.len();
        if removed > 0 {
            self.flows.store(Arc::new(next));
        }

        removed
    }

    /// Removes every flow. Returns the number removed.
    pub fn clear(&self) -> usize {
        self.retain(|_, _| false)
    }

    /// Removes every flow bound to the interface `if_index`. Returns the number removed.
    pub fn clear_interface(&self, if_index: u32) -> usize {
        self.retain(|key, _| key.if_index != if_index)
    }

    /// A sorted copy of the table contents.
    pub fn snapshot(&self) -> Vec<(FlowKey, ShapingEntry)> {
        let mut entries: Vec<_> =
            self.flows.load().iter().map(|(key, flow)| (*key, flow.entry)).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.flows.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
