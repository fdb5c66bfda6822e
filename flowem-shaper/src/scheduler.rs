//! Earliest-departure-time (EDT) scheduling.
//!
//! Every flow owns a virtual clock, the earliest time its next packet may start consuming
//! rate credit. On arrival a packet is stamped with a departure time computed from that
//! clock, the flow's rate and its fixed delay, and is pushed onto a min-heap shared by all
//! flows of the interface. The dispatch loop releases packets from the heap as their
//! departure time arrives.
//!
//! ```text
//!   start     = max(now, next_departure)
//!   release   = start + size_bits / rate_bps
//!   departure = release + delay
//!   next_departure <- release            (the delay never consumes rate credit)
//! ```
//!
//! A rate of zero skips the rate computation: the packet departs at `now + delay`.
//!
//! Only the wait for rate credit, `start - now`, is bounded: packets that would wait past the
//! horizon are dropped and packets waiting past the ECN horizon are marked. A flow that has been
//! idle always gets its next packet through, however long that packet takes to serialize.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    time::Duration,
};

use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::time::Instant;

use flowem_common::transmission_time;

use crate::{ecn, table::Flow};

/// Default bound on packets waiting in the departure queue of one interface.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Default bound on the rate-induced wait of a single packet.
pub const DEFAULT_HORIZON: Duration = Duration::from_secs(2);

/// Default rate-induced wait from which ECN-capable packets are marked.
pub const DEFAULT_ECN_HORIZON: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum number of packets waiting for departure. Packets arriving while the queue is
    /// full are dropped.
    pub queue_capacity: usize,
    /// Packets whose rate-induced wait would reach this horizon are dropped instead of
    /// queued.
    pub horizon: Duration,
    /// ECN-capable packets waiting at least this long for rate credit get the CE codepoint.
    pub ecn_horizon: Duration,
    /// Seed for the loss draws. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            horizon: DEFAULT_HORIZON,
            ecn_horizon: DEFAULT_ECN_HORIZON,
            seed: None,
        }
    }
}

/// Why a packet was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Selected by the flow's loss draw.
    Loss,
    /// The departure queue was full.
    QueueFull,
    /// The packet would have waited longer than the horizon for rate credit.
    Horizon,
}

/// What happened to a packet offered to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// `marked` is set when the packet left with a newly set CE codepoint.
    Queued { departure: Instant, marked: bool },
    Dropped(DropReason),
}

#[derive(Debug)]
struct Scheduled {
    departure: Instant,
    /// Arrival sequence number, ties on `departure` are released in arrival order.
    seq: u64,
    frame: Bytes,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.departure == other.departure && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.departure.cmp(&other.departure).then(self.seq.cmp(&other.seq))
    }
}

/// The departure queue of one interface.
#[derive(Debug)]
pub struct Scheduler {
    heap: BinaryHeap<Reverse<Scheduled>>,
    seq: u64,
    options: SchedulerOptions,
    rng: StdRng,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self { heap: BinaryHeap::new(), seq: 0, options, rng }
    }

    /// Offers `frame` of `flow`, arriving at `now`, to the schedule.
    pub fn offer(&mut self, flow: &Flow, mut frame: Bytes, now: Instant) -> Verdict {
        let entry = flow.entry();

        if entry.loss > 0.0 && self.rng.gen::<f64>() < entry.loss {
            return Verdict::Dropped(DropReason::Loss);
        }

        if self.heap.len() >= self.options.queue_capacity {
            return Verdict::Dropped(DropReason::QueueFull);
        }

        let delay = Duration::from_millis(entry.delay_ms as u64);
        let mut clock = flow.clock().lock();
        let mut marked = false;

        let departure = if entry.is_rate_limited() {
            let start = clock.next_departure.map_or(now, |next| next.max(now));
            let wait = start.duration_since(now);

            if wait >= self.options.horizon {
                return Verdict::Dropped(DropReason::Horizon);
            }
            if wait >= self.options.ecn_horizon {
                marked = ecn::set_ce(&mut frame);
            }

            let release = start + transmission_time(frame.len(), entry.rate_bps);

            clock.next_departure = Some(release);
            release + delay
        } else {
            now + delay
        };

        // Departures of a flow never move backwards, even when an update lowers its delay.
        let departure = clock.last_departure.map_or(departure, |last| last.max(departure));
        clock.last_departure = Some(departure);

        self.seq = self.seq.wrapping_add(1);
        self.heap.push(Reverse(Scheduled { departure, seq: self.seq, frame }));

        Verdict::Queued { departure, marked }
    }

    /// The departure time of the earliest queued packet.
    #[inline]
    pub fn next_departure(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(s)| s.departure)
    }

    /// Pops the earliest packet if its departure time is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<Bytes> {
        if self.next_departure()? > now {
            return None;
        }

        self.heap.pop().map(|Reverse(s)| s.frame)
    }

    /// Discards every queued packet, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let n = self.heap.len();
        self.heap.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
