//! Per-flow shaping.
//!
//! A [`ShapingTable`] maps every [`FlowKey`](flowem_wire::FlowKey) to the rate, delay and loss
//! it is subject to. One [`ShapingEngine`] per interface enforces the table against the
//! frames its [`EgressTap`] intercepts, scheduling each shaped frame for its
//! earliest departure time. The [`AttachmentManager`] binds engines to interfaces.
//!
//! ```text
//!   synchronizer ──upsert/remove──▶ ShapingTable ◀──lookup── ShapingEngine (per interface)
//!                                                              │       ▲
//!                                                         send │       │ recv
//!                                                              ▼       │
//!                                                              EgressTap
//! ```

mod attach;
pub use attach::{AttachError, AttachHandle, AttachmentManager, ClearReport};

mod engine;
pub use engine::{EngineError, EngineOptions, ShapingEngine, DEFAULT_DRAIN_TIMEOUT};

mod ecn;

pub mod pin;

mod scheduler;
pub use scheduler::{
    DropReason, Scheduler, SchedulerOptions, Verdict, DEFAULT_ECN_HORIZON, DEFAULT_HORIZON,
    DEFAULT_QUEUE_CAPACITY,
};

mod stats;
pub use stats::{EngineStats, EngineStatsSnapshot};

mod table;
pub use table::{Flow, ShapingTable, TableError, Upsert, DEFAULT_TABLE_CAPACITY};

pub mod tap;
pub use tap::{EgressTap, InterfaceInfo, TapBackend};
