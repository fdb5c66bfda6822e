//! Data model and encodings shared by every flowem component.
//!
//! - [`FlowKey`] and [`ShapingEntry`]: the enforcement table's key and value, with their fixed
//!   binary layouts (10 and 12 bytes).
//! - [`NetworkLink`]: the operator-facing record stored in the link directory, encoded as JSON.
//! - [`ChangeEvent`]: a decoded change feed notification.

use thiserror::Error;

mod event;
pub use event::{ChangeEvent, EventKind};

mod flow;
pub use flow::{link_class_handle, parse_mac, FlowKey, ShapingEntry};

mod link;
pub use link::{NetworkLink, DEFAULT_LINK_TTL};

pub use pnet::util::MacAddr;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("invalid hardware address: {0:?}")]
    InvalidMac(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("packet loss rate {0} is outside [0, 1]")]
    LossOutOfRange(f64),
    #[error("bandwidth {0} bps does not fit the enforcement table")]
    BandwidthOutOfRange(u64),
    #[error("invalid destination node id: {0}")]
    InvalidNodeId(i64),
    #[error("unknown event kind: {0:?}")]
    UnknownEventKind(String),
    #[error("malformed notification channel: {0:?}")]
    MalformedChannel(String),
}
