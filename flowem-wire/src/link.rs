use std::time::Duration;

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};

use crate::{link_class_handle, parse_mac, DecodeError, ShapingEntry};

/// Default time-to-live of a link declaration in the directory.
pub const DEFAULT_LINK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A link declaration as stored in the directory.
///
/// One record per declared flow. The record does not name an interface: binding a link to an
/// egress interface is a decision of the node that enforces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkLink {
    /// Source hardware address, e.g. `aa:bb:cc:dd:ee:ff`.
    pub source_mac: String,
    /// Destination node identifier.
    pub dest_node_id: i64,
    /// Packet loss rate in `[0, 1]`.
    pub packet_loss_rate: f64,
    /// Bandwidth cap in bits per second, `0` for unlimited.
    pub bandwidth_bps: u64,
    /// Added one-way latency in milliseconds.
    pub delay_ms: u32,
    /// Creation time, RFC3339.
    #[serde(default)]
    pub created_at: String,
}

impl NetworkLink {
    /// Creates a new record stamped with the current time.
    pub fn new(
        source_mac: impl Into<String>,
        dest_node_id: i64,
        packet_loss_rate: f64,
        bandwidth_bps: u64,
        delay_ms: u32,
    ) -> Self {
        Self {
            source_mac: source_mac.into(),
            dest_node_id,
            packet_loss_rate,
            bandwidth_bps,
            delay_ms,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    /// Decodes and validates a record from its JSON representation.
    pub fn from_json(raw: &str) -> Result<Self, DecodeError> {
        let link: Self = serde_json::from_str(raw)?;
        link.validate()?;
        Ok(link)
    }

    pub fn to_json(&self) -> Result<String, DecodeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Checks every field against the range the enforcement layer can represent.
    pub fn validate(&self) -> Result<(), DecodeError> {
        self.source()?;

        if !(0.0..=1.0).contains(&self.packet_loss_rate) {
            return Err(DecodeError::LossOutOfRange(self.packet_loss_rate));
        }

        if self.bandwidth_bps > u32::MAX as u64 {
            return Err(DecodeError::BandwidthOutOfRange(self.bandwidth_bps));
        }

        if self.dest_node_id < 0 || self.dest_node_id > u32::MAX as i64 {
            return Err(DecodeError::InvalidNodeId(self.dest_node_id));
        }

        Ok(())
    }

    /// The parsed source hardware address.
    pub fn source(&self) -> Result<MacAddr, DecodeError> {
        parse_mac(&self.source_mac)
    }

    /// The parsed creation time, if present and well-formed.
    pub fn created_at(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.created_at).ok()
    }

    /// Derives the enforcement parameters for this link.
    pub fn shaping_entry(&self) -> Result<ShapingEntry, DecodeError> {
        self.validate()?;

        Ok(ShapingEntry::new(
            link_class_handle(self.dest_node_id as u32),
            self.bandwidth_bps as u32,
            self.delay_ms,
        )
        .with_loss(self.packet_loss_rate))
    }
}
