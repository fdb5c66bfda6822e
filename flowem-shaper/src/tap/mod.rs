//! Egress interception points.
//!
//! A tap hands every frame about to leave an interface to the shaping engine, and puts
//! back on the wire whatever the engine releases. Backends decide how frames are
//! intercepted:
//!
//! - [`memory`]: in-process virtual devices, driven by a [`memory::DeviceHandle`].
//! - [`datalink`]: raw sockets through `pnet`. Frames captured on an ingress interface
//!   (e.g. the host end of a veth pair applications send into) are shaped and transmitted on
//!   the egress interface.

use std::{fmt, io};

use async_trait::async_trait;
use bytes::Bytes;

use crate::AttachError;

pub mod datalink;
pub mod memory;

/// An interface resolved by a [`TapBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceInfo {
    pub name: String,
    pub index: u32,
}

impl fmt::Display for InterfaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.name, self.index)
    }
}

/// The egress hook of one interface.
#[async_trait]
pub trait EgressTap: Send + 'static {
    /// Receives the next intercepted frame. Returns `None` once the tap is closed.
    ///
    /// Must be cancel safe: the dispatch loop races it against timers.
    async fn recv(&mut self) -> io::Result<Option<Bytes>>;

    /// Puts a frame on the wire.
    async fn send(&mut self, frame: Bytes) -> io::Result<()>;
}

/// Resolves interfaces and opens taps on them.
#[async_trait]
pub trait TapBackend: Send + Sync + 'static {
    type Tap: EgressTap;

    /// Looks up an interface by name.
    async fn resolve(&self, interface: &str) -> Result<InterfaceInfo, AttachError>;

    /// Opens the interception point of a resolved interface.
    async fn open(&self, interface: &InterfaceInfo) -> Result<Self::Tap, AttachError>;
}
