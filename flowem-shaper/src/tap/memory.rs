use std::{io, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pnet::{
    packet::ethernet::{EtherTypes, MutableEthernetPacket},
    util::MacAddr,
};
use rustc_hash::FxHashMap;
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    time::Instant,
};

use super::{EgressTap, InterfaceInfo, TapBackend};
use crate::AttachError;

/// A frame put on the (virtual) wire, with the time it left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub at: Instant,
    pub frame: Bytes,
}

#[derive(Debug)]
struct Device {
    index: u32,
    outbound: Arc<AsyncMutex<mpsc::UnboundedReceiver<Bytes>>>,
    wire: mpsc::UnboundedSender<Departure>,
}

/// A backend of in-process virtual devices.
///
/// Each device behaves like a network interface: frames written through its
/// [`DeviceHandle`] are intercepted by whatever engine is attached, and the frames the
/// engine releases show up on the handle's wire side, stamped with their departure time.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    devices: Arc<Mutex<FxHashMap<String, Device>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a virtual device named `name` with interface index `index`.
    pub fn add_device(&self, name: impl Into<String>, index: u32) -> DeviceHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();

        let device =
            Device { index, outbound: Arc::new(AsyncMutex::new(outbound_rx)), wire: wire_tx };
        self.devices.lock().insert(name.into(), device);

        DeviceHandle { index, outbound: outbound_tx, wire: wire_rx }
    }
}

#[async_trait]
impl TapBackend for MemoryBackend {
    type Tap = MemoryTap;

    async fn resolve(&self, interface: &str) -> Result<InterfaceInfo, AttachError> {
        let devices = self.devices.lock();
        let device =
            devices.get(interface).ok_or_else(|| AttachError::UnknownInterface(interface.into()))?;

        Ok(InterfaceInfo { name: interface.to_string(), index: device.index })
    }

    async fn open(&self, interface: &InterfaceInfo) -> Result<Self::Tap, AttachError> {
        let devices = self.devices.lock();
        let device = devices
            .get(&interface.name)
            .ok_or_else(|| AttachError::UnknownInterface(interface.name.clone()))?;

        Ok(MemoryTap { outbound: Arc::clone(&device.outbound), wire: device.wire.clone() })
    }
}

/// The tap of a virtual device.
#[derive(Debug)]
pub struct MemoryTap {
    outbound: Arc<AsyncMutex<mpsc::UnboundedReceiver<Bytes>>>,
    wire: mpsc::UnboundedSender<Departure>,
}

#[async_trait]
impl EgressTap for MemoryTap {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.outbound.lock().await.recv().await)
    }

    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.wire
            .send(Departure { at: Instant::now(), frame })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "wire side closed"))
    }
}

/// Builds an IPv4-typed Ethernet frame of `len` bytes (at least a header) sent by `source`.
pub fn ethernet_frame(source: MacAddr, len: usize) -> Bytes {
    let mut buf = vec![0u8; len.max(MutableEthernetPacket::minimum_packet_size())];
    if let Some(mut eth) = MutableEthernetPacket::new(&mut buf) {
        eth.set_destination(MacAddr::broadcast());
        eth.set_source(source);
        eth.set_ethertype(EtherTypes::Ipv4);
    }

    Bytes::from(buf)
}

/// The application and wire sides of a virtual device.
#[derive(Debug)]
pub struct DeviceHandle {
    index: u32,
    outbound: mpsc::UnboundedSender<Bytes>,
    wire: mpsc::UnboundedReceiver<Departure>,
}

impl DeviceHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Writes a frame into the device, as an application sending through it would.
    pub fn transmit(&self, frame: impl Into<Bytes>) {
        // The receiver lives as long as the backend.
        let _ = self.outbound.send(frame.into());
    }

    /// Waits for the next frame leaving the device.
    pub async fn next_departure(&mut self) -> Option<Departure> {
        self.wire.recv().await
    }

    /// Returns every frame that has left the device so far.
    pub fn drain_departures(&mut self) -> Vec<Departure> {
        let mut out = Vec::new();
        while let Ok(departure) = self.wire.try_recv() {
            out.push(departure);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_flow_through_the_tap() {
        let backend = MemoryBackend::new();
        let mut handle = backend.add_device("veth0", 4);

        let info = backend.resolve("veth0").await.unwrap();
        assert_eq!(info.index, 4);

        let mut tap = backend.open(&info).await.unwrap();
        handle.transmit(Bytes::from_static(b"frame"));

        let frame = tap.recv().await.unwrap().unwrap();
        tap.send(frame).await.unwrap();

        let departure = handle.next_departure().await.unwrap();
        assert_eq!(departure.frame, Bytes::from_static(b"frame"));
    }

    #[test]
    fn frames_carry_their_source() {
        let source = MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff);
        let frame = ethernet_frame(source, 4);

        assert_eq!(frame.len(), 14);
        let eth = pnet::packet::ethernet::EthernetPacket::new(&frame).unwrap();
        assert_eq!(eth.get_source(), source);
    }

    #[tokio::test]
    async fn unknown_device() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.resolve("nope").await,
            Err(AttachError::UnknownInterface(name)) if name == "nope"
        ));
    }
}
