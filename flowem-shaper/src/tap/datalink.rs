use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use pnet::datalink::{self, Channel, Config, DataLinkReceiver, DataLinkSender, NetworkInterface};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{EgressTap, InterfaceInfo, TapBackend};
use crate::AttachError;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_BUFFER: usize = 1024;

/// Raw-socket interception through `pnet::datalink`.
///
/// Attaching egress interface `eth0` with ingress `veth-host` captures every frame arriving
/// on `veth-host` and transmits the shaped result on `eth0`. Both sockets need `CAP_NET_RAW`.
#[derive(Debug, Clone)]
pub struct PnetBackend {
    /// Egress interface name to the interface frames are captured on.
    ingress: FxHashMap<String, String>,
    read_timeout: Duration,
    buffer: usize,
}

impl Default for PnetBackend {
    fn default() -> Self {
        Self { ingress: FxHashMap::default(), read_timeout: DEFAULT_READ_TIMEOUT, buffer: DEFAULT_BUFFER }
    }
}

impl PnetBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the traffic to shape on `egress` from `ingress`.
    pub fn with_ingress(mut self, egress: impl Into<String>, ingress: impl Into<String>) -> Self {
        self.ingress.insert(egress.into(), ingress.into());
        self
    }

    /// Sets how often the capture thread wakes up to check whether its tap was dropped.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    fn find(name: &str) -> Result<NetworkInterface, AttachError> {
        datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == name)
            .ok_or_else(|| AttachError::UnknownInterface(name.to_string()))
    }

    fn channel(
        &self,
        iface: &NetworkInterface,
    ) -> Result<(Box<dyn DataLinkSender>, Box<dyn DataLinkReceiver>), AttachError> {
        let config = Config { read_timeout: Some(self.read_timeout), ..Default::default() };

        match datalink::channel(iface, config)? {
            Channel::Ethernet(tx, rx) => Ok((tx, rx)),
            _ => Err(AttachError::Unsupported(format!("{}: not an Ethernet channel", iface.name))),
        }
    }
}

#[async_trait]
impl TapBackend for PnetBackend {
    type Tap = PnetTap;

    async fn resolve(&self, interface: &str) -> Result<InterfaceInfo, AttachError> {
        let iface = Self::find(interface)?;
        Ok(InterfaceInfo { name: iface.name, index: iface.index })
    }

    async fn open(&self, interface: &InterfaceInfo) -> Result<Self::Tap, AttachError> {
        let ingress_name = self.ingress.get(&interface.name).ok_or_else(|| {
            AttachError::Unsupported(format!("no ingress interface configured for {}", interface.name))
        })?;

        let egress = Self::find(&interface.name)?;
        let ingress = Self::find(ingress_name)?;

        // Both channels are opened before anything is spawned, so a failure leaves nothing
        // running.
        let (tx, _) = self.channel(&egress)?;
        let (_, rx) = self.channel(&ingress)?;

        let (frames_tx, frames_rx) = mpsc::channel(self.buffer);
        let stop = Arc::new(AtomicBool::new(false));

        let name = ingress.name.clone();
        let thread_stop = Arc::clone(&stop);
        thread::Builder::new()
            .name(format!("flowem-capture-{name}"))
            .spawn(move || capture(name, rx, frames_tx, thread_stop))?;

        debug!(egress = %interface, ingress = %ingress_name, "raw socket tap opened");

        Ok(PnetTap { frames: frames_rx, tx, stop })
    }
}

/// Reads frames off the ingress socket until the tap is dropped.
fn capture(
    name: String,
    mut rx: Box<dyn DataLinkReceiver>,
    frames: mpsc::Sender<io::Result<Bytes>>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        let item = match rx.next() {
            Ok(frame) => Ok(Bytes::copy_from_slice(frame)),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                continue
            }
            Err(e) => {
                error!(interface = %name, err = ?e, "capture failed");
                Err(e)
            }
        };

        let failed = item.is_err();
        if frames.blocking_send(item).is_err() || failed {
            break;
        }
    }

    debug!(interface = %name, "capture thread stopped");
}

/// A tap backed by a pair of raw sockets.
pub struct PnetTap {
    frames: mpsc::Receiver<io::Result<Bytes>>,
    tx: Box<dyn DataLinkSender>,
    stop: Arc<AtomicBool>,
}

#[async_trait]
impl EgressTap for PnetTap {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        self.frames.recv().await.transpose()
    }

    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.tx
            .send_to(&frame, None)
            .unwrap_or_else(|| Err(io::Error::other("raw socket transmit unavailable")))
    }
}

impl Drop for PnetTap {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
