//! Directory declarations enforced end to end: memory directory, synchronizer, engine.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use flowem::{
    shaper::{
        tap::memory::{DeviceHandle, MemoryBackend},
        AttachmentManager, EngineOptions, ShapingTable,
    },
    sync::{put_link, Directory, FlowBinding, MemoryDirectory, SyncError, Synchronizer},
    FlowKey, NetworkLink,
};

use crate::helpers::{departure, eventually, frame, sync_options, SHAPED, UNSHAPED};

struct Node {
    directory: MemoryDirectory,
    table: Arc<ShapingTable>,
    manager: AttachmentManager<MemoryBackend>,
    device: DeviceHandle,
    cancel: CancellationToken,
    sync: JoinHandle<Result<(), SyncError>>,
}

impl Node {
    async fn start() -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let directory = MemoryDirectory::new();
        let backend = MemoryBackend::new();
        let device = backend.add_device("eth0", 2);
        let table = Arc::new(ShapingTable::new());
        let manager = AttachmentManager::new(backend, Arc::clone(&table), EngineOptions::default());
        let handle = manager.attach("eth0").await.unwrap();

        let synchronizer = Arc::new(Synchronizer::new(
            Arc::new(directory.clone()),
            Arc::clone(&table),
            FlowBinding::new(handle.interface().index),
            sync_options(),
        ));

        let cancel = CancellationToken::new();
        let sync = tokio::spawn({
            let feed = directory.clone();
            let cancel = cancel.clone();
            async move { synchronizer.run(&feed, cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        Self { directory, table, manager, device, cancel, sync }
    }

    fn flow(&self, mac: &str) -> FlowKey {
        FlowKey::new(2, flowem::parse_mac(mac).unwrap())
    }

    async fn declare(&self, key: &str, link: &NetworkLink) {
        put_link(&self.directory, key, link, None).await.unwrap();
        let flow = self.flow(&link.source_mac);
        let expected = link.shaping_entry().unwrap();
        eventually("declaration", || self.table.entry(&flow) == Some(expected)).await;
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.sync.await.unwrap().unwrap();
        self.manager.detach_all().await;
    }
}

#[tokio::test(start_paused = true)]
async fn declared_delay_is_enforced() {
    let mut node = Node::start().await;
    node.declare("network_link:1", &NetworkLink::new(SHAPED, 7, 0.0, 0, 20)).await;

    let sent = Instant::now();
    node.device.transmit(frame(SHAPED, 100));
    let shaped = departure(&mut node.device).await;
    assert!(shaped.at - sent >= Duration::from_millis(20), "left after {:?}", shaped.at - sent);

    // Flows without a declaration are not delayed.
    let sent = Instant::now();
    node.device.transmit(frame(UNSHAPED, 100));
    let bypassed = departure(&mut node.device).await;
    assert!(bypassed.at - sent < Duration::from_millis(1));

    node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn declared_rate_paces_departures() {
    let mut node = Node::start().await;
    // 1000-byte frames at 8 Mbit/s take 1 ms each.
    node.declare("network_link:1", &NetworkLink::new(SHAPED, 7, 0.0, 8_000_000, 0)).await;

    let sent = Instant::now();
    for _ in 0..10 {
        node.device.transmit(frame(SHAPED, 1000));
    }

    let mut departures = Vec::new();
    for _ in 0..10 {
        departures.push(departure(&mut node.device).await.at);
    }

    for pair in departures.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(1) - Duration::from_micros(1));
    }
    assert!(*departures.last().unwrap() - sent >= Duration::from_millis(10) - Duration::from_micros(1));

    node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn declared_loss_drops_frames() {
    let mut node = Node::start().await;
    node.declare("network_link:1", &NetworkLink::new(SHAPED, 7, 1.0, 0, 0)).await;

    for _ in 0..20 {
        node.device.transmit(frame(SHAPED, 100));
    }
    node.device.transmit(frame(UNSHAPED, 100));

    // Only the unshaped frame makes it.
    let only = departure(&mut node.device).await;
    assert_eq!(&only.frame[6..12], &[0x02, 0, 0, 0, 0, 0x01]);

    let stats = node.manager.attached()[0].stats().snapshot();
    assert_eq!(stats.dropped_loss, 20);

    node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn deleting_a_declaration_restores_the_flow() {
    let mut node = Node::start().await;
    node.declare("network_link:1", &NetworkLink::new(SHAPED, 7, 0.0, 0, 50)).await;

    node.directory.delete("network_link:1").await.unwrap();
    let flow = node.flow(SHAPED);
    eventually("removal", || !node.table.contains(&flow)).await;

    let sent = Instant::now();
    node.device.transmit(frame(SHAPED, 100));
    assert!(departure(&mut node.device).await.at - sent < Duration::from_millis(1));

    node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn updates_apply_to_the_next_frames() {
    let mut node = Node::start().await;
    node.declare("network_link:1", &NetworkLink::new(SHAPED, 7, 0.0, 0, 10)).await;
    node.declare("network_link:1", &NetworkLink::new(SHAPED, 7, 0.0, 0, 40)).await;

    let sent = Instant::now();
    node.device.transmit(frame(SHAPED, 100));
    assert!(departure(&mut node.device).await.at - sent >= Duration::from_millis(40));

    node.stop().await;
}
