mod daemon;
mod shaping;

/// Shared fixtures.
mod helpers {
    use std::time::Duration;

    use bytes::Bytes;
    use flowem::{
        parse_mac,
        shaper::tap::memory::{ethernet_frame, Departure, DeviceHandle},
        sync::SyncOptions,
    };

    pub(crate) const SHAPED: &str = "aa:bb:cc:dd:ee:ff";
    pub(crate) const UNSHAPED: &str = "02:00:00:00:00:01";

    pub(crate) fn frame(mac: &str, len: usize) -> Bytes {
        ethernet_frame(parse_mac(mac).unwrap(), len)
    }

    pub(crate) fn sync_options() -> SyncOptions {
        SyncOptions {
            retry_interval: Duration::from_millis(10),
            max_retry_interval: Duration::from_millis(100),
            reconcile_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    /// Polls `check` until it holds, failing after two (virtual) seconds.
    pub(crate) async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    /// Receives the next departure from `device`, failing if none comes within a second.
    pub(crate) async fn departure(device: &mut DeviceHandle) -> Departure {
        tokio::time::timeout(Duration::from_secs(1), device.next_departure())
            .await
            .expect("no departure")
            .expect("device closed")
    }
}
