//! The node daemon over in-process backends.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use flowem::{
    config::Config,
    daemon::Context,
    owner, parse_mac,
    shaper::{pin, tap::memory::MemoryBackend},
    sync::{put_link, MemoryDirectory},
    FlowKey, NetworkLink, ShapingEntry,
};

use crate::helpers::{departure, eventually, frame, SHAPED};

fn pin_path(test: &str) -> PathBuf {
    std::env::temp_dir().join(format!("flowem-it-{test}-{}.pin", std::process::id()))
}

fn config(pin_path: &PathBuf, interfaces: &[&str]) -> Config {
    let mut toml = format!(
        r#"
        [sync]
        retry_interval_ms = 10
        max_retry_interval_ms = 100
        reconcile_interval_secs = 1
        shutdown_timeout_secs = 1

        [shaper]
        pin_path = "{}"
        "#,
        pin_path.display()
    );
    for name in interfaces {
        toml.push_str(&format!("\n[[shaper.interfaces]]\nname = \"{name}\"\n"));
    }

    Config::from_toml(&toml).unwrap()
}

fn flow(if_index: u32, mac: &str) -> FlowKey {
    FlowKey::new(if_index, parse_mac(mac).unwrap())
}

#[tokio::test(start_paused = true)]
async fn daemon_restores_enforces_and_pins() {
    let _ = tracing_subscriber::fmt::try_init();
    let path = pin_path("lifecycle");

    let shaped = flow(2, SHAPED);
    let orphan = flow(2, "02:00:00:00:00:99");
    let foreign = flow(9, "02:00:00:00:00:99");
    pin::save(&path, &[(orphan, ShapingEntry::new(1, 0, 5)), (foreign, ShapingEntry::new(1, 0, 5))]).unwrap();

    let directory = MemoryDirectory::new();
    put_link(&directory, "network_link:1", &NetworkLink::new(SHAPED, 7, 0.0, 0, 20), None).await.unwrap();

    let backend = MemoryBackend::new();
    let mut eth0 = backend.add_device("eth0", 2);

    let context = Context::new(config(&path, &["eth0"]), backend, Arc::new(directory.clone()), directory);
    let table = Arc::clone(context.table());
    assert!(table.is_empty());

    let shutdown = CancellationToken::new();
    let daemon = tokio::spawn(context.run(shutdown.clone()));

    // The startup pass installs the declaration and drops what no key declares on eth0.
    eventually("reconciliation", || table.contains(&shaped) && !table.contains(&orphan)).await;
    assert!(table.contains(&foreign));
    assert_eq!(owner::owner(&path), Some(std::process::id()));

    let sent = Instant::now();
    eth0.transmit(frame(SHAPED, 100));
    assert!(departure(&mut eth0).await.at - sent >= Duration::from_millis(20));

    shutdown.cancel();
    daemon.await.unwrap().unwrap();
    assert_eq!(owner::owner(&path), None);

    let mut pinned: Vec<_> = pin::load(&path).unwrap().unwrap().into_iter().map(|(key, _)| key).collect();
    pinned.sort();
    let mut expected = vec![shaped, foreign];
    expected.sort();
    assert_eq!(pinned, expected);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test(start_paused = true)]
async fn failed_attach_undoes_earlier_attaches() {
    let path = pin_path("failed-attach");
    let directory = MemoryDirectory::new();

    let backend = MemoryBackend::new();
    let mut eth0 = backend.add_device("eth0", 2);

    let context = Context::new(config(&path, &["eth0", "eth1"]), backend, Arc::new(directory.clone()), directory);
    let err = context.run(CancellationToken::new()).await.unwrap_err();
    assert!(format!("{err:#}").contains("eth1"), "{err:#}");

    // Nothing intercepts eth0 anymore.
    eth0.transmit(frame(SHAPED, 100));
    let next = tokio::time::timeout(Duration::from_millis(100), eth0.next_departure()).await;
    assert!(!matches!(next, Ok(Some(_))));

    let _ = std::fs::remove_file(&path);
}

#[tokio::test(start_paused = true)]
async fn second_daemon_refuses_an_owned_pin() {
    let path = pin_path("owned");
    let claim = owner::PinOwner::acquire(&path).unwrap();

    let directory = MemoryDirectory::new();
    let backend = MemoryBackend::new();
    let _eth0 = backend.add_device("eth0", 2);

    let context = Context::new(config(&path, &["eth0"]), backend, Arc::new(directory.clone()), directory);
    let err = context.run(CancellationToken::new()).await.unwrap_err();
    assert!(format!("{err:#}").contains("owned by a running daemon"), "{err:#}");

    drop(claim);
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn daemon_needs_an_interface() {
    let path = pin_path("no-interface");
    let directory = MemoryDirectory::new();

    let context = Context::new(config(&path, &[]), MemoryBackend::new(), Arc::new(directory.clone()), directory);
    assert!(context.run(CancellationToken::new()).await.is_err());
}
