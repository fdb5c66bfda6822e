use std::time::Duration;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::time::Instant;

use flowem_shaper::{Scheduler, SchedulerOptions, ShapingTable};
use flowem_wire::{FlowKey, MacAddr, ShapingEntry};

const N_PACKETS: usize = 10_000;
const PACKET_SIZE: usize = 1500;

fn setup(flows: usize) -> (ShapingTable, Vec<FlowKey>) {
    let table = ShapingTable::new();
    let keys: Vec<_> = (0..flows)
        .map(|i| FlowKey::new(1, MacAddr::new(0x02, 0, 0, 0, (i >> 8) as u8, i as u8)))
        .collect();

    for key in &keys {
        table.upsert(*key, ShapingEntry::new(1, 100_000_000, 10).with_loss(0.01)).unwrap();
    }

    (table, keys)
}

/// Offer and release `N_PACKETS` spread over a growing number of flows: table lookup,
/// loss draw, departure computation and heap maintenance.
fn offer_and_release(c: &mut Criterion) {
    let _ = tracing_subscriber::fmt::try_init();

    let frame = Bytes::from(vec![0u8; PACKET_SIZE]);
    let mut group = c.benchmark_group("scheduler");
    group.throughput(Throughput::Elements(N_PACKETS as u64));

    for flows in [1, 64, 4096] {
        let (table, keys) = setup(flows);

        group.bench_with_input(BenchmarkId::new("offer_and_release", flows), &flows, |b, _| {
            b.iter(|| {
                let mut scheduler = Scheduler::new(SchedulerOptions {
                    queue_capacity: N_PACKETS,
                    seed: Some(1),
                    ..Default::default()
                });

                let now = Instant::now();
                for i in 0..N_PACKETS {
                    let flow = table.get(&keys[i % keys.len()]).unwrap();
                    scheduler.offer(&flow, frame.clone(), now);
                }

                let end = now + Duration::from_secs(60);
                while scheduler.pop_due(end).is_some() {}
            })
        });
    }

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default().warm_up_time(Duration::from_secs(1));
    targets = offer_and_release
}

criterion_main!(benches);
