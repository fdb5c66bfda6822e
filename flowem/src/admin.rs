//! Administrative commands: the pinned table and the link directory.

use std::{fmt::Write as _, path::Path, time::Instant};

use anyhow::{bail, Context};
use rand::Rng;
use tracing::info;

use flowem::{config::Config, owner};
use flowem_common::constants::MBIT;
use flowem_shaper::{pin, tap::datalink::PnetBackend, ShapingTable, TapBackend, Upsert};
use flowem_sync::{get_link, link_key, put_link, Directory, RedisDirectory};
use flowem_wire::{parse_mac, FlowKey, NetworkLink, ShapingEntry};

use crate::cli::{AddArgs, LinkCommand, PutArgs, SeedArgs, TableCommand};

pub(crate) async fn table(config: &Config, command: TableCommand) -> anyhow::Result<()> {
    let Some(path) = config.shaper.pin_path.as_deref() else {
        bail!("table pinning is disabled, set shaper.pin_path");
    };

    if !matches!(command, TableCommand::View) {
        owner::ensure_unowned(path)?;
    }

    match command {
        TableCommand::View => {
            if let Some(pid) = owner::owner(path) {
                eprintln!("note: daemon pid {pid} is running, this is its table as of its last pin");
            }
            let entries = pin::load(path)?.unwrap_or_default();
            print!("{}", render(&entries));
        }
        TableCommand::Clear => {
            let removed = pin::load(path)?.map_or(0, |entries| entries.len());
            pin::save(path, &[])?;
            println!("cleared {removed} entries from {}", path.display());
        }
        TableCommand::Add(args) => add(path, args).await?,
        TableCommand::Unpin => {
            if pin::unpin(path)? {
                println!("unpinned {}", path.display());
            } else {
                println!("nothing pinned at {}", path.display());
            }
        }
    }

    Ok(())
}

async fn add(path: &Path, args: AddArgs) -> anyhow::Result<()> {
    let iface = PnetBackend::new().resolve(&args.iface).await?;
    let source = parse_mac(&args.mac)?;

    let rate_bps = u32::try_from(u64::from(args.bandwidth) * MBIT)
        .with_context(|| format!("{} Mbit/s does not fit the table", args.bandwidth))?;

    let key = FlowKey::new(iface.index, source);
    let entry = ShapingEntry::new(args.handle, rate_bps, args.delay);

    let table = ShapingTable::new();
    pin::restore_table(path, &table)?;
    let outcome = table.upsert(key, entry)?;
    pin::pin_table(path, &table)?;

    let verb = match outcome {
        Upsert::Inserted => "added",
        Upsert::Updated { .. } => "updated",
        Upsert::Unchanged => "unchanged",
    };
    println!(
        "{verb} {key} (handle 0x{:x}, {:.2} Mbit/s, {} ms)",
        entry.handle,
        mbps(entry.rate_bps),
        entry.delay_ms
    );

    Ok(())
}

fn mbps(rate_bps: u32) -> f64 {
    f64::from(rate_bps) / MBIT as f64
}

/// Renders `entries` as a table followed by their count.
fn render(entries: &[(FlowKey, ShapingEntry)]) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "{:<8} {:<17} {:>10} {:>16} {:>10}", "IFINDEX", "SOURCE", "HANDLE", "BANDWIDTH(Mbps)", "DELAY(ms)");
    for (key, entry) in entries {
        let bandwidth =
            if entry.rate_bps == 0 { "unlimited".to_string() } else { format!("{:.2}", mbps(entry.rate_bps)) };

        let _ = writeln!(
            out,
            "{:<8} {:<17} {:>10} {:>16} {:>10}",
            key.if_index,
            key.source.to_string(),
            format!("0x{:x}", entry.handle),
            bandwidth,
            entry.delay_ms
        );
    }
    let _ = writeln!(out, "\ntotal entries: {}", entries.len());

    out
}

pub(crate) async fn link(config: &Config, command: LinkCommand) -> anyhow::Result<()> {
    let options = config.redis_options();
    let addr = options.addr.clone();
    let directory = RedisDirectory::connect(options)
        .await
        .with_context(|| format!("failed to connect to the directory at {addr}"))?;

    match command {
        LinkCommand::Put(args) => put(config, &directory, args).await?,
        LinkCommand::Get { id } => {
            let key = link_key(&id);
            match get_link(&directory, &key).await? {
                Some(link) => println!("{key} {}", link.value.to_json()?),
                None => println!("{key} not found"),
            }
        }
        LinkCommand::List { prefix } => {
            let mut keys = directory.list(&prefix).await?;
            keys.sort();
            for key in &keys {
                println!("{key}");
            }
            println!("\n{} keys match {prefix}*", keys.len());
        }
        LinkCommand::Del { id } => {
            let key = link_key(&id);
            if directory.delete(&key).await? {
                println!("deleted {key}");
            } else {
                println!("{key} not found");
            }
        }
        LinkCommand::Seed(args) => seed(config, &directory, args).await?,
    }

    Ok(())
}

async fn put(config: &Config, directory: &RedisDirectory, args: PutArgs) -> anyhow::Result<()> {
    let key = link_key(&args.id);
    let ttl = args.ttl.map_or_else(|| config.link_ttl(), std::time::Duration::from_secs);
    let link = NetworkLink::new(args.mac, args.dest, args.loss, args.bandwidth, args.delay);

    put_link(directory, &key, &link, Some(ttl)).await?;
    println!("{key} {}", link.to_json()?);

    Ok(())
}

async fn seed(config: &Config, directory: &RedisDirectory, args: SeedArgs) -> anyhow::Result<()> {
    let started = Instant::now();
    let ttl = config.link_ttl();
    let mut rng = rand::thread_rng();

    for i in 0..args.count {
        let link = random_link(&mut rng);
        let key = link_key(args.start + i);
        put_link(directory, &key, &link, Some(ttl)).await.with_context(|| format!("failed to write {key}"))?;

        if (i + 1) % 100 == 0 {
            info!(written = i + 1, total = args.count, "seeding");
        }
    }

    println!("declared {} links in {:?}", args.count, started.elapsed());
    Ok(())
}

/// A link from a random unicast, universally administered address.
fn random_link<R: Rng>(rng: &mut R) -> NetworkLink {
    let mut mac: [u8; 6] = rng.gen();
    mac[0] &= 0xfc;
    let mac = mac.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":");

    NetworkLink::new(
        mac,
        rng.gen_range(1..=1000),
        rng.gen_range(0.0..0.1),
        rng.gen_range(1..=100) * MBIT,
        rng.gen_range(1..=100),
    )
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn renders_entries_with_totals() {
        let entries = vec![
            (FlowKey::new(2, parse_mac("00:11:22:33:44:55").unwrap()), ShapingEntry::new(100, 10_000_000, 50)),
            (FlowKey::new(2, parse_mac("00:11:22:33:44:66").unwrap()), ShapingEntry::new(0x10012, 0, 5)),
        ];

        let out = render(&entries);
        let lines: Vec<_> = out.lines().collect();

        assert!(lines[0].starts_with("IFINDEX"));
        assert!(lines[1].contains("00:11:22:33:44:55"));
        assert!(lines[1].contains("0x64"));
        assert!(lines[1].contains("10.00"));
        assert!(lines[2].contains("unlimited"));
        assert_eq!(lines.last(), Some(&"total entries: 2"));
    }

    #[tokio::test]
    async fn pins_owned_by_a_daemon_are_not_edited() {
        let path = std::env::temp_dir().join(format!("flowem-admin-owned-{}.pin", std::process::id()));
        let entries = [(FlowKey::new(2, parse_mac("00:11:22:33:44:55").unwrap()), ShapingEntry::new(1, 0, 5))];
        pin::save(&path, &entries).unwrap();

        let config = Config::from_toml(&format!("[shaper]\npin_path = \"{}\"", path.display())).unwrap();
        let claim = owner::PinOwner::acquire(&path).unwrap();

        assert!(table(&config, TableCommand::Clear).await.is_err());
        assert!(table(&config, TableCommand::Unpin).await.is_err());
        assert_eq!(pin::load(&path).unwrap().unwrap(), entries.to_vec());
        table(&config, TableCommand::View).await.unwrap();

        drop(claim);
        table(&config, TableCommand::Clear).await.unwrap();
        assert_eq!(pin::load(&path).unwrap().unwrap(), Vec::new());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn random_links_are_valid() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..100 {
            let link = random_link(&mut rng);
            link.validate().unwrap();
            assert_eq!(link.source().unwrap().0 & 0x03, 0);
            assert!((1..=100).contains(&link.delay_ms));
        }
    }
}
