use std::{process::exit, sync::Arc};

use anyhow::Context as _;
use clap::Parser;

use flowem::{config::Config, daemon::Context};
use flowem_shaper::tap::datalink::PnetBackend;
use flowem_sync::{RedisDirectory, RedisFeed};

mod admin;
mod cli;
mod logging;
mod signal;

use cli::{Cli, Command};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("flowem error: {err:?}");
        exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::discover(cli.config.as_deref())?;

    logging::init(&config.app.log_level)?;

    match cli.command {
        Command::Daemon => daemon(config).await,
        Command::Table(command) => admin::table(&config, command).await,
        Command::Link(command) => admin::link(&config, command).await,
    }
}

async fn daemon(config: Config) -> anyhow::Result<()> {
    let shutdown = signal::shutdown_token().context("failed to install signal handlers")?;

    let backend = config
        .shaper
        .interfaces
        .iter()
        .filter_map(|iface| iface.ingress.as_ref().map(|ingress| (&iface.name, ingress)))
        .fold(PnetBackend::new(), |backend, (egress, ingress)| {
            backend.with_ingress(egress.clone(), ingress.clone())
        });

    let options = config.redis_options();
    let addr = options.addr.clone();
    let directory = RedisDirectory::connect(options.clone())
        .await
        .with_context(|| format!("failed to connect to the directory at {addr}"))?;
    let feed = RedisFeed::new(options);

    Context::new(config, backend, Arc::new(directory), feed).run(shutdown).await
}
