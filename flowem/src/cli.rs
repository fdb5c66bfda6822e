use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use flowem_sync::DEFAULT_KEY_PREFIX;

/// Per-flow network condition emulation driven by a central link directory.
#[derive(Debug, Parser)]
#[command(name = "flowem", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Configuration file. Defaults to `flowem.toml` when present.
    #[arg(long, short, global = true, value_name = "PATH")]
    pub(crate) config: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Run the node daemon.
    Daemon,
    /// Inspect or edit the pinned shaping table.
    #[command(subcommand)]
    Table(TableCommand),
    /// Read or write link declarations in the directory.
    #[command(subcommand)]
    Link(LinkCommand),
}

#[derive(Debug, Subcommand)]
pub(crate) enum TableCommand {
    /// Print every entry of the pinned table.
    View,
    /// Remove every entry of the pinned table.
    Clear,
    /// Add or replace an entry of the pinned table.
    Add(AddArgs),
    /// Delete the pinned table.
    Unpin,
}

#[derive(Debug, Args)]
pub(crate) struct AddArgs {
    /// Egress interface name.
    #[arg(long, value_name = "IFACE")]
    pub(crate) iface: String,
    /// Source hardware address of the flow.
    #[arg(long)]
    pub(crate) mac: String,
    /// Class handle the flow is accounted under.
    #[arg(long)]
    pub(crate) handle: u32,
    /// Bandwidth cap in Mbit/s, 0 for unlimited.
    #[arg(long, value_name = "MBPS")]
    pub(crate) bandwidth: u32,
    /// Added latency in milliseconds.
    #[arg(long, value_name = "MS")]
    pub(crate) delay: u32,
}

#[derive(Debug, Subcommand)]
pub(crate) enum LinkCommand {
    /// Declare a link.
    Put(PutArgs),
    /// Print a link declaration.
    Get {
        /// Link identifier, the key without its prefix.
        id: String,
    },
    /// List link declarations.
    List {
        /// Key prefix to list.
        #[arg(long, default_value = DEFAULT_KEY_PREFIX)]
        prefix: String,
    },
    /// Delete a link declaration.
    Del {
        /// Link identifier, the key without its prefix.
        id: String,
    },
    /// Declare random links, for load testing.
    Seed(SeedArgs),
}

#[derive(Debug, Args)]
pub(crate) struct PutArgs {
    /// Link identifier, the key without its prefix.
    pub(crate) id: String,
    /// Source hardware address.
    #[arg(long)]
    pub(crate) mac: String,
    /// Destination node identifier.
    #[arg(long, value_name = "ID")]
    pub(crate) dest: i64,
    /// Packet loss rate in [0, 1].
    #[arg(long, default_value_t = 0.0)]
    pub(crate) loss: f64,
    /// Bandwidth cap in bit/s, 0 for unlimited.
    #[arg(long, value_name = "BPS", default_value_t = 0)]
    pub(crate) bandwidth: u64,
    /// Added latency in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 0)]
    pub(crate) delay: u32,
    /// Time-to-live in seconds. Defaults to `directory.link_ttl_secs`.
    #[arg(long, value_name = "SECS")]
    pub(crate) ttl: Option<u64>,
}

#[derive(Debug, Args)]
pub(crate) struct SeedArgs {
    /// Number of links to declare.
    #[arg(long, default_value_t = 1000)]
    pub(crate) count: u32,
    /// First link identifier.
    #[arg(long, default_value_t = 0)]
    pub(crate) start: u32,
}
