//! Configuration loading.
//!
//! `flowem.toml` has an `[app]`, `[directory]`, `[sync]` and `[shaper]` section. Every field
//! has a default, so a minimal or empty file is valid:
//!
//! ```toml
//! [directory]
//! addr = "10.0.0.1:6379"
//!
//! [[shaper.interfaces]]
//! name = "eth0"
//! ingress = "veth-host"
//! ```

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{ensure, Context};
use serde::Deserialize;

use flowem_shaper::{pin::DEFAULT_PIN_PATH, EngineOptions, SchedulerOptions};
use flowem_sync::{RedisOptions, SyncOptions, DEFAULT_KEY_PREFIX, DEFAULT_NAMESPACE};
use flowem_wire::DEFAULT_LINK_TTL;

/// The configuration file looked up when none is given.
pub const DEFAULT_CONFIG_PATH: &str = "flowem.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub app: AppConfig,
    pub directory: DirectoryConfig,
    pub sync: SyncConfig,
    pub shaper: ShaperConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub name: String,
    /// Default log filter, overridden by `RUST_LOG`.
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self { name: "flowem".to_string(), log_level: "info".to_string() }
    }
}

/// Connection to the link directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DirectoryConfig {
    pub addr: String,
    pub password: Option<String>,
    pub db: u32,
    pub pool_size: usize,
    pub dial_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Change feed channel patterns.
    pub key_patterns: Vec<String>,
    /// Prefixes of the keys holding link declarations.
    pub key_prefixes: Vec<String>,
    /// Time-to-live of links written by `flowem link`.
    pub link_ttl_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        let redis = RedisOptions::default();

        Self {
            addr: redis.addr,
            password: None,
            db: redis.db,
            pool_size: redis.pool_size,
            dial_timeout_ms: redis.dial_timeout.as_millis() as u64,
            read_timeout_ms: redis.read_timeout.as_millis() as u64,
            write_timeout_ms: redis.write_timeout.as_millis() as u64,
            key_patterns: vec![format!("{DEFAULT_NAMESPACE}:*")],
            key_prefixes: vec![DEFAULT_KEY_PREFIX.to_string()],
            link_ttl_secs: DEFAULT_LINK_TTL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub workers: usize,
    pub queue_size: usize,
    pub max_retries: usize,
    pub retry_interval_ms: u64,
    pub max_retry_interval_ms: u64,
    pub reconcile_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
    /// Interface the directory's links are enforced on. Defaults to the first configured one.
    pub bind_interface: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let sync = SyncOptions::default();

        Self {
            workers: sync.workers,
            queue_size: sync.queue_size,
            max_retries: sync.max_retries,
            retry_interval_ms: sync.retry_interval.as_millis() as u64,
            max_retry_interval_ms: sync.max_retry_interval.as_millis() as u64,
            reconcile_interval_secs: sync.reconcile_interval.as_secs(),
            shutdown_timeout_secs: sync.shutdown_timeout.as_secs(),
            bind_interface: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShaperConfig {
    pub queue_capacity: usize,
    pub horizon_ms: u64,
    /// Wait for rate credit from which ECN-capable packets are marked CE.
    pub ecn_horizon_ms: u64,
    pub drain_timeout_ms: u64,
    pub table_capacity: usize,
    /// Where the table is pinned. Pinning is disabled when unset.
    pub pin_path: Option<PathBuf>,
    pub interfaces: Vec<InterfaceConfig>,
}

impl Default for ShaperConfig {
    fn default() -> Self {
        let engine = EngineOptions::default();

        Self {
            queue_capacity: engine.scheduler.queue_capacity,
            horizon_ms: engine.scheduler.horizon.as_millis() as u64,
            ecn_horizon_ms: engine.scheduler.ecn_horizon.as_millis() as u64,
            drain_timeout_ms: engine.drain_timeout.as_millis() as u64,
            table_capacity: flowem_shaper::DEFAULT_TABLE_CAPACITY,
            pin_path: Some(PathBuf::from(DEFAULT_PIN_PATH)),
            interfaces: Vec::new(),
        }
    }
}

/// An egress interface to shape.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceConfig {
    pub name: String,
    /// Interface the frames to shape are captured on.
    pub ingress: Option<String>,
}

impl Config {
    /// Reads and validates the configuration at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;

        Self::from_toml(&contents).with_context(|| format!("invalid config at {}", path.display()))
    }

    /// Loads `path` if given, else [`DEFAULT_CONFIG_PATH`] if it exists, else the defaults.
    pub fn discover(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(Path::new(DEFAULT_CONFIG_PATH)),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.directory.addr.is_empty(), "directory.addr must be set");
        ensure!(self.directory.pool_size > 0, "directory.pool_size must be > 0");
        ensure!(!self.directory.key_patterns.is_empty(), "directory.key_patterns must not be empty");
        ensure!(self.directory.link_ttl_secs > 0, "directory.link_ttl_secs must be > 0");

        ensure!(self.sync.workers > 0, "sync.workers must be > 0");
        ensure!(self.sync.queue_size > 0, "sync.queue_size must be > 0");
        ensure!(self.sync.retry_interval_ms > 0, "sync.retry_interval_ms must be > 0");
        ensure!(
            self.sync.max_retry_interval_ms >= self.sync.retry_interval_ms,
            "sync.max_retry_interval_ms must be >= sync.retry_interval_ms"
        );
        ensure!(self.sync.reconcile_interval_secs > 0, "sync.reconcile_interval_secs must be > 0");

        ensure!(self.shaper.queue_capacity > 0, "shaper.queue_capacity must be > 0");
        ensure!(self.shaper.horizon_ms > 0, "shaper.horizon_ms must be > 0");
        ensure!(
            self.shaper.ecn_horizon_ms <= self.shaper.horizon_ms,
            "shaper.ecn_horizon_ms must be <= shaper.horizon_ms"
        );
        ensure!(self.shaper.table_capacity > 0, "shaper.table_capacity must be > 0");

        let mut names = HashSet::new();
        for iface in &self.shaper.interfaces {
            ensure!(!iface.name.is_empty(), "shaper.interfaces entries need a name");
            ensure!(names.insert(iface.name.as_str()), "interface {} configured twice", iface.name);
        }

        if let Some(bind) = &self.sync.bind_interface {
            ensure!(names.contains(bind.as_str()), "sync.bind_interface {bind} is not a configured interface");
        }

        Ok(())
    }

    /// The interface directory links are enforced on.
    pub fn bind_interface(&self) -> Option<&str> {
        self.sync
            .bind_interface
            .as_deref()
            .or_else(|| self.shaper.interfaces.first().map(|iface| iface.name.as_str()))
    }

    pub fn redis_options(&self) -> RedisOptions {
        let dir = &self.directory;

        RedisOptions {
            addr: dir.addr.clone(),
            password: dir.password.clone().filter(|p| !p.is_empty()),
            db: dir.db,
            pool_size: dir.pool_size,
            dial_timeout: Duration::from_millis(dir.dial_timeout_ms),
            read_timeout: Duration::from_millis(dir.read_timeout_ms),
            write_timeout: Duration::from_millis(dir.write_timeout_ms),
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            patterns: self.directory.key_patterns.clone(),
            key_prefixes: self.directory.key_prefixes.clone(),
            workers: self.sync.workers,
            queue_size: self.sync.queue_size,
            max_retries: self.sync.max_retries,
            retry_interval: Duration::from_millis(self.sync.retry_interval_ms),
            max_retry_interval: Duration::from_millis(self.sync.max_retry_interval_ms),
            reconcile_interval: Duration::from_secs(self.sync.reconcile_interval_secs),
            shutdown_timeout: Duration::from_secs(self.sync.shutdown_timeout_secs),
            pin_path: self.shaper.pin_path.clone(),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            scheduler: SchedulerOptions {
                queue_capacity: self.shaper.queue_capacity,
                horizon: Duration::from_millis(self.shaper.horizon_ms),
                ecn_horizon: Duration::from_millis(self.shaper.ecn_horizon_ms),
                seed: None,
            },
            drain_timeout: Duration::from_millis(self.shaper.drain_timeout_ms),
        }
    }

    pub fn link_ttl(&self) -> Duration {
        Duration::from_secs(self.directory.link_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();

        assert_eq!(config.app.log_level, "info");
        assert_eq!(config.directory.key_patterns, vec!["__keyevent@0__:*".to_string()]);
        assert_eq!(config.directory.key_prefixes, vec!["network_link:".to_string()]);
        assert_eq!(config.sync.shutdown_timeout_secs, 30);
        assert_eq!(config.link_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.shaper.table_capacity, 65_535);
        assert_eq!(config.bind_interface(), None);
    }

    #[test]
    fn parses_a_full_config() {
        let config = Config::from_toml(
            r#"
            [app]
            name = "edge-7"
            log_level = "debug"

            [directory]
            addr = "10.0.0.1:6379"
            password = "secret"
            db = 2
            key_patterns = ["__keyevent@2__:*"]

            [sync]
            workers = 4
            reconcile_interval_secs = 10
            bind_interface = "eth1"

            [shaper]
            horizon_ms = 500
            ecn_horizon_ms = 250
            pin_path = "/tmp/flows.pin"

            [[shaper.interfaces]]
            name = "eth0"
            ingress = "veth0"

            [[shaper.interfaces]]
            name = "eth1"
            ingress = "veth1"
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_interface(), Some("eth1"));

        let redis = config.redis_options();
        assert_eq!(redis.db, 2);
        assert_eq!(redis.password.as_deref(), Some("secret"));

        let sync = config.sync_options();
        assert_eq!(sync.workers, 4);
        assert_eq!(sync.patterns, vec!["__keyevent@2__:*".to_string()]);
        assert_eq!(sync.reconcile_interval, Duration::from_secs(10));
        assert_eq!(sync.pin_path, Some(PathBuf::from("/tmp/flows.pin")));

        let scheduler = config.engine_options().scheduler;
        assert_eq!(scheduler.horizon, Duration::from_millis(500));
        assert_eq!(scheduler.ecn_horizon, Duration::from_millis(250));
        assert_eq!(config.shaper.interfaces[0].ingress.as_deref(), Some("veth0"));
    }

    #[test]
    fn rejects_invalid_configs() {
        assert!(Config::from_toml("[sync]\nworkers = 0").is_err());
        assert!(Config::from_toml("[sync]\nbind_interface = \"eth9\"").is_err());
        assert!(Config::from_toml("[directory]\nkey_patterns = []").is_err());
        assert!(Config::from_toml("[shaper]\nunknown = 1").is_err());
        assert!(Config::from_toml("[shaper]\nhorizon_ms = 100\necn_horizon_ms = 200").is_err());
        assert!(Config::from_toml(
            "[[shaper.interfaces]]\nname = \"eth0\"\n[[shaper.interfaces]]\nname = \"eth0\""
        )
        .is_err());
    }
}
