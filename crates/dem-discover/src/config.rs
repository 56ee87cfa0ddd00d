//! Configuration for the fleet manager.
//!
//! Loaded from `dem.toml` (or another file prefix) plus `DEM__` environment
//! variables. Entry fields are optional at this layer so that a malformed
//! target or subsystem is skipped by the registry build instead of failing
//! the whole file.

use serde::Deserialize;

use dem_core::timing::{DEFAULT_KEEP_ALIVE_MS, DEFAULT_RETRY_TICKS, DEFAULT_TICK_MS};
use dem_core::Timing;

use crate::error::Result;

/// Top-level fleet configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub timing: TimingConfig,

    /// Local listening interfaces, one worker each.
    #[serde(default)]
    pub interfaces: Vec<InterfaceEntry>,

    #[serde(default)]
    pub targets: Vec<TargetEntry>,

    #[serde(default)]
    pub groups: Vec<GroupEntry>,
}

/// Scheduler periods. Converted to tick counts once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// Scheduler tick period in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Keep-alive period for in-band queues in milliseconds.
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,

    /// Ticks a failing target backs off before retrying.
    #[serde(default = "default_retry_ticks")]
    pub retry_ticks: u32,

    /// How long interface workers get to finish at shutdown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterfaceEntry {
    pub trtype: Option<String>,
    pub adrfam: Option<String>,
    /// Address with optional prefix length, e.g. `192.168.22.1/24`.
    pub traddr: Option<String>,
    pub trsvcid: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetEntry {
    pub alias: Option<String>,

    /// Refresh interval in minutes; 0 disables periodic refresh.
    #[serde(default)]
    pub refresh: u32,

    /// `out_of_band` (default), `in_band`, or `local`.
    pub mgmt_mode: Option<String>,

    /// Out-of-band management address.
    pub interface: Option<TransportEntry>,

    #[serde(default)]
    pub portids: Vec<PortidEntry>,

    #[serde(default)]
    pub subsystems: Vec<SubsystemEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransportEntry {
    pub trtype: Option<String>,
    pub adrfam: Option<String>,
    pub traddr: Option<String>,
    pub trsvcid: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortidEntry {
    pub portid: Option<i64>,
    pub trtype: Option<String>,
    pub adrfam: Option<String>,
    pub traddr: Option<String>,
    pub trsvcid: Option<u16>,
    /// Transport requirement flag; absent means "not specified".
    pub treq: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubsystemEntry {
    pub nqn: Option<String>,

    #[serde(default)]
    pub allowany: bool,

    #[serde(default)]
    pub acl: Vec<AclEntry>,

    #[serde(default)]
    pub namespaces: Vec<NamespaceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AclEntry {
    pub nqn: Option<String>,
    pub alias: Option<String>,

    /// Non-zero grants access; zero entries are ignored.
    #[serde(default = "default_access")]
    pub access: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NamespaceEntry {
    pub nsid: Option<u32>,
    /// Negative device ids select the null block device.
    pub devid: Option<i64>,
    pub devnsid: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupEntry {
    pub name: Option<String>,

    /// Member target aliases.
    #[serde(default)]
    pub targets: Vec<String>,

    #[serde(default)]
    pub hosts: Vec<GroupHostEntry>,

    /// Subsystem NQNs shared across the group.
    #[serde(default)]
    pub subsystems: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupHostEntry {
    pub alias: Option<String>,
    pub nqn: Option<String>,
}

fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}

fn default_keep_alive_ms() -> u64 {
    DEFAULT_KEEP_ALIVE_MS
}

fn default_retry_ticks() -> u32 {
    DEFAULT_RETRY_TICKS
}

fn default_shutdown_grace_ms() -> u64 {
    2_000
}

fn default_access() -> i64 {
    1
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            keep_alive_ms: default_keep_alive_ms(),
            retry_ticks: default_retry_ticks(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl TimingConfig {
    pub fn derive(&self) -> Timing {
        Timing::derive(self.tick_ms, self.keep_alive_ms, self.retry_ticks)
    }

    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl FleetConfig {
    /// Load from `{file_prefix}.toml` (optional) and `DEM__` environment overrides.
    pub fn load(file_prefix: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(file_prefix).required(false))
            .add_source(
                config::Environment::with_prefix("DEM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    /// Parse an in-memory TOML document.
    pub fn from_toml(source: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?;

        Ok(cfg.try_deserialize()?)
    }
}
