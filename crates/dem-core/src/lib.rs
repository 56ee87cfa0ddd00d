//! dem-core: Shared types, timing, and error handling for the NVMe-oF
//! distributed endpoint manager.
//!
//! This crate provides the foundational types used by the fleet engine:
//! - Targets, ports, subsystems, hosts, and groups
//! - Discovery queues and log page entries
//! - Tick-based timing and per-target countdowns
//! - Common error types

pub mod error;
pub mod timing;
pub mod types;

pub use error::{ConfigError, DemError, TransportError};
pub use timing::{Countdowns, Timing};
pub use types::{
    AccessMode, AddressFamily, DiscoveryQueue, Group, Host, LogPageEntry, LogPageRecord,
    MgmtMode, Portid, QueueKey, Subsystem, Target, TransportDescriptor, TransportType, Visibility,
};
