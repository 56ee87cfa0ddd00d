//! dem-discover: Target fleet manager for the NVMe-oF endpoint manager.
//!
//! Builds the target registry from configuration, keeps discovery queues
//! to every target port, merges their log pages, and drives keep-alive,
//! retry, and refresh work from a tick-based event loop.

pub mod acl;
pub mod admin;
pub mod backend;
pub mod config;
pub mod daemon;
pub mod error;
pub mod interface;
pub mod logpage;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod transport;

#[cfg(test)]
mod testing;

pub use admin::Fleet;
pub use daemon::{Daemon, ShutdownSummary};
pub use registry::{Registry, SharedRegistry};
pub use scheduler::{Scheduler, TickReport};
