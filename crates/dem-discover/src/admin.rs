//! Administrative surface.
//!
//! [`Fleet`] is the handle administrative callers use. Every call takes the
//! registry lock for its whole duration, so it serializes with scheduler
//! ticks. Text results are JSON.

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use dem_core::error::Result;
use dem_core::types::{Namespace, TargetInventory, TransportRequirement};
use dem_core::{AccessMode, LogPageEntry, MgmtMode, Target};

use crate::acl::{host_visible_subsystems, Grant};
use crate::queue::RefreshReport;
use crate::registry::SharedRegistry;
use crate::scheduler::{Scheduler, TickReport};

/// Handle to a running fleet.
#[derive(Clone)]
pub struct Fleet {
    registry: SharedRegistry,
    scheduler: Scheduler,
    shutdown: CancellationToken,
}

impl Fleet {
    pub fn new(registry: SharedRegistry, scheduler: Scheduler, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            scheduler,
            shutdown,
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run one scheduler pass under the registry lock.
    pub async fn tick(&self) -> TickReport {
        let mut registry = self.registry.lock().await;
        self.scheduler.tick(&mut registry).await
    }

    /// Reset the endpoint and push the target's full configuration, then
    /// re-open its queues and refetch log pages.
    ///
    /// A failed push starts the retry backoff and is returned to the caller.
    pub async fn reconfigure(&self, alias: &str) -> Result<RefreshReport> {
        let mut registry = self.registry.lock().await;
        let timing = *registry.timing();

        if let Err(e) = self.scheduler.push(&registry, alias).await {
            if let Ok(target) = registry.find_mut(alias) {
                target.countdowns.start_backoff(&timing);
            }
            tracing::warn!(alias = %alias, error = %e, "Reconfigure failed");
            return Err(e);
        }

        let target = registry.find_mut(alias)?;
        target
            .countdowns
            .reset_refresh(&timing, target.refresh_minutes);
        target.countdowns.clear_backoff();

        let report = self.scheduler.queues().refresh_target(&mut registry, alias).await?;
        tracing::info!(alias = %alias, "Target reconfigured");
        Ok(report)
    }

    /// Refetch log pages for the target now.
    pub async fn refresh(&self, alias: &str) -> Result<RefreshReport> {
        let mut registry = self.registry.lock().await;
        self.scheduler.queues().refresh_target(&mut registry, alias).await
    }

    /// Describe the target's configuration, queues, and last inventory.
    pub async fn usage(&self, alias: &str) -> Result<String> {
        let registry = self.registry.lock().await;
        let target = registry.find(alias)?;
        Ok(serde_json::to_string_pretty(&TargetUsage::from(target))?)
    }

    /// Every log page entry currently held for the target.
    pub async fn target_logpage(&self, alias: &str) -> Result<String> {
        let registry = self.registry.lock().await;
        let target = registry.find(alias)?;
        let entries: Vec<&LogPageEntry> = target
            .subsystems
            .iter()
            .flat_map(|s| s.log_pages.iter())
            .filter(|e| e.valid)
            .collect();
        Ok(serde_json::to_string_pretty(&TargetLogPage {
            alias: &target.alias,
            entries,
        })?)
    }

    /// Log page entries of every subsystem the host may access.
    pub async fn host_logpage(&self, host_alias: &str) -> Result<String> {
        let registry = self.registry.lock().await;
        let visible = host_visible_subsystems(&registry, host_alias)?;

        let mut entries = Vec::new();
        for (alias, nqn, grant) in visible {
            let Some(subsys) = registry.find(&alias)?.subsystem(&nqn) else {
                continue;
            };
            entries.extend(subsys.log_pages.iter().filter(|e| e.valid).map(|e| HostLogPageEntry {
                target: alias.clone(),
                grant: grant.clone(),
                entry: e.clone(),
            }));
        }

        Ok(serde_json::to_string_pretty(&HostLogPage {
            host: host_alias,
            nqn: registry.find_host(host_alias),
            entries,
        })?)
    }

    /// Add a target and run discovery against it.
    pub async fn create_target(&self, target: Target) -> Result<RefreshReport> {
        let alias = target.alias.clone();
        let mut registry = self.registry.lock().await;
        registry.create(target)?;
        self.scheduler.queues().refresh_target(&mut registry, &alias).await
    }

    /// Disconnect the target's queues and remove it.
    pub async fn delete_target(&self, alias: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let closed = self
            .scheduler
            .queues()
            .teardown_target(registry.find_mut(alias)?)
            .await;
        registry.delete(alias)?;
        tracing::info!(alias = %alias, closed, "Target deleted");
        Ok(())
    }

    /// Ask the event loop to stop after the current tick.
    pub fn shutdown(&self) {
        tracing::info!("Shutdown requested");
        self.shutdown.cancel();
    }
}

// ── Views ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct TargetUsage<'a> {
    alias: &'a str,
    mgmt_mode: MgmtMode,
    refresh_minutes: u32,
    group: Option<&'a str>,
    ports: Vec<PortUsage>,
    subsystems: Vec<SubsystemUsage<'a>>,
    queues: Vec<QueueUsage<'a>>,
    inventory: Option<&'a TargetInventory>,
}

#[derive(Serialize)]
struct PortUsage {
    portid: u16,
    address: String,
    treq: TransportRequirement,
}

#[derive(Serialize)]
struct SubsystemUsage<'a> {
    nqn: &'a str,
    access: AccessMode,
    hosts: Vec<&'a str>,
    namespaces: &'a [Namespace],
    learned: bool,
    log_pages: usize,
}

#[derive(Serialize)]
struct QueueUsage<'a> {
    queue: String,
    host_nqn: &'a str,
    connected: bool,
}

impl<'a> From<&'a Target> for TargetUsage<'a> {
    fn from(t: &'a Target) -> Self {
        Self {
            alias: &t.alias,
            mgmt_mode: t.mgmt_mode,
            refresh_minutes: t.refresh_minutes,
            group: t.group.as_deref(),
            ports: t
                .portids
                .iter()
                .map(|p| PortUsage {
                    portid: p.id,
                    address: p.transport.to_string(),
                    treq: p.treq,
                })
                .collect(),
            subsystems: t
                .subsystems
                .iter()
                .map(|s| SubsystemUsage {
                    nqn: &s.nqn,
                    access: s.access,
                    hosts: s.hosts.iter().map(|h| h.nqn.as_str()).collect(),
                    namespaces: &s.namespaces,
                    learned: s.learned,
                    log_pages: s.log_pages.len(),
                })
                .collect(),
            queues: t
                .queues
                .iter()
                .map(|q| QueueUsage {
                    queue: q.key.to_string(),
                    host_nqn: &q.host_nqn,
                    connected: q.connected,
                })
                .collect(),
            inventory: t.inventory.as_ref(),
        }
    }
}

#[derive(Serialize)]
struct TargetLogPage<'a> {
    alias: &'a str,
    entries: Vec<&'a LogPageEntry>,
}

#[derive(Serialize)]
struct HostLogPage<'a> {
    host: &'a str,
    nqn: Option<String>,
    entries: Vec<HostLogPageEntry>,
}

#[derive(Serialize)]
struct HostLogPageEntry {
    target: String,
    grant: Grant,
    #[serde(flatten)]
    entry: LogPageEntry,
}
