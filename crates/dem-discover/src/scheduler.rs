//! Tick-driven maintenance of the target fleet.
//!
//! Each tick walks every target in registry order and runs, in this order,
//! keep-alive probing (in-band targets only), retry backoff, and periodic
//! refresh. A keep-alive failure or an active backoff ends that target's
//! work for the tick.

use std::sync::Arc;

use dem_core::error::Result;
use dem_core::types::ConnectionHandle;
use dem_core::{MgmtMode, QueueKey, TransportType};

use crate::backend::{pull_inventory, push_target, EndpointBackend};
use crate::queue::QueueManager;
use crate::registry::Registry;

/// What happened during one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Targets whose refresh fired.
    pub refreshed: Vec<String>,
    /// Targets that lost a queue to a failed keep-alive.
    pub keep_alive_failures: Vec<String>,
    /// Targets skipped because they are still backing off.
    pub backing_off: Vec<String>,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.refreshed.is_empty() && self.keep_alive_failures.is_empty()
    }
}

/// Runs keep-alive, retry, and refresh work against the registry.
#[derive(Clone)]
pub struct Scheduler {
    queues: QueueManager,
    backend: Arc<dyn EndpointBackend>,
}

impl Scheduler {
    pub fn new(queues: QueueManager, backend: Arc<dyn EndpointBackend>) -> Self {
        Self { queues, backend }
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    pub fn backend(&self) -> &Arc<dyn EndpointBackend> {
        &self.backend
    }

    /// Initial pass at startup: pull and push configuration for remotely
    /// managed targets, then open queues and fetch log pages everywhere.
    pub async fn prime(&self, registry: &mut Registry) {
        for alias in registry.aliases() {
            let configured = match self.sync_remote(registry, &alias).await {
                Ok(true) => self.push(registry, &alias).await.map(|_| ()),
                Ok(false) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = configured {
                tracing::warn!(alias = %alias, error = %e, "Initial configuration failed");
            }
            if let Err(e) = self.queues.refresh_target(registry, &alias).await {
                tracing::warn!(alias = %alias, error = %e, "Initial discovery failed");
            }
        }
        tracing::info!(targets = registry.targets().len(), "Fleet primed");
    }

    /// Run one scheduler pass over every target.
    pub async fn tick(&self, registry: &mut Registry) -> TickReport {
        let mut report = TickReport::default();

        for alias in registry.aliases() {
            match self.tick_target(registry, &alias, &mut report).await {
                Ok(()) => {}
                Err(e) => tracing::warn!(alias = %alias, error = %e, "Tick failed for target"),
            }
        }

        report
    }

    async fn tick_target(&self, registry: &mut Registry, alias: &str, report: &mut TickReport) -> Result<()> {
        let timing = *registry.timing();
        let target = registry.find_mut(alias)?;

        if target.mgmt_mode == MgmtMode::InBand && target.countdowns.tick_keep_alive() {
            let open: Vec<(QueueKey, TransportType, ConnectionHandle)> = target
                .queues
                .iter()
                .filter(|q| q.connected)
                .filter_map(|q| q.handle.map(|h| (q.key.clone(), q.trtype.clone(), h)))
                .collect();

            let mut failed = false;
            for (key, trtype, handle) in open {
                let Some(transport) = self.queues.transports().get(&trtype) else {
                    continue;
                };
                if let Err(e) = transport.send_keep_alive(handle).await {
                    tracing::warn!(alias = %alias, queue = %key, error = %e, "Keep alive failed");
                    self.queues.close(target, &key).await;
                    target.countdowns.start_backoff(&timing);
                    failed = true;
                    break;
                }
            }

            if failed {
                report.keep_alive_failures.push(alias.to_string());
                return Ok(());
            }
            target.countdowns.reset_keep_alive(&timing);
        }

        if target.countdowns.backing_off() && target.countdowns.tick_retry() {
            report.backing_off.push(alias.to_string());
            return Ok(());
        }

        if !target.countdowns.tick_refresh() {
            return Ok(());
        }

        tracing::debug!(alias = %alias, "Refresh due");
        if let Err(e) = self.sync_remote(registry, alias).await {
            tracing::warn!(alias = %alias, error = %e, "Configuration pull failed");
        }
        self.queues.refresh_target(registry, alias).await?;

        let target = registry.find_mut(alias)?;
        target
            .countdowns
            .reset_refresh(&timing, target.refresh_minutes);
        report.refreshed.push(alias.to_string());
        Ok(())
    }

    /// Pull device and interface inventory for a remotely managed target.
    ///
    /// Returns `Ok(false)` for local targets. A failed pull starts the
    /// target's retry backoff.
    pub async fn sync_remote(&self, registry: &mut Registry, alias: &str) -> Result<bool> {
        let timing = *registry.timing();
        let target = registry.find_mut(alias)?;
        if target.mgmt_mode == MgmtMode::Local {
            return Ok(false);
        }

        match pull_inventory(self.backend.as_ref(), alias).await {
            Ok(inventory) => {
                target.inventory = Some(inventory);
                Ok(true)
            }
            Err(e) => {
                target.countdowns.start_backoff(&timing);
                Err(e.into())
            }
        }
    }

    /// Push the target's configuration to its endpoint.
    pub async fn push(&self, registry: &Registry, alias: &str) -> Result<usize> {
        let target = registry.find(alias)?;
        Ok(push_target(self.backend.as_ref(), target).await?)
    }
}
