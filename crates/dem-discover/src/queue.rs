//! Discovery queue management.
//!
//! A target gets one discovery queue per (portid, identity) pair, where the
//! identity comes from the ACL resolver. Refreshing a target connects each
//! queue, fetches and merges its log page, then disconnects again unless the
//! target is managed in-band.

use chrono::Utc;

use dem_core::error::Result;
use dem_core::types::anonymous_host_nqn;
use dem_core::{DiscoveryQueue, QueueKey, Target, Visibility};

use crate::acl::resolve_identity;
use crate::logpage::{apply_fetch, forget_source, DiffSummary};
use crate::registry::Registry;
use crate::transport::{QueueEndpoint, Transports};

/// Outcome of refreshing one target.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub connected: u32,
    pub fetched: u32,
    pub failed: u32,
    pub log_pages: DiffSummary,
}

impl RefreshReport {
    fn absorb(&mut self, diff: &DiffSummary) {
        self.log_pages.fetched += diff.fetched;
        self.log_pages.added += diff.added;
        self.log_pages.refreshed += diff.refreshed;
        self.log_pages.purged += diff.purged;
        self.log_pages.learned += diff.learned;
        self.log_pages.dropped += diff.dropped;
    }
}

/// Opens, refreshes, and tears down discovery queues.
#[derive(Clone)]
pub struct QueueManager {
    transports: Transports,
}

impl QueueManager {
    pub fn new(transports: Transports) -> Self {
        Self { transports }
    }

    pub fn transports(&self) -> &Transports {
        &self.transports
    }

    /// Queues `target` should have right now, one per portid and identity.
    fn plan(&self, registry: &Registry, target: &Target) -> Vec<DiscoveryQueue> {
        let mut planned: Vec<DiscoveryQueue> = Vec::new();

        for portid in &target.portids {
            if self.transports.get(&portid.transport.trtype).is_none() {
                tracing::debug!(
                    alias = %target.alias,
                    portid = portid.id,
                    trtype = %portid.transport.trtype,
                    "No transport for port, skipping"
                );
                continue;
            }

            for subsys in &target.subsystems {
                let Some(identity) = resolve_identity(registry, target, subsys) else {
                    continue;
                };
                let key = QueueKey {
                    portid: portid.id,
                    visibility: identity.visibility,
                };
                if planned.iter().any(|q| q.key == key) {
                    continue;
                }
                planned.push(DiscoveryQueue::new(
                    key,
                    portid.transport.trtype.clone(),
                    identity.host_nqn,
                    &subsys.nqn,
                ));
            }
        }

        planned
    }

    /// Bring the target's queue list in line with its ports and ACLs.
    ///
    /// Missing queues are added unconnected. Queues no longer backed by a
    /// port or an identity are disconnected, dropped, and their log page
    /// entries forgotten. Returns the number of queues added.
    pub async fn ensure_queues(&self, registry: &mut Registry, alias: &str) -> Result<usize> {
        let planned = {
            let target = registry.find(alias)?;
            self.plan(registry, target)
        };
        let target = registry.find_mut(alias)?;

        let stale: Vec<DiscoveryQueue> = target
            .queues
            .iter()
            .filter(|q| !planned.iter().any(|p| p.key == q.key))
            .cloned()
            .collect();
        for queue in stale {
            self.close(target, &queue.key).await;
            target.queues.retain(|q| q.key != queue.key);
            let purged = forget_source(target, &queue.key);
            tracing::info!(alias = %alias, queue = %queue.key, purged, "Discovery queue retired");
        }

        let mut added = 0;
        for queue in planned {
            if target.queue(&queue.key).is_none() {
                tracing::debug!(alias = %alias, queue = %queue.key, "Discovery queue added");
                target.queues.push(queue);
                added += 1;
            }
        }
        Ok(added)
    }

    /// Connect every queue, fetch and merge its log page, then disconnect
    /// unless the target keeps queues open.
    ///
    /// Failures are per queue: they start the target's retry backoff and the
    /// remaining queues are still processed.
    pub async fn refresh_target(&self, registry: &mut Registry, alias: &str) -> Result<RefreshReport> {
        self.ensure_queues(registry, alias).await?;
        let timing = *registry.timing();
        let target = registry.find_mut(alias)?;
        let keep_open = target.keeps_queues_open();
        let mut report = RefreshReport::default();

        for i in 0..target.queues.len() {
            let key = target.queues[i].key.clone();
            let Some(portid) = target.portid(key.portid).cloned() else {
                continue;
            };
            let transport = match self.transports.require(&portid.transport.trtype) {
                Ok(t) => t,
                Err(e) => {
                    tracing::debug!(alias = %alias, queue = %key, error = %e, "Queue skipped");
                    continue;
                }
            };

            let handle = match target.queues[i].handle {
                Some(h) => h,
                None => {
                    if key.visibility == Visibility::Anonymous {
                        target.queues[i].host_nqn = anonymous_host_nqn();
                    }
                    let endpoint = QueueEndpoint::discovery(&portid, &target.queues[i].host_nqn);
                    match transport.connect(&endpoint).await {
                        Ok(h) => {
                            target.queues[i].handle = Some(h);
                            target.queues[i].connected = true;
                            report.connected += 1;
                            h
                        }
                        Err(e) => {
                            tracing::warn!(alias = %alias, queue = %key, error = %e, "Could not connect to target");
                            target.countdowns.start_backoff(&timing);
                            report.failed += 1;
                            continue;
                        }
                    }
                }
            };

            match transport.fetch_log_pages(handle).await {
                Ok(records) => {
                    let diff = apply_fetch(target, &key, records, Utc::now());
                    report.absorb(&diff);
                    report.fetched += 1;
                }
                Err(e) => {
                    tracing::warn!(alias = %alias, queue = %key, error = %e, "Log page fetch failed");
                    transport.disconnect(handle).await;
                    mark_disconnected(&mut target.queues[i]);
                    target.countdowns.start_backoff(&timing);
                    report.failed += 1;
                    continue;
                }
            }

            if !keep_open {
                transport.disconnect(handle).await;
                mark_disconnected(&mut target.queues[i]);
            }
        }

        tracing::info!(
            alias = %alias,
            queues = target.queues.len(),
            fetched = report.fetched,
            failed = report.failed,
            added = report.log_pages.added,
            purged = report.log_pages.purged,
            "Target refreshed"
        );

        Ok(report)
    }

    /// Disconnect every open queue on the target. Returns how many were closed.
    pub async fn teardown_target(&self, target: &mut Target) -> usize {
        let keys: Vec<QueueKey> = target
            .queues
            .iter()
            .filter(|q| q.handle.is_some())
            .map(|q| q.key.clone())
            .collect();
        for key in &keys {
            self.close(target, key).await;
        }
        if !keys.is_empty() {
            tracing::debug!(alias = %target.alias, closed = keys.len(), "Queues torn down");
        }
        keys.len()
    }

    /// Disconnect a single queue if it holds a connection.
    pub async fn close(&self, target: &mut Target, key: &QueueKey) {
        let Some(queue) = target.queue_mut(key) else {
            return;
        };
        if let (Some(handle), Some(transport)) = (queue.handle, self.transports.get(&queue.trtype)) {
            transport.disconnect(handle).await;
        }
        mark_disconnected(queue);
    }
}

fn mark_disconnected(queue: &mut DiscoveryQueue) {
    queue.handle = None;
    queue.connected = false;
}
