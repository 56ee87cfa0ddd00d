//! Endpoint configuration backend.
//!
//! Pushing subsystem/port/host configuration to a target and pulling its
//! device and interface inventory go through [`EndpointBackend`]. Every
//! operation names the target by alias.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use dem_core::types::{FabricInterface, Namespace, NsDevice, TargetInventory};
use dem_core::{AccessMode, Portid, Target, TransportError};

#[async_trait]
pub trait EndpointBackend: Send + Sync {
    async fn create_subsystem(&self, alias: &str, nqn: &str, access: AccessMode) -> Result<(), TransportError>;
    async fn delete_subsystem(&self, alias: &str, nqn: &str) -> Result<(), TransportError>;

    async fn create_namespace(&self, alias: &str, nqn: &str, ns: &Namespace) -> Result<(), TransportError>;
    async fn delete_namespace(&self, alias: &str, nqn: &str, nsid: u32) -> Result<(), TransportError>;

    async fn create_host(&self, alias: &str, host_nqn: &str) -> Result<(), TransportError>;
    async fn delete_host(&self, alias: &str, host_nqn: &str) -> Result<(), TransportError>;

    async fn create_port(&self, alias: &str, portid: &Portid) -> Result<(), TransportError>;
    async fn delete_port(&self, alias: &str, id: u16) -> Result<(), TransportError>;

    async fn link_host(&self, alias: &str, nqn: &str, host_nqn: &str) -> Result<(), TransportError>;
    async fn unlink_host(&self, alias: &str, nqn: &str, host_nqn: &str) -> Result<(), TransportError>;

    async fn link_port(&self, alias: &str, nqn: &str, id: u16) -> Result<(), TransportError>;
    async fn unlink_port(&self, alias: &str, nqn: &str, id: u16) -> Result<(), TransportError>;

    /// Remove every subsystem, port, and host from the endpoint.
    async fn reset_all(&self, alias: &str) -> Result<(), TransportError>;

    async fn enumerate_devices(&self, alias: &str) -> Result<Vec<NsDevice>, TransportError>;
    async fn enumerate_interfaces(&self, alias: &str) -> Result<Vec<FabricInterface>, TransportError>;
}

/// Push a target's full configuration: ports, subsystems, namespaces,
/// hosts, then host and port links. Returns the number of operations.
///
/// Stops at the first failure; a later reconfigure starts over from reset.
pub async fn push_target(backend: &dyn EndpointBackend, target: &Target) -> Result<usize, TransportError> {
    let alias = target.alias.as_str();
    let mut ops = 0;

    backend.reset_all(alias).await?;
    ops += 1;

    for portid in &target.portids {
        backend.create_port(alias, portid).await?;
        ops += 1;
    }

    let mut hosts = HashSet::new();
    for subsys in target.subsystems.iter().filter(|s| !s.learned) {
        backend.create_subsystem(alias, &subsys.nqn, subsys.access).await?;
        ops += 1;
        for ns in &subsys.namespaces {
            backend.create_namespace(alias, &subsys.nqn, ns).await?;
            ops += 1;
        }
        for host in &subsys.hosts {
            if hosts.insert(host.nqn.as_str()) {
                backend.create_host(alias, &host.nqn).await?;
                ops += 1;
            }
        }
    }

    for subsys in target.subsystems.iter().filter(|s| !s.learned) {
        if subsys.access == AccessMode::Restricted {
            for host in &subsys.hosts {
                backend.link_host(alias, &subsys.nqn, &host.nqn).await?;
                ops += 1;
            }
        }
        for portid in &target.portids {
            backend.link_port(alias, &subsys.nqn, portid.id).await?;
            ops += 1;
        }
    }

    tracing::info!(alias = %alias, ops, "Target configuration pushed");
    Ok(ops)
}

/// Pull the target's device and interface inventory.
pub async fn pull_inventory(backend: &dyn EndpointBackend, alias: &str) -> Result<TargetInventory, TransportError> {
    let devices = backend.enumerate_devices(alias).await?;
    let interfaces = backend.enumerate_interfaces(alias).await?;
    tracing::debug!(
        alias = %alias,
        devices = devices.len(),
        interfaces = interfaces.len(),
        "Inventory pulled"
    );
    Ok(TargetInventory {
        devices,
        interfaces,
        pulled_at: Utc::now(),
    })
}

// ── Recording Backend ─────────────────────────────────────────────

/// One backend call as seen by [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BackendOp {
    CreateSubsystem { alias: String, nqn: String, access: AccessMode },
    DeleteSubsystem { alias: String, nqn: String },
    CreateNamespace { alias: String, nqn: String, nsid: u32 },
    DeleteNamespace { alias: String, nqn: String, nsid: u32 },
    CreateHost { alias: String, host_nqn: String },
    DeleteHost { alias: String, host_nqn: String },
    CreatePort { alias: String, id: u16, traddr: String },
    DeletePort { alias: String, id: u16 },
    LinkHost { alias: String, nqn: String, host_nqn: String },
    UnlinkHost { alias: String, nqn: String, host_nqn: String },
    LinkPort { alias: String, nqn: String, id: u16 },
    UnlinkPort { alias: String, nqn: String, id: u16 },
    ResetAll { alias: String },
    EnumerateDevices { alias: String },
    EnumerateInterfaces { alias: String },
}

/// Backend that records every call instead of touching an endpoint.
/// Used for dry runs and tests.
#[derive(Default)]
pub struct RecordingBackend {
    ops: Mutex<Vec<BackendOp>>,
    failing: Mutex<HashSet<String>>,
    devices: Vec<NsDevice>,
    interfaces: Vec<FabricInterface>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Devices reported by `enumerate_devices` for every target.
    pub fn with_devices(mut self, devices: Vec<NsDevice>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_interfaces(mut self, interfaces: Vec<FabricInterface>) -> Self {
        self.interfaces = interfaces;
        self
    }

    /// Make every call for `alias` fail.
    pub async fn set_failing(&self, alias: &str, failing: bool) {
        let mut set = self.failing.lock().await;
        if failing {
            set.insert(alias.to_string());
        } else {
            set.remove(alias);
        }
    }

    pub async fn ops(&self) -> Vec<BackendOp> {
        self.ops.lock().await.clone()
    }

    pub async fn take_ops(&self) -> Vec<BackendOp> {
        std::mem::take(&mut *self.ops.lock().await)
    }

    async fn record(&self, alias: &str, name: &'static str, op: BackendOp) -> Result<(), TransportError> {
        if self.failing.lock().await.contains(alias) {
            return Err(TransportError::Backend {
                op: name,
                reason: format!("{alias} unreachable"),
            });
        }
        tracing::debug!(alias = %alias, op = ?op, "Backend op");
        self.ops.lock().await.push(op);
        Ok(())
    }
}

#[async_trait]
impl EndpointBackend for RecordingBackend {
    async fn create_subsystem(&self, alias: &str, nqn: &str, access: AccessMode) -> Result<(), TransportError> {
        let op = BackendOp::CreateSubsystem {
            alias: alias.to_string(),
            nqn: nqn.to_string(),
            access,
        };
        self.record(alias, "create_subsystem", op).await
    }

    async fn delete_subsystem(&self, alias: &str, nqn: &str) -> Result<(), TransportError> {
        let op = BackendOp::DeleteSubsystem {
            alias: alias.to_string(),
            nqn: nqn.to_string(),
        };
        self.record(alias, "delete_subsystem", op).await
    }

    async fn create_namespace(&self, alias: &str, nqn: &str, ns: &Namespace) -> Result<(), TransportError> {
        let op = BackendOp::CreateNamespace {
            alias: alias.to_string(),
            nqn: nqn.to_string(),
            nsid: ns.nsid,
        };
        self.record(alias, "create_namespace", op).await
    }

    async fn delete_namespace(&self, alias: &str, nqn: &str, nsid: u32) -> Result<(), TransportError> {
        let op = BackendOp::DeleteNamespace {
            alias: alias.to_string(),
            nqn: nqn.to_string(),
            nsid,
        };
        self.record(alias, "delete_namespace", op).await
    }

    async fn create_host(&self, alias: &str, host_nqn: &str) -> Result<(), TransportError> {
        let op = BackendOp::CreateHost {
            alias: alias.to_string(),
            host_nqn: host_nqn.to_string(),
        };
        self.record(alias, "create_host", op).await
    }

    async fn delete_host(&self, alias: &str, host_nqn: &str) -> Result<(), TransportError> {
        let op = BackendOp::DeleteHost {
            alias: alias.to_string(),
            host_nqn: host_nqn.to_string(),
        };
        self.record(alias, "delete_host", op).await
    }

    async fn create_port(&self, alias: &str, portid: &Portid) -> Result<(), TransportError> {
        let op = BackendOp::CreatePort {
            alias: alias.to_string(),
            id: portid.id,
            traddr: portid.transport.traddr.clone(),
        };
        self.record(alias, "create_port", op).await
    }

    async fn delete_port(&self, alias: &str, id: u16) -> Result<(), TransportError> {
        let op = BackendOp::DeletePort {
            alias: alias.to_string(),
            id,
        };
        self.record(alias, "delete_port", op).await
    }

    async fn link_host(&self, alias: &str, nqn: &str, host_nqn: &str) -> Result<(), TransportError> {
        let op = BackendOp::LinkHost {
            alias: alias.to_string(),
            nqn: nqn.to_string(),
            host_nqn: host_nqn.to_string(),
        };
        self.record(alias, "link_host", op).await
    }

    async fn unlink_host(&self, alias: &str, nqn: &str, host_nqn: &str) -> Result<(), TransportError> {
        let op = BackendOp::UnlinkHost {
            alias: alias.to_string(),
            nqn: nqn.to_string(),
            host_nqn: host_nqn.to_string(),
        };
        self.record(alias, "unlink_host", op).await
    }

    async fn link_port(&self, alias: &str, nqn: &str, id: u16) -> Result<(), TransportError> {
        let op = BackendOp::LinkPort {
            alias: alias.to_string(),
            nqn: nqn.to_string(),
            id,
        };
        self.record(alias, "link_port", op).await
    }

    async fn unlink_port(&self, alias: &str, nqn: &str, id: u16) -> Result<(), TransportError> {
        let op = BackendOp::UnlinkPort {
            alias: alias.to_string(),
            nqn: nqn.to_string(),
            id,
        };
        self.record(alias, "unlink_port", op).await
    }

    async fn reset_all(&self, alias: &str) -> Result<(), TransportError> {
        let op = BackendOp::ResetAll {
            alias: alias.to_string(),
        };
        self.record(alias, "reset_all", op).await
    }

    async fn enumerate_devices(&self, alias: &str) -> Result<Vec<NsDevice>, TransportError> {
        let op = BackendOp::EnumerateDevices {
            alias: alias.to_string(),
        };
        self.record(alias, "enumerate_devices", op).await?;
        Ok(self.devices.clone())
    }

    async fn enumerate_interfaces(&self, alias: &str) -> Result<Vec<FabricInterface>, TransportError> {
        let op = BackendOp::EnumerateInterfaces {
            alias: alias.to_string(),
        };
        self.record(alias, "enumerate_interfaces", op).await?;
        Ok(self.interfaces.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::testing::{fleet, portid_entry, subsystem_entry, target_entry};
    use dem_core::types::NamespaceDevice;

    fn configured_target() -> Target {
        let mut open = subsystem_entry("nqn.open", true, &[]);
        open.namespaces.push(crate::config::NamespaceEntry {
            nsid: Some(1),
            devid: Some(-1),
            devnsid: None,
        });
        let config = fleet(vec![target_entry(
            "t",
            "oob",
            1,
            vec![portid_entry(1, "10.0.0.1"), portid_entry(2, "10.0.0.2")],
            vec![open, subsystem_entry("nqn.locked", false, &["nqn.h1", "nqn.h2"])],
        )]);
        let (registry, _) = Registry::build(&config);
        registry.find("t").unwrap().clone()
    }

    #[tokio::test]
    async fn test_push_order() {
        let backend = RecordingBackend::new();
        let target = configured_target();
        assert_eq!(
            target.subsystems[0].namespaces[0].device,
            NamespaceDevice::NullBlock
        );

        let count = push_target(&backend, &target).await.unwrap();
        let ops = backend.ops().await;
        assert_eq!(ops.len(), count);

        assert!(matches!(ops[0], BackendOp::ResetAll { .. }));
        assert!(matches!(ops[1], BackendOp::CreatePort { id: 1, .. }));
        assert!(matches!(ops[2], BackendOp::CreatePort { id: 2, .. }));

        let first_link = ops
            .iter()
            .position(|o| matches!(o, BackendOp::LinkHost { .. } | BackendOp::LinkPort { .. }))
            .unwrap();
        assert!(ops[..first_link].iter().all(|o| !matches!(
            o,
            BackendOp::LinkHost { .. } | BackendOp::LinkPort { .. }
        )));

        // Open subsystems are never host-linked.
        let host_links: Vec<_> = ops
            .iter()
            .filter_map(|o| match o {
                BackendOp::LinkHost { nqn, .. } => Some(nqn.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(host_links, vec!["nqn.locked", "nqn.locked"]);

        let port_links = ops
            .iter()
            .filter(|o| matches!(o, BackendOp::LinkPort { .. }))
            .count();
        assert_eq!(port_links, 4);
    }

    #[tokio::test]
    async fn test_learned_subsystems_not_pushed() {
        let backend = RecordingBackend::new();
        let mut target = configured_target();
        let mut learned = dem_core::Subsystem::new("nqn.remote", AccessMode::Restricted);
        learned.learned = true;
        target.subsystems.push(learned);

        push_target(&backend, &target).await.unwrap();
        assert!(backend.ops().await.iter().all(|o| !matches!(
            o,
            BackendOp::CreateSubsystem { nqn, .. } if nqn == "nqn.remote"
        )));
    }

    #[tokio::test]
    async fn test_failing_alias() {
        let backend = RecordingBackend::new();
        backend.set_failing("t", true).await;
        let err = push_target(&backend, &configured_target()).await.unwrap_err();
        assert!(matches!(err, TransportError::Backend { op: "reset_all", .. }));
        assert!(backend.ops().await.is_empty());

        backend.set_failing("t", false).await;
        assert!(pull_inventory(&backend, "t").await.is_ok());
    }

    #[tokio::test]
    async fn test_pull_inventory() {
        let backend = RecordingBackend::new()
            .with_devices(vec![NsDevice { devid: 0, nsid: 1 }])
            .with_interfaces(vec![FabricInterface {
                trtype: "rdma".to_string(),
                adrfam: "ipv4".to_string(),
                traddr: "192.168.22.2".to_string(),
            }]);
        let inv = pull_inventory(&backend, "t").await.unwrap();
        assert_eq!(inv.devices.len(), 1);
        assert_eq!(inv.interfaces[0].traddr, "192.168.22.2");
        assert_eq!(
            backend.take_ops().await,
            vec![
                BackendOp::EnumerateDevices { alias: "t".to_string() },
                BackendOp::EnumerateInterfaces { alias: "t".to_string() },
            ]
        );
        assert!(backend.ops().await.is_empty());
    }
}
