//! Scripted transport and fixtures shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use dem_core::types::{
    ConnectionHandle, LogPageRecord, SubsystemType, TransportRequirement,
};
use dem_core::{AddressFamily, TransportError, TransportType};

use crate::config::{
    AclEntry, FleetConfig, PortidEntry, SubsystemEntry, TargetEntry, TimingConfig,
};
use crate::transport::{QueueEndpoint, Transport};

#[derive(Default)]
struct Script {
    log_pages: HashMap<String, Vec<LogPageRecord>>,
    unreachable: HashSet<String>,
    fail_keep_alive: bool,
    fail_fetch: bool,
    open: HashMap<ConnectionHandle, QueueEndpoint>,
    connects: Vec<QueueEndpoint>,
    disconnects: usize,
    keep_alives: usize,
    fetches: usize,
}

/// In-memory transport whose behavior is set per address by the test.
#[derive(Default)]
pub struct ScriptedTransport {
    next_handle: AtomicU64,
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_log_page(&self, traddr: &str, records: Vec<LogPageRecord>) {
        self.script
            .lock()
            .unwrap()
            .log_pages
            .insert(traddr.to_string(), records);
    }

    pub fn set_unreachable(&self, traddr: &str, unreachable: bool) {
        let mut script = self.script.lock().unwrap();
        if unreachable {
            script.unreachable.insert(traddr.to_string());
        } else {
            script.unreachable.remove(traddr);
        }
    }

    pub fn set_fail_keep_alive(&self, fail: bool) {
        self.script.lock().unwrap().fail_keep_alive = fail;
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.script.lock().unwrap().fail_fetch = fail;
    }

    pub fn connects(&self) -> Vec<QueueEndpoint> {
        self.script.lock().unwrap().connects.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.script.lock().unwrap().disconnects
    }

    pub fn keep_alives(&self) -> usize {
        self.script.lock().unwrap().keep_alives
    }

    pub fn fetches(&self) -> usize {
        self.script.lock().unwrap().fetches
    }

    pub fn open_connections(&self) -> usize {
        self.script.lock().unwrap().open.len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, endpoint: &QueueEndpoint) -> Result<ConnectionHandle, TransportError> {
        let mut script = self.script.lock().unwrap();
        script.connects.push(endpoint.clone());
        if script.unreachable.contains(&endpoint.traddr) {
            return Err(TransportError::Connect {
                address: endpoint.address(),
                reason: "unreachable".to_string(),
            });
        }
        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        script.open.insert(handle, endpoint.clone());
        Ok(handle)
    }

    async fn disconnect(&self, handle: ConnectionHandle) {
        let mut script = self.script.lock().unwrap();
        script.disconnects += 1;
        script.open.remove(&handle);
    }

    async fn send_keep_alive(&self, handle: ConnectionHandle) -> Result<(), TransportError> {
        let mut script = self.script.lock().unwrap();
        script.keep_alives += 1;
        if script.fail_keep_alive || !script.open.contains_key(&handle) {
            return Err(TransportError::KeepAlive("no response".to_string()));
        }
        Ok(())
    }

    async fn fetch_log_pages(
        &self,
        handle: ConnectionHandle,
    ) -> Result<Vec<LogPageRecord>, TransportError> {
        let mut script = self.script.lock().unwrap();
        script.fetches += 1;
        if script.fail_fetch {
            return Err(TransportError::Fetch("connection reset".to_string()));
        }
        let traddr = script
            .open
            .get(&handle)
            .map(|ep| ep.traddr.clone())
            .ok_or_else(|| TransportError::Fetch("stale handle".to_string()))?;
        Ok(script.log_pages.get(&traddr).cloned().unwrap_or_default())
    }
}

pub fn record(subnqn: &str, traddr: &str, portid: u16) -> LogPageRecord {
    LogPageRecord {
        subnqn: subnqn.to_string(),
        subtype: SubsystemType::Nvme,
        trtype: TransportType::Rdma,
        adrfam: AddressFamily::Ipv4,
        traddr: traddr.to_string(),
        trsvcid: "4420".to_string(),
        portid,
        treq: TransportRequirement::NotSpecified,
    }
}

pub fn portid_entry(id: i64, traddr: &str) -> PortidEntry {
    PortidEntry {
        portid: Some(id),
        trtype: Some("rdma".to_string()),
        adrfam: Some("ipv4".to_string()),
        traddr: Some(traddr.to_string()),
        trsvcid: Some(4420),
        treq: None,
    }
}

pub fn subsystem_entry(nqn: &str, allowany: bool, hosts: &[&str]) -> SubsystemEntry {
    SubsystemEntry {
        nqn: Some(nqn.to_string()),
        allowany,
        acl: hosts
            .iter()
            .map(|h| AclEntry {
                nqn: Some(h.to_string()),
                alias: None,
                access: 1,
            })
            .collect(),
        namespaces: Vec::new(),
    }
}

pub fn target_entry(
    alias: &str,
    mode: &str,
    refresh: u32,
    portids: Vec<PortidEntry>,
    subsystems: Vec<SubsystemEntry>,
) -> TargetEntry {
    TargetEntry {
        alias: Some(alias.to_string()),
        refresh,
        mgmt_mode: Some(mode.to_string()),
        interface: None,
        portids,
        subsystems,
    }
}

pub fn fleet(targets: Vec<TargetEntry>) -> FleetConfig {
    FleetConfig {
        timing: TimingConfig {
            tick_ms: 100,
            keep_alive_ms: 1_000,
            retry_ticks: 5,
            shutdown_grace_ms: 100,
        },
        interfaces: Vec::new(),
        targets,
        groups: Vec::new(),
    }
}
