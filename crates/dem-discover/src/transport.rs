//! Transport capability seam.
//!
//! Wire-level connect/keep-alive/log-page exchange lives outside this crate.
//! The engine talks to it through [`Transport`], selected per port by
//! transport type from a [`Transports`] table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use dem_core::types::{ConnectionHandle, LogPageRecord, Portid, DISCOVERY_NQN};
use dem_core::{AddressFamily, TransportError, TransportType};

/// Everything a transport needs to open a discovery queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEndpoint {
    pub trtype: TransportType,
    pub adrfam: AddressFamily,
    pub traddr: String,
    pub trsvcid: u16,
    /// Host NQN presented on connect.
    pub host_nqn: String,
    pub subsys_nqn: String,
}

impl QueueEndpoint {
    pub fn discovery(portid: &Portid, host_nqn: &str) -> Self {
        Self {
            trtype: portid.transport.trtype.clone(),
            adrfam: portid.transport.adrfam,
            traddr: portid.transport.traddr.clone(),
            trsvcid: portid.transport.trsvcid,
            host_nqn: host_nqn.to_string(),
            subsys_nqn: DISCOVERY_NQN.to_string(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}://{}:{}", self.trtype, self.traddr, self.trsvcid)
    }
}

/// Connection-level operations against a remote discovery controller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, endpoint: &QueueEndpoint) -> Result<ConnectionHandle, TransportError>;

    async fn disconnect(&self, handle: ConnectionHandle);

    async fn send_keep_alive(&self, handle: ConnectionHandle) -> Result<(), TransportError>;

    /// Fetch and decode the discovery log page.
    async fn fetch_log_pages(
        &self,
        handle: ConnectionHandle,
    ) -> Result<Vec<LogPageRecord>, TransportError>;
}

/// Transports keyed by transport type.
#[derive(Clone, Default)]
pub struct Transports {
    by_type: HashMap<TransportType, Arc<dyn Transport>>,
}

impl Transports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, trtype: TransportType, transport: Arc<dyn Transport>) {
        tracing::debug!(trtype = %trtype, "Transport registered");
        self.by_type.insert(trtype, transport);
    }

    pub fn with(mut self, trtype: TransportType, transport: Arc<dyn Transport>) -> Self {
        self.register(trtype, transport);
        self
    }

    pub fn get(&self, trtype: &TransportType) -> Option<Arc<dyn Transport>> {
        self.by_type.get(trtype).cloned()
    }

    pub fn require(&self, trtype: &TransportType) -> Result<Arc<dyn Transport>, TransportError> {
        self.get(trtype)
            .ok_or_else(|| TransportError::Unsupported(trtype.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use dem_core::types::TransportRequirement;
    use dem_core::TransportDescriptor;

    #[test]
    fn test_lookup_by_type() {
        let transports = Transports::new().with(TransportType::Rdma, ScriptedTransport::new());
        assert!(transports.get(&TransportType::Rdma).is_some());
        assert!(transports.get(&TransportType::Tcp).is_none());
        assert_eq!(
            transports.require(&TransportType::Tcp).err(),
            Some(TransportError::Unsupported("tcp".to_string()))
        );
    }

    #[test]
    fn test_discovery_endpoint() {
        let portid = Portid {
            id: 3,
            transport: TransportDescriptor::parse("rdma", "ipv4", "10.1.1.5", Some(4421)).unwrap(),
            treq: TransportRequirement::NotSpecified,
        };
        let ep = QueueEndpoint::discovery(&portid, "nqn.host");
        assert_eq!(ep.subsys_nqn, DISCOVERY_NQN);
        assert_eq!(ep.address(), "rdma://10.1.1.5:4421");
        assert_eq!(ep.host_nqn, "nqn.host");
    }
}
