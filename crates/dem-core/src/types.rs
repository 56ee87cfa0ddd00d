//! Core domain types for the NVMe-oF endpoint fleet.
//!
//! A [`Target`] owns its ports, subsystems, and discovery queues; a
//! [`Subsystem`] owns its ACL and log page entries. Back references
//! (target to group, log page entry to port) are carried as names and ids.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::timing::Countdowns;

/// Well-known NQN of a discovery controller.
pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

/// Default NVMe-oF service id.
pub const DEFAULT_TRSVCID: u16 = 4420;

pub const MIN_PORTID: u16 = 1;
pub const MAX_PORTID: u16 = 0xfffe;

/// Generate an anonymous host NQN for open-access subsystems.
pub fn anonymous_host_nqn() -> String {
    format!("nqn.2014-08.org.nvmexpress:uuid:{}", Uuid::new_v4())
}

// ── Enums ─────────────────────────────────────────────────────────

/// How the manager talks to a target's management plane.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MgmtMode {
    /// Separate management channel; discovery queues are ephemeral.
    #[default]
    OutOfBand,
    /// Management shares the storage transport; queues stay connected.
    InBand,
    /// Target is this host; no remote configuration to pull.
    Local,
}

impl FromStr for MgmtMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "out_of_band" | "out-of-band" | "oob" => Ok(Self::OutOfBand),
            "in_band" | "in-band" | "inb" => Ok(Self::InBand),
            "local" => Ok(Self::Local),
            _ => Err(ConfigError::InvalidMgmtMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    #[default]
    Restricted,
    AllowAny,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
    Fc,
}

impl FromStr for AddressFamily {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ipv4" => Ok(Self::Ipv4),
            "ipv6" => Ok(Self::Ipv6),
            "fc" => Ok(Self::Fc),
            _ => Err(ConfigError::UnsupportedFamily(s.to_string())),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "ipv4"),
            Self::Ipv6 => write!(f, "ipv6"),
            Self::Fc => write!(f, "fc"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Rdma,
    Tcp,
    Fc,
    Loop,
    Other(String),
}

impl From<&str> for TransportType {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "rdma" => Self::Rdma,
            "tcp" => Self::Tcp,
            "fc" => Self::Fc,
            "loop" => Self::Loop,
            _ => Self::Other(s.to_string()),
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rdma => write!(f, "rdma"),
            Self::Tcp => write!(f, "tcp"),
            Self::Fc => write!(f, "fc"),
            Self::Loop => write!(f, "loop"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Transport requirements (TREQ) advertised for a port.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportRequirement {
    Required,
    NotRequired,
    #[default]
    NotSpecified,
}

impl From<Option<bool>> for TransportRequirement {
    fn from(flag: Option<bool>) -> Self {
        match flag {
            Some(true) => Self::Required,
            Some(false) => Self::NotRequired,
            None => Self::NotSpecified,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubsystemType {
    Discovery,
    #[default]
    Nvme,
}

// ── Transport Addressing ──────────────────────────────────────────

/// Parsed numeric form of a transport address.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "family", rename_all = "lowercase")]
pub enum NumericAddress {
    Ipv4 { octets: [u8; 4] },
    Ipv6 { segments: [u16; 8] },
    Fc { node_name: u64, port_name: u64 },
}

impl NumericAddress {
    /// Parse `address` according to `family`.
    pub fn parse(family: AddressFamily, address: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidAddress {
            family: family.to_string(),
            address: address.to_string(),
        };

        match family {
            AddressFamily::Ipv4 => {
                let ip: Ipv4Addr = address.trim().parse().map_err(|_| invalid())?;
                Ok(Self::Ipv4 { octets: ip.octets() })
            }
            AddressFamily::Ipv6 => {
                let ip: Ipv6Addr = address.trim().parse().map_err(|_| invalid())?;
                Ok(Self::Ipv6 {
                    segments: ip.segments(),
                })
            }
            AddressFamily::Fc => parse_fc(address).ok_or_else(invalid),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Self::Ipv4 { octets } => Some(IpAddr::from(*octets)),
            Self::Ipv6 { segments } => Some(IpAddr::from(*segments)),
            Self::Fc { .. } => None,
        }
    }
}

/// FC addresses look like `nn-0x20000090fa942779:pn-0x10000090fa942779`.
fn parse_fc(address: &str) -> Option<NumericAddress> {
    let (nn, pn) = address.trim().split_once(':')?;
    let node_name = u64::from_str_radix(nn.strip_prefix("nn-0x")?, 16).ok()?;
    let port_name = u64::from_str_radix(pn.strip_prefix("pn-0x")?, 16).ok()?;
    Some(NumericAddress::Fc {
        node_name,
        port_name,
    })
}

/// Where and how to reach an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportDescriptor {
    pub trtype: TransportType,
    pub adrfam: AddressFamily,
    pub traddr: String,
    pub trsvcid: u16,
    pub addr: NumericAddress,
}

impl TransportDescriptor {
    pub fn parse(
        trtype: &str,
        adrfam: &str,
        traddr: &str,
        trsvcid: Option<u16>,
    ) -> Result<Self, ConfigError> {
        let adrfam: AddressFamily = adrfam.parse()?;
        let addr = NumericAddress::parse(adrfam, traddr)?;
        Ok(Self {
            trtype: TransportType::from(trtype),
            adrfam,
            traddr: traddr.trim().to_string(),
            trsvcid: trsvcid.unwrap_or(DEFAULT_TRSVCID),
            addr,
        })
    }
}

impl fmt::Display for TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.trtype, self.traddr, self.trsvcid)
    }
}

// ── Fleet Entities ────────────────────────────────────────────────

/// A configured network attachment point on a target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Portid {
    pub id: u16,
    pub transport: TransportDescriptor,
    pub treq: TransportRequirement,
}

/// A host permitted on a subsystem's ACL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Host {
    pub nqn: String,
    pub alias: Option<String>,
}

/// Backing device of a namespace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NamespaceDevice {
    NullBlock,
    Nvme { devid: u32, devnsid: u32 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Namespace {
    pub nsid: u32,
    pub device: NamespaceDevice,
}

/// One record of a discovery log page as returned by the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogPageRecord {
    pub subnqn: String,
    pub subtype: SubsystemType,
    pub trtype: TransportType,
    pub adrfam: AddressFamily,
    pub traddr: String,
    pub trsvcid: String,
    pub portid: u16,
    pub treq: TransportRequirement,
}

impl LogPageRecord {
    /// Two records describe the same subsystem path when these fields match.
    pub fn same_path(&self, other: &Self) -> bool {
        self.subnqn == other.subnqn
            && self.trtype == other.trtype
            && self.adrfam == other.adrfam
            && self.traddr == other.traddr
            && self.trsvcid == other.trsvcid
            && self.portid == other.portid
    }
}

/// Which host identity a discovery queue presents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// A concrete host NQN taken from an ACL (direct or via group).
    Host(String),
    /// A generated identity for an open-access subsystem.
    Anonymous,
}

/// Identity of a discovery queue within its target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub portid: u16,
    pub visibility: Visibility,
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.visibility {
            Visibility::Host(nqn) => write!(f, "portid {} as {nqn}", self.portid),
            Visibility::Anonymous => write!(f, "portid {} anonymous", self.portid),
        }
    }
}

/// A log page record tagged with where it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogPageEntry {
    pub record: LogPageRecord,
    /// Queue (portid + visibility) that fetched this entry.
    pub source: QueueKey,
    pub valid: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A storage subsystem exported by a target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subsystem {
    pub nqn: String,
    pub access: AccessMode,
    pub hosts: Vec<Host>,
    pub namespaces: Vec<Namespace>,
    pub log_pages: Vec<LogPageEntry>,
    /// Learned from a remote log page rather than configuration.
    pub learned: bool,
}

impl Subsystem {
    pub fn new(nqn: &str, access: AccessMode) -> Self {
        Self {
            nqn: nqn.to_string(),
            access,
            hosts: Vec::new(),
            namespaces: Vec::new(),
            log_pages: Vec::new(),
            learned: false,
        }
    }

    pub fn has_host(&self, nqn: &str) -> bool {
        self.hosts.iter().any(|h| h.nqn == nqn)
    }

    pub fn is_restricted(&self) -> bool {
        self.access == AccessMode::Restricted
    }
}

/// Opaque handle returned by a transport on connect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

/// A connection to one target port's discovery controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryQueue {
    pub key: QueueKey,
    pub trtype: TransportType,
    /// Host NQN presented on connect.
    pub host_nqn: String,
    /// Subsystem whose access rules produced this identity.
    pub subsys_nqn: String,
    #[serde(skip)]
    pub handle: Option<ConnectionHandle>,
    pub connected: bool,
}

impl DiscoveryQueue {
    pub fn new(key: QueueKey, trtype: TransportType, host_nqn: String, subsys_nqn: &str) -> Self {
        Self {
            key,
            trtype,
            host_nqn,
            subsys_nqn: subsys_nqn.to_string(),
            handle: None,
            connected: false,
        }
    }
}

/// A namespace-capable device reported by a target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NsDevice {
    pub devid: i32,
    pub nsid: u32,
}

/// A fabric interface reported by a target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FabricInterface {
    pub trtype: String,
    pub adrfam: String,
    pub traddr: String,
}

/// Last configuration pulled from a remote target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetInventory {
    pub devices: Vec<NsDevice>,
    pub interfaces: Vec<FabricInterface>,
    pub pulled_at: DateTime<Utc>,
}

/// A remote (or local) NVMe-oF target managed by this fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub alias: String,
    pub mgmt_mode: MgmtMode,
    pub refresh_minutes: u32,
    pub countdowns: Countdowns,
    /// Out-of-band management address, when configured.
    pub oob_interface: Option<TransportDescriptor>,
    pub portids: Vec<Portid>,
    pub subsystems: Vec<Subsystem>,
    pub queues: Vec<DiscoveryQueue>,
    /// Name of the group this target belongs to.
    pub group: Option<String>,
    pub inventory: Option<TargetInventory>,
}

impl Target {
    pub fn new(alias: &str, mgmt_mode: MgmtMode, refresh_minutes: u32) -> Self {
        Self {
            alias: alias.to_string(),
            mgmt_mode,
            refresh_minutes,
            countdowns: Countdowns::default(),
            oob_interface: None,
            portids: Vec::new(),
            subsystems: Vec::new(),
            queues: Vec::new(),
            group: None,
            inventory: None,
        }
    }

    pub fn subsystem(&self, nqn: &str) -> Option<&Subsystem> {
        self.subsystems.iter().find(|s| s.nqn == nqn)
    }

    pub fn subsystem_mut(&mut self, nqn: &str) -> Option<&mut Subsystem> {
        self.subsystems.iter_mut().find(|s| s.nqn == nqn)
    }

    pub fn portid(&self, id: u16) -> Option<&Portid> {
        self.portids.iter().find(|p| p.id == id)
    }

    pub fn queue(&self, key: &QueueKey) -> Option<&DiscoveryQueue> {
        self.queues.iter().find(|q| &q.key == key)
    }

    pub fn queue_mut(&mut self, key: &QueueKey) -> Option<&mut DiscoveryQueue> {
        self.queues.iter_mut().find(|q| &q.key == key)
    }

    pub fn connected_queues(&self) -> usize {
        self.queues.iter().filter(|q| q.connected).count()
    }

    pub fn keeps_queues_open(&self) -> bool {
        self.mgmt_mode == MgmtMode::InBand
    }
}

/// Link from a group to a host, by alias.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupHostLink {
    pub alias: String,
    pub nqn: String,
}

/// A set of targets sharing subsystems with a set of hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    /// Member target aliases.
    pub targets: Vec<String>,
    pub hosts: Vec<GroupHostLink>,
    /// Subsystem NQNs explicitly shared across the group.
    pub shared_subsystems: Vec<String>,
}

impl Group {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            targets: Vec::new(),
            hosts: Vec::new(),
            shared_subsystems: Vec::new(),
        }
    }

    pub fn has_target(&self, alias: &str) -> bool {
        self.targets.iter().any(|t| t == alias)
    }

    pub fn shares(&self, subsys_nqn: &str) -> bool {
        self.shared_subsystems.iter().any(|s| s == subsys_nqn)
    }

    pub fn host_link(&self, nqn: &str) -> Option<&GroupHostLink> {
        self.hosts.iter().find(|h| h.nqn == nqn)
    }
}
