//! Local listening interfaces and the inbound connection seam.
//!
//! Each configured interface gets one worker that accepts inbound sessions
//! through an [`InterfaceListener`]. The wire protocol behind the listener
//! lives outside this crate.

use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;

use dem_core::types::{NumericAddress, DEFAULT_TRSVCID};
use dem_core::{AddressFamily, ConfigError, TransportError, TransportType};

use crate::admin::Fleet;
use crate::config::InterfaceEntry;
use crate::error::{DiscoverError, Result};

const DEFAULT_IPV4_PREFIX: u8 = 24;
const DEFAULT_IPV6_PREFIX: u8 = 48;

/// A local address the manager listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    pub trtype: TransportType,
    pub adrfam: AddressFamily,
    pub traddr: String,
    pub trsvcid: u16,
    /// Subnet served by this interface. `None` for FC.
    pub net: Option<IpNet>,
}

impl LocalInterface {
    pub fn parse(entry: &InterfaceEntry, label: &str) -> std::result::Result<Self, ConfigError> {
        let missing = |field| ConfigError::MissingField {
            entry: label.to_string(),
            field,
        };
        let trtype = TransportType::from(entry.trtype.as_deref().ok_or_else(|| missing("trtype"))?);
        let adrfam: AddressFamily = entry.adrfam.as_deref().ok_or_else(|| missing("adrfam"))?.parse()?;
        let raw = entry.traddr.as_deref().ok_or_else(|| missing("traddr"))?.trim();

        let invalid = || ConfigError::InvalidAddress {
            family: adrfam.to_string(),
            address: raw.to_string(),
        };

        let net = match adrfam {
            AddressFamily::Fc => {
                NumericAddress::parse(adrfam, raw)?;
                None
            }
            AddressFamily::Ipv4 | AddressFamily::Ipv6 => {
                let net = if raw.contains('/') {
                    raw.parse::<IpNet>().map_err(|_| invalid())?
                } else {
                    let ip: IpAddr = raw.parse().map_err(|_| invalid())?;
                    let prefix = match ip {
                        IpAddr::V4(_) => DEFAULT_IPV4_PREFIX,
                        IpAddr::V6(_) => DEFAULT_IPV6_PREFIX,
                    };
                    IpNet::new(ip, prefix).map_err(|_| invalid())?
                };
                let family_matches = matches!(
                    (adrfam, net),
                    (AddressFamily::Ipv4, IpNet::V4(_)) | (AddressFamily::Ipv6, IpNet::V6(_))
                );
                if !family_matches {
                    return Err(invalid());
                }
                Some(net)
            }
        };

        let traddr = match net {
            Some(n) => n.addr().to_string(),
            None => raw.to_string(),
        };

        Ok(Self {
            trtype,
            adrfam,
            traddr,
            trsvcid: entry.trsvcid.unwrap_or(DEFAULT_TRSVCID),
            net,
        })
    }

    /// Whether `addr` is on this interface's subnet.
    pub fn serves(&self, addr: &IpAddr) -> bool {
        self.net.is_some_and(|n| n.contains(addr))
    }

    pub fn address(&self) -> String {
        format!("{}://{}:{}", self.trtype, self.traddr, self.trsvcid)
    }
}

/// Parse every configured interface, skipping malformed entries.
///
/// Fails only when nothing viable is left.
pub fn parse_interfaces(entries: &[InterfaceEntry]) -> Result<Vec<LocalInterface>> {
    let mut viable = Vec::new();
    let mut skipped = 0;

    for (i, entry) in entries.iter().enumerate() {
        let label = format!("interfaces[{i}]");
        match LocalInterface::parse(entry, &label) {
            Ok(iface) => {
                tracing::info!(interface = %iface.address(), "Interface configured");
                viable.push(iface);
            }
            Err(e) => {
                tracing::warn!(entry = %label, reason = %e, "Skipping interface");
                skipped += 1;
            }
        }
    }

    if viable.is_empty() {
        return Err(DiscoverError::NoViableInterfaces { skipped });
    }
    Ok(viable)
}

/// Accepts inbound sessions on one interface.
#[async_trait]
pub trait InterfaceListener: Send + Sync {
    /// Wait for the next session. `Ok(None)` means the listener is closed.
    async fn accept(
        &self,
        iface: &LocalInterface,
    ) -> std::result::Result<Option<Box<dyn InboundSession>>, TransportError>;
}

/// One accepted inbound connection.
#[async_trait]
pub trait InboundSession: Send {
    fn peer(&self) -> String;

    /// Serve the session to completion against the fleet.
    async fn serve(self: Box<Self>, fleet: Fleet) -> std::result::Result<(), TransportError>;
}
