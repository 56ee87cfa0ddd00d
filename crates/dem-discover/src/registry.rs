//! In-memory target registry.
//!
//! Built once from configuration, then mutated by administrative commands
//! and by discovery. Shared between the scheduler and administrative callers
//! as a [`SharedRegistry`]; every traversal and mutation happens under that
//! one lock.

use std::sync::Arc;

use tokio::sync::Mutex;

use dem_core::error::{DemError, Result};
use dem_core::types::{
    GroupHostLink, Namespace, NamespaceDevice, TransportRequirement, MAX_PORTID, MIN_PORTID,
};
use dem_core::{
    AccessMode, ConfigError, Countdowns, Group, Host, MgmtMode, Portid, Subsystem, Target,
    Timing, TransportDescriptor,
};

use crate::config::{
    FleetConfig, GroupEntry, NamespaceEntry, PortidEntry, SubsystemEntry, TargetEntry,
    TransportEntry,
};

pub type SharedRegistry = Arc<Mutex<Registry>>;

/// A configuration entry that was skipped during build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub entry: String,
    pub reason: ConfigError,
}

/// Outcome of building the registry from configuration.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub targets: usize,
    pub groups: usize,
    pub skipped: Vec<SkippedEntry>,
}

impl BuildReport {
    fn skip(&mut self, entry: String, reason: ConfigError) {
        tracing::warn!(entry = %entry, reason = %reason, "Skipping malformed config entry");
        self.skipped.push(SkippedEntry { entry, reason });
    }
}

/// Authoritative store of targets and groups.
#[derive(Debug)]
pub struct Registry {
    timing: Timing,
    targets: Vec<Target>,
    groups: Vec<Group>,
}

impl Registry {
    pub fn new(timing: Timing) -> Self {
        Self {
            timing,
            targets: Vec::new(),
            groups: Vec::new(),
        }
    }

    /// Build the target/port/subsystem/host/group graph from configuration.
    ///
    /// Malformed entries are logged and skipped; the rest of the file still loads.
    pub fn build(config: &FleetConfig) -> (Self, BuildReport) {
        let mut registry = Self::new(config.timing.derive());
        let mut report = BuildReport::default();

        for (i, entry) in config.targets.iter().enumerate() {
            let label = entry
                .alias
                .clone()
                .unwrap_or_else(|| format!("targets[{i}]"));

            let target = match build_target(entry, &label, &registry.timing, &mut report) {
                Ok(t) => t,
                Err(e) => {
                    report.skip(label, e);
                    continue;
                }
            };

            if registry.index_of(&target.alias).is_some() {
                report.skip(label, ConfigError::DuplicateAlias(target.alias));
                continue;
            }
            registry.targets.push(target);
        }

        for (i, entry) in config.groups.iter().enumerate() {
            match registry.build_group(entry, &mut report) {
                Ok(()) => {}
                Err(e) => report.skip(format!("groups[{i}]"), e),
            }
        }

        report.targets = registry.targets.len();
        report.groups = registry.groups.len();

        tracing::info!(
            targets = report.targets,
            groups = report.groups,
            skipped = report.skipped.len(),
            "Registry built"
        );

        (registry, report)
    }

    pub fn into_shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn aliases(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.alias.clone()).collect()
    }

    pub fn index_of(&self, alias: &str) -> Option<usize> {
        self.targets.iter().position(|t| t.alias == alias)
    }

    pub fn find(&self, alias: &str) -> Result<&Target> {
        self.targets
            .iter()
            .find(|t| t.alias == alias)
            .ok_or_else(|| DemError::not_found(alias))
    }

    pub fn find_mut(&mut self, alias: &str) -> Result<&mut Target> {
        self.targets
            .iter_mut()
            .find(|t| t.alias == alias)
            .ok_or_else(|| DemError::not_found(alias))
    }

    /// Add a target. Countdowns start from a full refresh interval.
    ///
    /// Portids and subsystems are held to the same rules as a config build:
    /// ids in range and no duplicate portid or subsystem NQN.
    pub fn create(&mut self, mut target: Target) -> Result<()> {
        if self.index_of(&target.alias).is_some() {
            return Err(DemError::AlreadyExists {
                alias: target.alias,
            });
        }
        validate_target(&target)?;
        if let Some(name) = target.group.clone() {
            match self.groups.iter_mut().find(|g| g.name == name) {
                Some(group) if !group.has_target(&target.alias) => {
                    group.targets.push(target.alias.clone())
                }
                Some(_) => {}
                None => {
                    tracing::warn!(alias = %target.alias, group = %name, "Unknown group, target left ungrouped");
                    target.group = None;
                }
            }
        }
        target.countdowns = Countdowns::new(&self.timing, target.refresh_minutes);
        tracing::info!(alias = %target.alias, mode = ?target.mgmt_mode, "Target created");
        self.targets.push(target);
        Ok(())
    }

    /// Remove a target and its group memberships.
    ///
    /// The returned target still owns its discovery queues; the caller must
    /// disconnect them before dropping it.
    pub fn delete(&mut self, alias: &str) -> Result<Target> {
        let idx = self.index_of(alias).ok_or_else(|| DemError::not_found(alias))?;
        for group in &mut self.groups {
            group.targets.retain(|t| t != alias);
        }
        let target = self.targets.remove(idx);
        tracing::info!(alias = %alias, queues = target.queues.len(), "Target removed from registry");
        Ok(target)
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// The group listing `alias` as a member. A target joins at most one group.
    pub fn group_of(&self, alias: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.has_target(alias))
    }

    /// Resolve a host alias to its NQN, searching subsystem ACLs first and
    /// group host links second.
    pub fn find_host(&self, alias: &str) -> Option<String> {
        let direct = self
            .targets
            .iter()
            .flat_map(|t| t.subsystems.iter())
            .flat_map(|s| s.hosts.iter())
            .find(|h| h.alias.as_deref() == Some(alias))
            .map(|h| h.nqn.clone());

        direct.or_else(|| {
            self.groups
                .iter()
                .flat_map(|g| g.hosts.iter())
                .find(|h| h.alias == alias)
                .map(|h| h.nqn.clone())
        })
    }

    fn build_group(&mut self, entry: &GroupEntry, report: &mut BuildReport) -> std::result::Result<(), ConfigError> {
        let name = entry.name.as_deref().ok_or(ConfigError::MissingField {
            entry: "group".to_string(),
            field: "name",
        })?;
        if self.group(name).is_some() {
            return Err(ConfigError::DuplicateAlias(name.to_string()));
        }

        let mut group = Group::new(name);
        for alias in &entry.targets {
            let Some(target) = self.targets.iter_mut().find(|t| &t.alias == alias) else {
                tracing::warn!(group = %name, alias = %alias, "Group member not configured, skipping");
                continue;
            };
            if let Some(existing) = &target.group {
                tracing::warn!(group = %name, alias = %alias, existing = %existing, "Target already grouped, skipping");
                continue;
            }
            target.group = Some(name.to_string());
            group.targets.push(alias.clone());
        }

        for (i, host) in entry.hosts.iter().enumerate() {
            match (&host.alias, &host.nqn) {
                (Some(alias), Some(nqn)) => group.hosts.push(GroupHostLink {
                    alias: alias.clone(),
                    nqn: nqn.clone(),
                }),
                (None, _) => report.skip(
                    format!("{name}.hosts[{i}]"),
                    ConfigError::MissingField {
                        entry: format!("{name}.hosts[{i}]"),
                        field: "alias",
                    },
                ),
                (_, None) => report.skip(
                    format!("{name}.hosts[{i}]"),
                    ConfigError::MissingField {
                        entry: format!("{name}.hosts[{i}]"),
                        field: "nqn",
                    },
                ),
            }
        }

        group.shared_subsystems = entry.subsystems.clone();
        self.groups.push(group);
        Ok(())
    }
}

fn validate_target(target: &Target) -> std::result::Result<(), ConfigError> {
    for (i, portid) in target.portids.iter().enumerate() {
        let duplicate = target.portids[..i].iter().any(|p| p.id == portid.id);
        if duplicate || !(MIN_PORTID..=MAX_PORTID).contains(&portid.id) {
            return Err(ConfigError::InvalidPortid(i64::from(portid.id)));
        }
    }
    for (i, subsys) in target.subsystems.iter().enumerate() {
        if target.subsystems[..i].iter().any(|s| s.nqn == subsys.nqn) {
            return Err(ConfigError::DuplicateAlias(subsys.nqn.clone()));
        }
    }
    Ok(())
}

fn build_target(
    entry: &TargetEntry,
    label: &str,
    timing: &Timing,
    report: &mut BuildReport,
) -> std::result::Result<Target, ConfigError> {
    let alias = entry.alias.as_deref().ok_or(ConfigError::MissingField {
        entry: label.to_string(),
        field: "alias",
    })?;
    let mgmt_mode = match &entry.mgmt_mode {
        Some(m) => m.parse::<MgmtMode>()?,
        None => MgmtMode::default(),
    };

    let mut target = Target::new(alias, mgmt_mode, entry.refresh);
    target.countdowns = Countdowns::new(timing, entry.refresh);

    if let Some(iface) = &entry.interface {
        target.oob_interface = Some(parse_transport(iface, &format!("{alias}.interface"))?);
    }

    for (i, p) in entry.portids.iter().enumerate() {
        let label = format!("{alias}.portids[{i}]");
        match parse_portid(p, &label) {
            Ok(portid) if target.portid(portid.id).is_some() => {
                report.skip(label, ConfigError::InvalidPortid(i64::from(portid.id)))
            }
            Ok(portid) => target.portids.push(portid),
            Err(e) => report.skip(label, e),
        }
    }

    for (i, s) in entry.subsystems.iter().enumerate() {
        let label = format!("{alias}.subsystems[{i}]");
        match parse_subsystem(s, &label, report) {
            Ok(subsys) if target.subsystem(&subsys.nqn).is_some() => {
                report.skip(label, ConfigError::DuplicateAlias(subsys.nqn))
            }
            Ok(subsys) => target.subsystems.push(subsys),
            Err(e) => report.skip(label, e),
        }
    }

    tracing::debug!(
        alias = %alias,
        portids = target.portids.len(),
        subsystems = target.subsystems.len(),
        "Target built"
    );

    Ok(target)
}

fn required<'a>(
    value: &'a Option<String>,
    entry: &str,
    field: &'static str,
) -> std::result::Result<&'a str, ConfigError> {
    value.as_deref().ok_or_else(|| ConfigError::MissingField {
        entry: entry.to_string(),
        field,
    })
}

fn parse_transport(entry: &TransportEntry, label: &str) -> std::result::Result<TransportDescriptor, ConfigError> {
    TransportDescriptor::parse(
        required(&entry.trtype, label, "trtype")?,
        required(&entry.adrfam, label, "adrfam")?,
        required(&entry.traddr, label, "traddr")?,
        entry.trsvcid,
    )
}

fn parse_portid(entry: &PortidEntry, label: &str) -> std::result::Result<Portid, ConfigError> {
    let raw = entry.portid.ok_or(ConfigError::MissingField {
        entry: label.to_string(),
        field: "portid",
    })?;
    let id = u16::try_from(raw)
        .ok()
        .filter(|id| (MIN_PORTID..=MAX_PORTID).contains(id))
        .ok_or(ConfigError::InvalidPortid(raw))?;

    let transport = TransportDescriptor::parse(
        required(&entry.trtype, label, "trtype")?,
        required(&entry.adrfam, label, "adrfam")?,
        required(&entry.traddr, label, "traddr")?,
        entry.trsvcid,
    )?;

    Ok(Portid {
        id,
        transport,
        treq: TransportRequirement::from(entry.treq),
    })
}

fn parse_subsystem(
    entry: &SubsystemEntry,
    label: &str,
    report: &mut BuildReport,
) -> std::result::Result<Subsystem, ConfigError> {
    let nqn = required(&entry.nqn, label, "nqn")?;
    let access = if entry.allowany {
        AccessMode::AllowAny
    } else {
        AccessMode::Restricted
    };
    let mut subsys = Subsystem::new(nqn, access);

    for (i, acl) in entry.acl.iter().enumerate() {
        let Some(host_nqn) = &acl.nqn else {
            report.skip(
                format!("{label}.acl[{i}]"),
                ConfigError::MissingField {
                    entry: format!("{label}.acl[{i}]"),
                    field: "nqn",
                },
            );
            continue;
        };
        if acl.access == 0 || subsys.has_host(host_nqn) {
            continue;
        }
        subsys.hosts.push(Host {
            nqn: host_nqn.clone(),
            alias: acl.alias.clone(),
        });
    }

    for (i, ns) in entry.namespaces.iter().enumerate() {
        match parse_namespace(ns, &format!("{label}.namespaces[{i}]")) {
            Ok(ns) => subsys.namespaces.push(ns),
            Err(e) => report.skip(format!("{label}.namespaces[{i}]"), e),
        }
    }

    Ok(subsys)
}

fn parse_namespace(entry: &NamespaceEntry, label: &str) -> std::result::Result<Namespace, ConfigError> {
    let missing = |field| ConfigError::MissingField {
        entry: label.to_string(),
        field,
    };
    let nsid = entry.nsid.ok_or_else(|| missing("nsid"))?;
    let devid = entry.devid.ok_or_else(|| missing("devid"))?;

    let device = if devid < 0 {
        NamespaceDevice::NullBlock
    } else {
        NamespaceDevice::Nvme {
            devid: u32::try_from(devid).map_err(|_| ConfigError::InvalidDevice(devid))?,
            devnsid: entry.devnsid.ok_or_else(|| missing("devnsid"))?,
        }
    };

    Ok(Namespace { nsid, device })
}
