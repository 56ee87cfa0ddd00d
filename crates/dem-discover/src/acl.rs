//! Access resolution for subsystems.
//!
//! Decides whether a host may see a subsystem and which identity a
//! discovery queue presents. Direct ACL entries take precedence over
//! access derived through a group.

use serde::Serialize;

use dem_core::error::{DemError, Result};
use dem_core::types::anonymous_host_nqn;
use dem_core::{AccessMode, Group, Subsystem, Target, Visibility};

use crate::registry::Registry;

/// How access was granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Grant {
    /// Subsystem allows any host.
    Open,
    /// Host is on the subsystem's own ACL.
    Direct,
    /// Host reaches the subsystem through a group.
    Group { group: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Granted(Grant),
    Denied,
}

impl Access {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Identity a discovery queue presents on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueIdentity {
    pub visibility: Visibility,
    pub host_nqn: String,
    pub grant: Grant,
}

/// Decide whether `host_nqn` may access `subsys_nqn` on target `alias`.
pub fn check_access(
    registry: &Registry,
    alias: &str,
    subsys_nqn: &str,
    host_nqn: &str,
) -> Result<Access> {
    let target = registry.find(alias)?;
    let Some(subsys) = target.subsystem(subsys_nqn) else {
        return Ok(Access::Denied);
    };

    if subsys.access == AccessMode::AllowAny {
        return Ok(Access::Granted(Grant::Open));
    }
    if subsys.has_host(host_nqn) {
        return Ok(Access::Granted(Grant::Direct));
    }

    Ok(match group_grant(registry, target, subsys_nqn, host_nqn) {
        Some(group) => Access::Granted(Grant::Group {
            group: group.name.clone(),
        }),
        None => Access::Denied,
    })
}

/// Pick the identity for a discovery queue serving `subsys` on `target`.
///
/// Open subsystems get a fresh anonymous NQN on every call. `None` means
/// the subsystem is invisible and gets no queue.
pub fn resolve_identity(
    registry: &Registry,
    target: &Target,
    subsys: &Subsystem,
) -> Option<QueueIdentity> {
    if subsys.access == AccessMode::AllowAny {
        return Some(QueueIdentity {
            visibility: Visibility::Anonymous,
            host_nqn: anonymous_host_nqn(),
            grant: Grant::Open,
        });
    }

    if let Some(host) = subsys.hosts.first() {
        return Some(QueueIdentity {
            visibility: Visibility::Host(host.nqn.clone()),
            host_nqn: host.nqn.clone(),
            grant: Grant::Direct,
        });
    }

    let group = registry
        .group_of(&target.alias)
        .filter(|g| g.shares(&subsys.nqn))?;

    let via_link = group.hosts.first().map(|h| h.nqn.clone());
    let via_sibling = || {
        siblings(registry, group, &target.alias)
            .filter_map(|t| t.subsystem(&subsys.nqn))
            .find_map(|s| s.hosts.first())
            .map(|h| h.nqn.clone())
    };

    via_link.or_else(via_sibling).map(|nqn| QueueIdentity {
        visibility: Visibility::Host(nqn.clone()),
        host_nqn: nqn,
        grant: Grant::Group {
            group: group.name.clone(),
        },
    })
}

/// Subsystems visible to the host known by `host_alias`, as
/// `(target alias, subsystem NQN, grant)`.
pub fn host_visible_subsystems(
    registry: &Registry,
    host_alias: &str,
) -> Result<Vec<(String, String, Grant)>> {
    let host_nqn = registry
        .find_host(host_alias)
        .ok_or_else(|| DemError::host_not_found(host_alias))?;

    let mut visible = Vec::new();
    for target in registry.targets() {
        for subsys in &target.subsystems {
            if let Access::Granted(grant) =
                check_access(registry, &target.alias, &subsys.nqn, &host_nqn)?
            {
                visible.push((target.alias.clone(), subsys.nqn.clone(), grant));
            }
        }
    }
    Ok(visible)
}

fn group_grant<'a>(
    registry: &'a Registry,
    target: &Target,
    subsys_nqn: &str,
    host_nqn: &str,
) -> Option<&'a Group> {
    let group = registry
        .group_of(&target.alias)
        .filter(|g| g.shares(subsys_nqn))?;

    if group.host_link(host_nqn).is_some() {
        return Some(group);
    }

    siblings(registry, group, &target.alias)
        .filter_map(|t| t.subsystem(subsys_nqn))
        .any(|s| s.has_host(host_nqn))
        .then_some(group)
}

fn siblings<'a>(
    registry: &'a Registry,
    group: &'a Group,
    alias: &'a str,
) -> impl Iterator<Item = &'a Target> + 'a {
    group
        .targets
        .iter()
        .filter(move |t| t.as_str() != alias)
        .filter_map(|t| registry.find(t).ok())
}
