//! Log page merge: fold a fetched discovery log page into a target's
//! subsystems and garbage-collect entries the remote stopped reporting.
//!
//! Each fetch is one generation for its source queue. Entries from that
//! source are marked stale, records in the fetch revalidate or add entries,
//! and whatever is still stale afterwards is swept. Entries from other
//! sources are never touched. A learned subsystem left without entries is
//! dropped with them.

use chrono::{DateTime, Utc};

use dem_core::types::SubsystemType;
use dem_core::{AccessMode, LogPageEntry, LogPageRecord, QueueKey, Subsystem, Target};

/// The outcome of merging one fetch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiffSummary {
    pub fetched: u32,
    pub added: u32,
    pub refreshed: u32,
    pub purged: u32,
    /// Subsystems created because the remote reported an unknown NQN.
    pub learned: u32,
    /// Learned subsystems dropped because no entry remained.
    pub dropped: u32,
}

impl DiffSummary {
    pub fn changed(&self) -> bool {
        self.added > 0 || self.purged > 0 || self.learned > 0 || self.dropped > 0
    }
}

/// Merge `records` fetched over the queue `source` into `target`.
pub fn apply_fetch(
    target: &mut Target,
    source: &QueueKey,
    records: Vec<LogPageRecord>,
    now: DateTime<Utc>,
) -> DiffSummary {
    let mut summary = DiffSummary {
        fetched: records.len() as u32,
        ..Default::default()
    };

    // Mark.
    for entry in target
        .subsystems
        .iter_mut()
        .flat_map(|s| s.log_pages.iter_mut())
        .filter(|e| &e.source == source)
    {
        entry.valid = false;
    }

    for record in records {
        if record.subtype == SubsystemType::Discovery {
            tracing::debug!(
                alias = %target.alias,
                traddr = %record.traddr,
                "Skipping referral record"
            );
            continue;
        }
        if target.subsystem(&record.subnqn).is_none() {
            tracing::info!(
                alias = %target.alias,
                subnqn = %record.subnqn,
                "Learned subsystem from log page"
            );
            let mut subsys = Subsystem::new(&record.subnqn, AccessMode::Restricted);
            subsys.learned = true;
            target.subsystems.push(subsys);
            summary.learned += 1;
        }
        let Some(subsys) = target.subsystem_mut(&record.subnqn) else {
            continue;
        };

        match subsys
            .log_pages
            .iter_mut()
            .find(|e| &e.source == source && e.record.same_path(&record))
        {
            Some(existing) => {
                existing.record = record;
                existing.valid = true;
                existing.last_seen = now;
                summary.refreshed += 1;
            }
            None => {
                subsys.log_pages.push(LogPageEntry {
                    record,
                    source: source.clone(),
                    valid: true,
                    first_seen: now,
                    last_seen: now,
                });
                summary.added += 1;
            }
        }
    }

    // Sweep.
    for subsys in &mut target.subsystems {
        let before = subsys.log_pages.len();
        subsys
            .log_pages
            .retain(|e| e.valid || &e.source != source);
        summary.purged += (before - subsys.log_pages.len()) as u32;
    }
    summary.dropped = drop_unreported(target);

    if summary.changed() {
        tracing::debug!(
            alias = %target.alias,
            source = %source,
            added = summary.added,
            purged = summary.purged,
            learned = summary.learned,
            dropped = summary.dropped,
            "Log page changed"
        );
    }

    summary
}

/// Drop every entry fetched over `source`, e.g. when its queue goes away.
pub fn forget_source(target: &mut Target, source: &QueueKey) -> u32 {
    let mut purged = 0;
    for subsys in &mut target.subsystems {
        let before = subsys.log_pages.len();
        subsys.log_pages.retain(|e| &e.source != source);
        purged += (before - subsys.log_pages.len()) as u32;
    }
    drop_unreported(target);
    purged
}

/// Remove learned subsystems that no longer hold any log page entry.
fn drop_unreported(target: &mut Target) -> u32 {
    let before = target.subsystems.len();
    let alias = &target.alias;
    target.subsystems.retain(|s| {
        let keep = !s.learned || !s.log_pages.is_empty();
        if !keep {
            tracing::info!(alias = %alias, subnqn = %s.nqn, "Learned subsystem no longer reported");
        }
        keep
    });
    (before - target.subsystems.len()) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;
    use dem_core::{MgmtMode, Visibility};

    fn key(portid: u16) -> QueueKey {
        QueueKey {
            portid,
            visibility: Visibility::Anonymous,
        }
    }

    fn target() -> Target {
        let mut t = Target::new("t", MgmtMode::InBand, 1);
        t.subsystems.push(Subsystem::new("nqn.a", AccessMode::AllowAny));
        t
    }

    fn entries(t: &Target) -> Vec<(String, String, QueueKey)> {
        t.subsystems
            .iter()
            .flat_map(|s| s.log_pages.iter())
            .map(|e| (e.record.subnqn.clone(), e.record.traddr.clone(), e.source.clone()))
            .collect()
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut t = target();
        let page = vec![record("nqn.a", "10.0.0.1", 1), record("nqn.a", "10.0.0.2", 1)];

        let first = apply_fetch(&mut t, &key(1), page.clone(), Utc::now());
        assert_eq!(first.added, 2);
        let snapshot = entries(&t);

        let second = apply_fetch(&mut t, &key(1), page, Utc::now());
        assert_eq!(second.added, 0);
        assert_eq!(second.refreshed, 2);
        assert_eq!(second.purged, 0);
        assert!(!second.changed());
        assert_eq!(entries(&t), snapshot);
    }

    #[test]
    fn test_absent_entries_are_collected() {
        let mut t = target();
        apply_fetch(
            &mut t,
            &key(1),
            vec![record("nqn.a", "10.0.0.1", 1), record("nqn.a", "10.0.0.2", 1)],
            Utc::now(),
        );

        let summary = apply_fetch(&mut t, &key(1), vec![record("nqn.a", "10.0.0.2", 1)], Utc::now());
        assert_eq!(summary.purged, 1);
        let remaining = entries(&t);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].1, "10.0.0.2");
        assert!(t.subsystems[0].log_pages.iter().all(|e| e.valid));
    }

    #[test]
    fn test_gc_scoped_to_source() {
        let mut t = target();
        apply_fetch(&mut t, &key(1), vec![record("nqn.a", "10.0.0.1", 1)], Utc::now());
        apply_fetch(&mut t, &key(2), vec![record("nqn.a", "10.0.0.9", 2)], Utc::now());

        let summary = apply_fetch(&mut t, &key(2), vec![], Utc::now());
        assert_eq!(summary.purged, 1);
        assert_eq!(entries(&t), vec![("nqn.a".to_string(), "10.0.0.1".to_string(), key(1))]);
    }

    #[test]
    fn test_unknown_subsystem_is_learned() {
        let mut t = target();
        let summary = apply_fetch(&mut t, &key(1), vec![record("nqn.new", "10.0.0.3", 1)], Utc::now());
        assert_eq!(summary.learned, 1);
        let learned = t.subsystem("nqn.new").unwrap();
        assert!(learned.learned);
        assert!(learned.is_restricted());
        assert_eq!(learned.log_pages.len(), 1);
    }

    #[test]
    fn test_unreported_learned_subsystem_dropped() {
        let mut t = target();
        apply_fetch(
            &mut t,
            &key(1),
            vec![record("nqn.a", "10.0.0.1", 1), record("nqn.gone", "10.0.0.1", 1)],
            Utc::now(),
        );
        assert!(t.subsystem("nqn.gone").is_some());

        let summary = apply_fetch(&mut t, &key(1), vec![record("nqn.a", "10.0.0.1", 1)], Utc::now());
        assert_eq!(summary.purged, 1);
        assert_eq!(summary.dropped, 1);
        assert!(t.subsystem("nqn.gone").is_none());

        for i in 0..100 {
            let nqn = format!("nqn.churn-{i}");
            apply_fetch(&mut t, &key(1), vec![record(&nqn, "10.0.0.1", 1)], Utc::now());
        }
        assert_eq!(t.subsystems.len(), 2);
    }

    #[test]
    fn test_configured_subsystem_kept_when_unreported() {
        let mut t = target();
        apply_fetch(&mut t, &key(1), vec![record("nqn.a", "10.0.0.1", 1)], Utc::now());
        let summary = apply_fetch(&mut t, &key(1), vec![], Utc::now());
        assert_eq!(summary.dropped, 0);
        assert!(t.subsystem("nqn.a").is_some());
    }

    #[test]
    fn test_learned_subsystem_shared_by_two_sources() {
        let mut t = target();
        apply_fetch(&mut t, &key(1), vec![record("nqn.new", "10.0.0.1", 1)], Utc::now());
        apply_fetch(&mut t, &key(2), vec![record("nqn.new", "10.0.0.2", 2)], Utc::now());

        apply_fetch(&mut t, &key(1), vec![], Utc::now());
        assert_eq!(t.subsystem("nqn.new").unwrap().log_pages.len(), 1);

        forget_source(&mut t, &key(2));
        assert!(t.subsystem("nqn.new").is_none());
    }

    #[test]
    fn test_referral_records_not_learned() {
        let mut t = target();
        let mut referral = record("nqn.2014-08.org.nvmexpress.discovery", "10.0.0.7", 1);
        referral.subtype = SubsystemType::Discovery;

        let summary = apply_fetch(&mut t, &key(1), vec![referral, record("nqn.a", "10.0.0.1", 1)], Utc::now());
        assert_eq!(summary.learned, 0);
        assert_eq!(summary.added, 1);
        assert_eq!(t.subsystems.len(), 1);
    }

    #[test]
    fn test_first_seen_preserved() {
        let mut t = target();
        let t0 = Utc::now();
        apply_fetch(&mut t, &key(1), vec![record("nqn.a", "10.0.0.1", 1)], t0);
        let t1 = t0 + chrono::Duration::seconds(60);
        apply_fetch(&mut t, &key(1), vec![record("nqn.a", "10.0.0.1", 1)], t1);

        let e = &t.subsystems[0].log_pages[0];
        assert_eq!(e.first_seen, t0);
        assert_eq!(e.last_seen, t1);
    }

    #[test]
    fn test_forget_source() {
        let mut t = target();
        apply_fetch(&mut t, &key(1), vec![record("nqn.a", "10.0.0.1", 1)], Utc::now());
        apply_fetch(&mut t, &key(2), vec![record("nqn.a", "10.0.0.2", 2)], Utc::now());
        assert_eq!(forget_source(&mut t, &key(1)), 1);
        assert_eq!(entries(&t).len(), 1);
    }
}
