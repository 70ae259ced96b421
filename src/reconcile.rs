//! Reconcile CLI stub (spec ambient module O, design notes §9).
//!
//! §7 documents an accepted limitation: `create`/`delete` run a backend
//! action and then a config write as two separate steps, and nothing here
//! attempts a distributed transaction across them. If the backend step
//! succeeds but the config write fails (or is lost to a concurrent update),
//! the cluster ends up with backend state and config state that disagree.
//! Design notes §9 says to "expose a reconcile command to the CLI
//! collaborator" rather than solve this with two-phase commit; this module
//! is that command's engine. The CLI itself is out of scope (spec §1); this
//! crate only computes the list of findings for an external caller to
//! present, grounded in the teacher's `backup/validation.rs` style (read
//! actual state, compare against expected, return a list of issues).
//!
//! Scope is deliberately narrow: this can only detect a config entry whose
//! declared backend is unreachable (`activate_storage` fails) — the
//! direction spec §7's hazard actually names ("VG created but config write
//! failed" means the backend resource exists and the config entry does
//! not, which from the config's point of view is indistinguishable from
//! "never existed"; only a full out-of-band backend inventory, which is
//! backend-specific and not part of the §4.E contract, could detect the
//! reverse direction).

use chrono::{DateTime, Utc};

use crate::config_api::StorageEntry;
use crate::error::StorageError;
use crate::facade::{self, DriverRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileIssueKind {
    /// The config entry is enabled and resolvable, but its driver's
    /// `activate_storage` failed — the backend resource the config
    /// describes (directory, pool, ...) does not actually exist or is not
    /// reachable from this node.
    BackendUnreachable,
    /// The config names a storage type with no registered driver in this
    /// process (e.g. `lvm`, `iscsi`): not itself an inconsistency, but the
    /// reconciler cannot verify these entries and says so rather than
    /// silently skipping them.
    UnverifiableType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileIssue {
    pub storeid: String,
    pub kind: ReconcileIssueKind,
    pub detail: String,
    /// When the reconciler observed this, so a CLI can tell a stale finding
    /// from one raised by the run just requested.
    pub detected_at: DateTime<Utc>,
}

/// Checks every entry `entries` against `registry`, reporting storages
/// whose declared backend cannot actually be activated. Disabled or
/// node-restricted entries are resolved with `noerr = true` and skipped
/// silently — an inactive entry activating is not an inconsistency.
pub fn find_orphaned_backends(
    entries: &[StorageEntry],
    registry: &DriverRegistry,
    local_node: Option<&str>,
) -> Vec<ReconcileIssue> {
    let mut issues = Vec::new();

    for entry in entries {
        let cfg = match facade::resolve(entry, local_node, true) {
            Ok(Some(cfg)) => cfg,
            Ok(None) => continue,
            Err(e) => {
                issues.push(ReconcileIssue {
                    storeid: entry.storeid.clone(),
                    kind: ReconcileIssueKind::BackendUnreachable,
                    detail: e.to_string(),
                    detected_at: Utc::now(),
                });
                continue;
            }
        };

        let driver = match registry.get(&cfg) {
            Ok(driver) => driver,
            Err(_) => {
                issues.push(ReconcileIssue {
                    storeid: entry.storeid.clone(),
                    kind: ReconcileIssueKind::UnverifiableType,
                    detail: format!("no registered driver for storage type '{}'", cfg.type_name),
                    detected_at: Utc::now(),
                });
                continue;
            }
        };

        if let Err(e) = driver.activate_storage(&cfg) {
            issues.push(ReconcileIssue {
                storeid: entry.storeid.clone(),
                kind: ReconcileIssueKind::BackendUnreachable,
                detail: e.to_string(),
                detected_at: Utc::now(),
            });
        }
    }

    issues
}

/// Convenience used by a CLI `reconcile` command: same as
/// `find_orphaned_backends` but surfaces a single combined error instead of
/// a findings list, for callers that just want "is everything consistent?"
pub fn assert_consistent(
    entries: &[StorageEntry],
    registry: &DriverRegistry,
    local_node: Option<&str>,
) -> Result<(), StorageError> {
    let issues = find_orphaned_backends(entries, registry, local_node);
    if issues.is_empty() {
        return Ok(());
    }
    let summary = issues
        .iter()
        .map(|i| format!("{}: {}", i.storeid, i.detail))
        .collect::<Vec<_>>()
        .join("; ");
    Err(StorageError::backend(format!(
        "reconcile found {} inconsistent storage(s): {summary}",
        issues.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::DirDriver;
    use crate::model::ConfigDigest;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn entry(storeid: &str, path: &str) -> StorageEntry {
        let mut properties = BTreeMap::new();
        properties.insert("path".to_string(), path.to_string());
        StorageEntry {
            storeid: storeid.to_string(),
            type_name: "dir".to_string(),
            properties,
            digest: ConfigDigest::of(b"test"),
        }
    }

    #[test]
    fn flags_config_entry_with_missing_backend_path() {
        let entries = vec![entry("gone", "/nonexistent/path/for/reconcile/test")];
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(DirDriver::new(
            Arc::new(crate::command::RealCommandRunner),
            Duration::from_secs(5),
            Duration::from_secs(2),
        )));

        let issues = find_orphaned_backends(&entries, &registry, None);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, ReconcileIssueKind::BackendUnreachable);
    }

    #[test]
    fn flags_unverifiable_type_when_no_driver_registered() {
        let mut properties = BTreeMap::new();
        properties.insert("vgname".to_string(), "myvg".to_string());
        let entries = vec![StorageEntry {
            storeid: "vg1".to_string(),
            type_name: "lvm".to_string(),
            properties,
            digest: ConfigDigest::of(b"test"),
        }];
        let registry = DriverRegistry::new();

        let issues = find_orphaned_backends(&entries, &registry, None);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, ReconcileIssueKind::UnverifiableType);
    }

    #[test]
    fn clean_config_reports_no_issues() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![entry("ok", dir.path().to_str().unwrap())];
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(DirDriver::new(
            Arc::new(crate::command::RealCommandRunner),
            Duration::from_secs(5),
            Duration::from_secs(2),
        )));

        let issues = find_orphaned_backends(&entries, &registry, None);
        assert!(issues.is_empty());
    }
}
