//! Storage-level façade (spec component I).
//!
//! `resolve` turns a raw `StorageEntry` (component D) into a usable,
//! node-restriction-checked `StorageConfig` (component E); `DriverRegistry`
//! maps `type_name -> driver` and ensures `activate_storage` (idempotent)
//! has run before dispatching any other operation, matching design notes
//! §9's "polymorphism without inheritance".

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config_api::StorageEntry;
use crate::driver::{StorageConfig, StorageDriver};
use crate::error::StorageError;
use crate::model::ContentType;
use crate::plugin;
use crate::volume_id::ImageFormat;

/// A `StorageEntry` decoded into the typed shape drivers operate on.
pub type ResolvedStorage = StorageConfig;

fn decode_entry(entry: &StorageEntry) -> Result<ResolvedStorage, StorageError> {
    let descriptor = plugin::lookup(&entry.type_name)?;

    let content = match entry.properties.get("content") {
        Some(raw) => plugin::decode_content(raw, &descriptor.content_modes.allowed)?,
        None => descriptor.content_modes.default.clone(),
    };
    let nodes = entry
        .properties
        .get("nodes")
        .map(|raw| plugin::decode_nodes(raw, None))
        .transpose()?
        .filter(|s: &BTreeSet<String>| !s.is_empty());
    let disable = entry
        .properties
        .get("disable")
        .map(|raw| plugin::decode_bool(raw))
        .transpose()?
        .unwrap_or(false);
    let shared = entry
        .properties
        .get("shared")
        .map(|raw| plugin::decode_bool(raw))
        .transpose()?
        .unwrap_or(false);
    let maxfiles = entry
        .properties
        .get("maxfiles")
        .map(|raw| raw.parse::<u64>())
        .transpose()
        .map_err(|_| StorageError::invalid_input("maxfiles must be a non-negative integer".to_string()))?
        .unwrap_or(0);
    let format = entry
        .properties
        .get("format")
        .map(|raw| raw.parse::<ImageFormat>())
        .transpose()?;

    let mut extra = BTreeMap::new();
    for (key, value) in &entry.properties {
        if !matches!(key.as_str(), "content" | "nodes" | "disable" | "shared" | "maxfiles" | "format") {
            extra.insert(key.clone(), value.clone());
        }
    }

    Ok(StorageConfig {
        storeid: entry.storeid.clone(),
        type_name: entry.type_name.clone(),
        content,
        nodes,
        disable,
        shared,
        maxfiles,
        format,
        extra,
    })
}

/// Decodes `entry` and enforces the disable/nodes restriction rules (spec
/// §4.I); pass `noerr = true` to get `None` instead of an error when the
/// storage is unreachable from `local_node`.
pub fn resolve(
    entry: &StorageEntry,
    local_node: Option<&str>,
    noerr: bool,
) -> Result<Option<ResolvedStorage>, StorageError> {
    let cfg = decode_entry(entry)?;

    let unreachable = cfg.disable
        || match (&cfg.nodes, local_node) {
            (Some(nodes), Some(node)) => !nodes.is_empty() && !nodes.contains(node),
            _ => false,
        };

    if unreachable {
        if noerr {
            return Ok(None);
        }
        return Err(StorageError::precondition(format!(
            "storage '{}' is disabled or not available on this node",
            cfg.storeid
        )));
    }

    Ok(Some(cfg))
}

/// `type_name -> driver` table. Types with no entry here are registered in
/// the plugin registry for config/schema purposes only; dispatching any
/// operation against them fails with `StorageError::NotSupported`.
pub struct DriverRegistry {
    drivers: BTreeMap<&'static str, Arc<dyn StorageDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            drivers: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, driver: Arc<dyn StorageDriver>) {
        self.drivers.insert(driver.type_name(), driver);
    }

    pub fn get(&self, cfg: &StorageConfig) -> Result<&Arc<dyn StorageDriver>, StorageError> {
        self.drivers
            .get(cfg.type_name.as_str())
            .ok_or_else(|| StorageError::not_supported("dispatch", cfg.type_name.clone()))
    }

    /// Runs `activate_storage` (idempotent, spec §4.E) and then `op`,
    /// exactly the pattern every public volume operation follows.
    pub fn dispatch<T>(
        &self,
        cfg: &StorageConfig,
        op: impl FnOnce(&Arc<dyn StorageDriver>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let driver = self.get(cfg)?;
        driver.activate_storage(cfg)?;
        op(driver)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_api::StorageEntry;
    use crate::model::ConfigDigest;

    fn entry(storeid: &str, properties: &[(&str, &str)]) -> StorageEntry {
        StorageEntry {
            storeid: storeid.to_string(),
            type_name: "dir".to_string(),
            properties: properties.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            digest: ConfigDigest::of(b"test"),
        }
    }

    #[test]
    fn resolve_fills_defaults() {
        let e = entry("mydir", &[("path", "/srv/x")]);
        let cfg = resolve(&e, None, false).unwrap().unwrap();
        assert!(cfg.content.contains(&ContentType::Images));
        assert!(!cfg.disable);
    }

    #[test]
    fn resolve_rejects_disabled_storage_unless_noerr() {
        let e = entry("mydir", &[("path", "/srv/x"), ("disable", "1")]);
        assert!(resolve(&e, None, false).is_err());
        assert_eq!(resolve(&e, None, true).unwrap(), None);
    }

    #[test]
    fn resolve_rejects_node_restricted_storage_from_other_node() {
        let e = entry("mydir", &[("path", "/srv/x"), ("nodes", "node-a,node-b")]);
        assert!(resolve(&e, Some("node-c"), false).is_err());
        assert!(resolve(&e, Some("node-a"), false).unwrap().is_some());
    }

    #[test]
    fn dispatch_fails_not_supported_for_unregistered_type() {
        let registry = DriverRegistry::new();
        let e = entry("mydir", &[("path", "/srv/x")]);
        let cfg = resolve(&e, None, false).unwrap().unwrap();
        let err = registry.dispatch(&cfg, |d| Ok(d.type_name())).unwrap_err();
        assert!(matches!(err, StorageError::NotSupported { .. }));
    }
}
