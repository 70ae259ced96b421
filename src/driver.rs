//! Backend contract (spec component E).
//!
//! The polymorphic surface every backend implements. Re-architected per
//! design notes §9 as an explicit trait plus a registry mapping
//! `type_name -> driver`, rather than the subclass-of-a-base-class shape of
//! the original: shared defaults live in free functions drivers call into
//! (see `drivers::dir`/`drivers::zfs`), not in a base-trait default method
//! that would quietly paper over "not supported".

use std::collections::BTreeMap;

use crate::error::StorageError;
use crate::model::ConfigDigest;
use crate::volume_id::{ImageFormat, ParsedVolname};

/// A single storage declaration, decoded from its `RawSection` by the
/// plugin registry (component C). `extra` carries the type-specific and
/// passthrough-unknown keys verbatim.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub storeid: String,
    pub type_name: String,
    pub content: std::collections::BTreeSet<crate::model::ContentType>,
    pub nodes: Option<std::collections::BTreeSet<String>>,
    pub disable: bool,
    pub shared: bool,
    pub maxfiles: u64,
    pub format: Option<ImageFormat>,
    pub extra: BTreeMap<String, String>,
}

impl StorageConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    pub path: String,
    pub vmid: u32,
    pub kind: crate::volume_id::VolumeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeInfo {
    pub volid: String,
    pub size: u64,
    pub format: Option<ImageFormat>,
    pub vmid: Option<u32>,
    pub used: Option<u64>,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStatus {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub active: bool,
}

impl StorageStatus {
    pub fn inactive() -> Self {
        Self {
            total: 0,
            free: 0,
            used: 0,
            active: false,
        }
    }
}

/// Indexes the feature matrix of `volume_has_feature`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Snapshot,
    Clone,
    Template,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolState {
    Base,
    Current,
    Snap,
}

pub fn digest_matches(expected: &ConfigDigest, current: &ConfigDigest) -> bool {
    expected == current
}

/// Every backend implements this capability set. Missing capabilities
/// return `StorageError::NotSupported`, never a silent no-op (spec §4.E).
pub trait StorageDriver: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn parse_volname(&self, volname: &str) -> Result<ParsedVolname, StorageError>;

    fn path(
        &self,
        cfg: &StorageConfig,
        volname: &str,
        snap: Option<&str>,
    ) -> Result<PathInfo, StorageError>;

    fn alloc_image(
        &self,
        cfg: &StorageConfig,
        vmid: u32,
        fmt: ImageFormat,
        name: Option<&str>,
        size_kb: u64,
    ) -> Result<String, StorageError>;

    fn free_image(&self, cfg: &StorageConfig, volname: &str, is_base: bool) -> Result<(), StorageError>;

    fn list_images(
        &self,
        cfg: &StorageConfig,
        vmid: Option<u32>,
        vollist: Option<&[String]>,
    ) -> Result<Vec<VolumeInfo>, StorageError>;

    /// Never returns `Err`; transport failure degrades to
    /// `StorageStatus::inactive()` (spec §4.E/§7 kind 6).
    fn status(&self, cfg: &StorageConfig) -> StorageStatus;

    fn activate_storage(&self, cfg: &StorageConfig) -> Result<(), StorageError>;
    fn deactivate_storage(&self, cfg: &StorageConfig) -> Result<(), StorageError>;

    fn activate_volume(&self, cfg: &StorageConfig, volname: &str, snap: Option<&str>) -> Result<(), StorageError> {
        let _ = (cfg, volname, snap);
        Ok(())
    }

    fn deactivate_volume(&self, cfg: &StorageConfig, volname: &str, snap: Option<&str>) -> Result<(), StorageError> {
        let _ = (cfg, volname, snap);
        Ok(())
    }

    fn clone_image(
        &self,
        cfg: &StorageConfig,
        volname: &str,
        vmid: u32,
        snap: Option<&str>,
    ) -> Result<String, StorageError>;

    fn create_base(&self, cfg: &StorageConfig, volname: &str) -> Result<String, StorageError>;

    fn volume_resize(&self, cfg: &StorageConfig, volname: &str, size_bytes: u64) -> Result<u64, StorageError>;

    fn volume_snapshot(&self, cfg: &StorageConfig, volname: &str, snap: &str) -> Result<(), StorageError>;
    fn volume_snapshot_delete(&self, cfg: &StorageConfig, volname: &str, snap: &str) -> Result<(), StorageError>;
    fn volume_snapshot_rollback(&self, cfg: &StorageConfig, volname: &str, snap: &str) -> Result<(), StorageError>;
    fn volume_rollback_is_possible(&self, cfg: &StorageConfig, volname: &str, snap: &str) -> Result<bool, StorageError>;

    fn volume_has_feature(
        &self,
        cfg: &StorageConfig,
        feature: Feature,
        volname: &str,
        snap: Option<&str>,
    ) -> Result<bool, StorageError>;
}
