//! Shared config-level value types used by both the section parser (B) and
//! the plugin registry (C): content types and the optimistic-concurrency
//! digest.

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The role a storage declares it can hold. Variant order is alphabetical
/// by wire name so the derived `Ord` matches the writer's "sorted" rule for
/// comma-joined content lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ContentType {
    Backup,
    Images,
    Iso,
    None,
    RootDir,
    VzTmpl,
}

impl ContentType {
    pub fn wire_name(self) -> &'static str {
        match self {
            ContentType::Backup => "backup",
            ContentType::Images => "images",
            ContentType::Iso => "iso",
            ContentType::None => "none",
            ContentType::RootDir => "rootdir",
            ContentType::VzTmpl => "vztmpl",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl std::str::FromStr for ContentType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(ContentType::Backup),
            "images" => Ok(ContentType::Images),
            "iso" => Ok(ContentType::Iso),
            "none" => Ok(ContentType::None),
            "rootdir" => Ok(ContentType::RootDir),
            "vztmpl" => Ok(ContentType::VzTmpl),
            other => Err(StorageError::invalid_input(format!(
                "unknown content type '{other}'"
            ))),
        }
    }
}

/// Opaque hash of the serialized config, used as an optimistic-concurrency
/// precondition on `update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDigest(pub(crate) String);

impl ConfigDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn of(bytes: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        ConfigDigest(hex::encode(hasher.finalize()))
    }
}

impl fmt::Display for ConfigDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
