//! Volume identifier codec (spec component A).
//!
//! Pure functions only: parsing never touches the filesystem or spawns a
//! process. `parse_volname` grammars are backend-specific and live in
//! `drivers::dir` / `drivers::zfs`; this module owns the backend-agnostic
//! `storeid:volname` split, the `StorageId` grammar, and the shared image
//! format enum.

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `[a-z][a-z0-9._-]*[a-z0-9]`, checked without a regex engine so the crate
/// stays dependency-light; single character storeids (`"a"`) are also
/// accepted since the grammar's middle class is optional.
pub fn validate_storage_id(s: &str) -> Result<(), StorageError> {
    let bytes = s.as_bytes();
    let bad = || StorageError::invalid_input(format!("invalid storage ID '{s}'"));

    let first = *bytes.first().ok_or_else(bad)?;
    if !first.is_ascii_lowercase() {
        return Err(bad());
    }
    let last = *bytes.last().ok_or_else(bad)?;
    if !(last.is_ascii_lowercase() || last.is_ascii_digit()) {
        return Err(bad());
    }
    for &b in bytes {
        let ok = b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'_' || b == b'-';
        if !ok {
            return Err(bad());
        }
    }
    Ok(())
}

/// Splits `"storeid:volname"` into its two parts, validating the storeid
/// grammar. The volname is returned unparsed; backend-specific grammars are
/// applied separately via `StorageDriver::parse_volname`.
pub fn parse_volume_id(id: &str) -> Result<(String, String), StorageError> {
    let (storeid, volname) = id
        .split_once(':')
        .ok_or_else(|| StorageError::invalid_input(format!("not a valid volume ID '{id}'")))?;
    if volname.is_empty() {
        return Err(StorageError::invalid_input(format!(
            "not a valid volume ID '{id}'"
        )));
    }
    validate_storage_id(storeid)?;
    Ok((storeid.to_string(), volname.to_string()))
}

pub fn format_volume_id(storeid: &str, volname: &str) -> String {
    format!("{storeid}:{volname}")
}

/// Default image format from {raw, qcow2, vmdk}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    Qcow2,
    Raw,
    Vmdk,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vmdk => "vmdk",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "raw" => Some(ImageFormat::Raw),
            "qcow2" => Some(ImageFormat::Qcow2),
            "vmdk" => Some(ImageFormat::Vmdk),
            _ => None,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for ImageFormat {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s)
            .ok_or_else(|| StorageError::invalid_input(format!("unknown image format '{s}'")))
    }
}

/// The kind of thing a volname addresses, shared across backends even
/// though the concrete grammar differs (dir vs. zfs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeKind {
    Image,
    Iso,
    VzTmpl,
    Backup,
    RootDir,
}

/// Result of parsing a volname: `(vtype, name, vmid, basename?, basevmid?, isBase, format)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedVolname {
    pub kind: VolumeKind,
    pub name: String,
    pub vmid: u32,
    pub basename: Option<String>,
    pub basevmid: Option<u32>,
    pub is_base: bool,
    pub format: Option<ImageFormat>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_ids() {
        assert!(validate_storage_id("local").is_ok());
        assert!(validate_storage_id("my-store.1").is_ok());
        assert!(validate_storage_id("a").is_ok());
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(validate_storage_id("1local").is_err());
        assert!(validate_storage_id("Local").is_err());
        assert!(validate_storage_id("local-").is_err());
        assert!(validate_storage_id("").is_err());
    }

    #[test]
    fn splits_volume_id() {
        let (storeid, volname) = parse_volume_id("local:100/vm-100-disk-1.qcow2").unwrap();
        assert_eq!(storeid, "local");
        assert_eq!(volname, "100/vm-100-disk-1.qcow2");
    }

    #[test]
    fn rejects_missing_colon() {
        assert!(parse_volume_id("local-vm-100-disk-1.qcow2").is_err());
    }

    #[test]
    fn format_roundtrips_through_parse() {
        let id = format_volume_id("local", "100/vm-100-disk-1.qcow2");
        let (storeid, volname) = parse_volume_id(&id).unwrap();
        assert_eq!(format_volume_id(&storeid, &volname), id);
    }

    #[test]
    fn image_format_roundtrips() {
        for fmt in [ImageFormat::Raw, ImageFormat::Qcow2, ImageFormat::Vmdk] {
            assert_eq!(ImageFormat::from_extension(fmt.extension()), Some(fmt));
        }
    }
}
