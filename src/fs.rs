//! Cluster filesystem & permission collaborators (spec ambient module N).
//!
//! spec.md treats the cluster filesystem's atomic replace/distribution and
//! the caller's visibility rules as external collaborators reached only
//! through their interfaces (§1 OUT OF SCOPE). These traits are that
//! interface; `LocalFs`/`AllowAll` are single-node stand-ins good enough
//! for tests and for embedding without a real cluster.

use std::io;
use std::path::{Path, PathBuf};

/// Reads and atomically replaces the shared `storage.cfg`. A real cluster
/// implementation distributes the new bytes to every node; `LocalFs` only
/// guarantees atomicity on the local filesystem via rename-into-place.
pub trait ClusterFs: Send + Sync {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn replace_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
}

pub struct LocalFs;

impl ClusterFs for LocalFs {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn replace_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp_path: PathBuf = dir.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("storage.cfg")
        ));
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, path)
    }
}

/// Delegated visibility check for `list()` (spec §4.D: "Visibility is
/// delegated to the permissions collaborator; this module surfaces all
/// entries it is asked about.").
pub trait StorageVisibility: Send + Sync {
    fn can_see(&self, storeid: &str) -> bool;
}

pub struct AllowAll;

impl StorageVisibility for AllowAll {
    fn can_see(&self, _storeid: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn local_fs_replace_is_atomic_rename() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("storage.cfg");
        let fs = LocalFs;
        fs.replace_file(&path, b"dir: local\n").unwrap();
        assert_eq!(fs.read_file(&path).unwrap(), b"dir: local\n");
        fs.replace_file(&path, b"dir: local\n\tpath /x\n").unwrap();
        assert_eq!(fs.read_file(&path).unwrap(), b"dir: local\n\tpath /x\n");
    }

    #[test]
    fn allow_all_sees_everything() {
        assert!(AllowAll.can_see("anything"));
    }
}
