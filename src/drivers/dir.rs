//! Dir/file backend driver (spec component F).
//!
//! Orchestrates `qemu-img` over a plain directory layout:
//!
//! ```text
//! images/<vmid>/<name>.<ext>
//! private/<vmid>          (rootdir)
//! template/iso/*.iso
//! template/cache/*.tar.gz
//! dump/*                   (backup)
//! ```

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::command::CommandRunner;
use crate::driver::{Feature, PathInfo, StorageConfig, StorageDriver, StorageStatus, VolState, VolumeInfo};
use crate::error::StorageError;
use crate::model::ContentType;
use crate::volume_id::{ImageFormat, ParsedVolname, VolumeKind};

pub struct DirDriver {
    runner: Arc<dyn CommandRunner>,
    command_timeout: Duration,
    df_timeout: Duration,
}

impl DirDriver {
    pub fn new(runner: Arc<dyn CommandRunner>, command_timeout: Duration, df_timeout: Duration) -> Self {
        Self {
            runner,
            command_timeout,
            df_timeout,
        }
    }

    fn path(cfg: &StorageConfig) -> Result<&str, StorageError> {
        cfg.get("path")
            .ok_or_else(|| StorageError::invalid_input("dir storage is missing required option 'path'".to_string()))
    }

    fn images_dir(base: &str, vmid: u32) -> PathBuf {
        Path::new(base).join("images").join(vmid.to_string())
    }

    fn private_dir(base: &str, vmid: u32) -> PathBuf {
        Path::new(base).join("private").join(vmid.to_string())
    }

    fn iso_dir(base: &str) -> PathBuf {
        Path::new(base).join("template").join("iso")
    }

    fn template_dir(base: &str) -> PathBuf {
        Path::new(base).join("template").join("cache")
    }

    fn dump_dir(base: &str) -> PathBuf {
        Path::new(base).join("dump")
    }

    fn run(&self, argv: Vec<String>, cwd: Option<&Path>) -> Result<crate::command::CommandOutput, StorageError> {
        self.runner.run_in(&argv, self.command_timeout, None, cwd)
    }

    /// Checks the volname's parent-reference invariant (spec §3) against
    /// `qemu-img info`'s reported backing file before `create_base` renames
    /// the clone into a new base image.
    fn verify_backing_file(&self, path: &Path, basevmid: u32, basename: &str) -> Result<(), StorageError> {
        let argv = vec![
            "qemu-img".to_string(),
            "info".to_string(),
            "--output=json".to_string(),
            path.to_string_lossy().into_owned(),
        ];
        let out = self.run(argv.clone(), None)?;
        if !out.success() {
            return Err(out.to_backend_error(&argv));
        }
        let expected = format!("../{basevmid}/{basename}");
        if !out.stdout.contains(&expected) {
            return Err(StorageError::precondition(format!(
                "'{}' does not reference its declared base '{expected}'",
                path.display()
            )));
        }
        Ok(())
    }
}

fn parse_image_name(name: &str, expected_vmid: u32) -> Result<(ImageFormat, bool), StorageError> {
    let (stem, ext) = name
        .rsplit_once('.')
        .ok_or_else(|| StorageError::invalid_input(format!("volname '{name}' has no extension")))?;
    let fmt = ImageFormat::from_extension(ext)
        .ok_or_else(|| StorageError::invalid_input(format!("volname '{name}' has unknown format extension '{ext}'")))?;

    if let Some(rest) = stem.strip_prefix(&format!("vm-{expected_vmid}-")) {
        if rest.is_empty() {
            return Err(StorageError::invalid_input(format!("invalid volname '{name}'")));
        }
        Ok((fmt, false))
    } else if let Some(rest) = stem.strip_prefix(&format!("base-{expected_vmid}-")) {
        if rest.is_empty() {
            return Err(StorageError::invalid_input(format!("invalid volname '{name}'")));
        }
        Ok((fmt, true))
    } else {
        Err(StorageError::invalid_input(format!(
            "volname '{name}' does not belong to vmid {expected_vmid}"
        )))
    }
}

fn parse_backup_filename(file: &str) -> Option<u32> {
    const VALID_EXT: [&str; 7] = [".tar", ".tar.gz", ".tar.lzo", ".tgz", ".vma", ".vma.gz", ".vma.lzo"];
    if !VALID_EXT.iter().any(|ext| file.ends_with(ext)) {
        return None;
    }
    let rest = file.strip_prefix("vzdump-")?;
    let rest = rest.strip_prefix("openvz-").or_else(|| rest.strip_prefix("qemu-"))?;
    let vmid_str = rest.split('-').next()?;
    vmid_str.parse().ok()
}

/// Parses the dir backend's volname grammar (spec §3):
/// image, linked clone, iso, vztmpl, backup, rootdir.
pub fn parse_volname(volname: &str) -> Result<ParsedVolname, StorageError> {
    let segments: Vec<&str> = volname.split('/').collect();
    match segments.as_slice() {
        [vmid_str, name] => {
            let vmid: u32 = vmid_str
                .parse()
                .map_err(|_| StorageError::invalid_input(format!("invalid vmid in volname '{volname}'")))?;
            let (fmt, is_base) = parse_image_name(name, vmid)?;
            Ok(ParsedVolname {
                kind: VolumeKind::Image,
                name: name.to_string(),
                vmid,
                basename: None,
                basevmid: None,
                is_base,
                format: Some(fmt),
            })
        }
        [basevmid_str, basename, vmid_str, name] => {
            let basevmid: u32 = basevmid_str
                .parse()
                .map_err(|_| StorageError::invalid_input(format!("invalid base vmid in volname '{volname}'")))?;
            let (_, base_is_base) = parse_image_name(basename, basevmid)?;
            if !base_is_base {
                return Err(StorageError::invalid_input(format!(
                    "linked clone '{volname}' does not reference a base image"
                )));
            }
            let vmid: u32 = vmid_str
                .parse()
                .map_err(|_| StorageError::invalid_input(format!("invalid vmid in volname '{volname}'")))?;
            let (fmt, is_base) = parse_image_name(name, vmid)?;
            if is_base {
                return Err(StorageError::invalid_input(format!(
                    "linked clone '{volname}' cannot itself be a base image"
                )));
            }
            Ok(ParsedVolname {
                kind: VolumeKind::Image,
                name: name.to_string(),
                vmid,
                basename: Some(basename.to_string()),
                basevmid: Some(basevmid),
                is_base: false,
                format: Some(fmt),
            })
        }
        ["iso", file] if file.ends_with(".iso") => Ok(ParsedVolname {
            kind: VolumeKind::Iso,
            name: file.to_string(),
            vmid: 0,
            basename: None,
            basevmid: None,
            is_base: false,
            format: None,
        }),
        ["vztmpl", file] if file.ends_with(".tar.gz") => Ok(ParsedVolname {
            kind: VolumeKind::VzTmpl,
            name: file.to_string(),
            vmid: 0,
            basename: None,
            basevmid: None,
            is_base: false,
            format: None,
        }),
        ["backup", file] => {
            let vmid = parse_backup_filename(file)
                .ok_or_else(|| StorageError::invalid_input(format!("invalid backup volname '{volname}'")))?;
            Ok(ParsedVolname {
                kind: VolumeKind::Backup,
                name: file.to_string(),
                vmid,
                basename: None,
                basevmid: None,
                is_base: false,
                format: None,
            })
        }
        ["rootdir", vmid_str] => {
            let vmid: u32 = vmid_str
                .parse()
                .map_err(|_| StorageError::invalid_input(format!("invalid vmid in volname '{volname}'")))?;
            Ok(ParsedVolname {
                kind: VolumeKind::RootDir,
                name: vmid_str.to_string(),
                vmid,
                basename: None,
                basevmid: None,
                is_base: false,
                format: None,
            })
        }
        _ => Err(StorageError::invalid_input(format!("ill-formed volname '{volname}'"))),
    }
}

/// Formats a `ParsedVolname` back to its canonical volname string (used by
/// the property test that checks `format(parse(v)) == v`).
pub fn format_volname(parsed: &ParsedVolname) -> String {
    match parsed.kind {
        VolumeKind::Image => match (&parsed.basevmid, &parsed.basename) {
            (Some(basevmid), Some(basename)) => {
                format!("{}/{}/{}/{}", basevmid, basename, parsed.vmid, parsed.name)
            }
            _ => format!("{}/{}", parsed.vmid, parsed.name),
        },
        VolumeKind::Iso => format!("iso/{}", parsed.name),
        VolumeKind::VzTmpl => format!("vztmpl/{}", parsed.name),
        VolumeKind::Backup => format!("backup/{}", parsed.name),
        VolumeKind::RootDir => format!("rootdir/{}", parsed.vmid),
    }
}

/// Scans `imgdir` for `(vm|base)-<vmid>-disk-N.<anyext>` and returns the
/// smallest `N >= 1` not present, bounded to 99.
pub fn find_free_diskname(imgdir: &Path, vmid: u32, fmt: ImageFormat) -> Result<String, StorageError> {
    let mut used = std::collections::HashSet::new();
    if let Ok(entries) = std::fs::read_dir(imgdir) {
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else { continue };
            let Some((stem, _ext)) = file_name.rsplit_once('.') else { continue };
            for prefix in [format!("vm-{vmid}-disk-"), format!("base-{vmid}-disk-")] {
                if let Some(n_str) = stem.strip_prefix(&prefix) {
                    if let Ok(n) = n_str.parse::<u32>() {
                        used.insert(n);
                    }
                }
            }
        }
    }
    for n in 1..=99u32 {
        if !used.contains(&n) {
            return Ok(format!("vm-{vmid}-disk-{n}.{}", fmt.extension()));
        }
    }
    Err(StorageError::precondition(format!(
        "no free disk name for vmid {vmid} (99 disks already allocated)"
    )))
}

impl StorageDriver for DirDriver {
    fn type_name(&self) -> &'static str {
        "dir"
    }

    fn parse_volname(&self, volname: &str) -> Result<ParsedVolname, StorageError> {
        parse_volname(volname)
    }

    fn path(&self, cfg: &StorageConfig, volname: &str, _snap: Option<&str>) -> Result<PathInfo, StorageError> {
        let base = Self::path(cfg)?;
        let parsed = parse_volname(volname)?;
        let path = match parsed.kind {
            // Linked clones live alongside ordinary images under their own
            // vmid's images dir; the base-vmid/basename pair in the volname
            // only identifies the backing file, not a separate location.
            VolumeKind::Image => Self::images_dir(base, parsed.vmid).join(&parsed.name),
            VolumeKind::Iso => Self::iso_dir(base).join(&parsed.name),
            VolumeKind::VzTmpl => Self::template_dir(base).join(&parsed.name),
            VolumeKind::Backup => Self::dump_dir(base).join(&parsed.name),
            VolumeKind::RootDir => Self::private_dir(base, parsed.vmid),
        };
        Ok(PathInfo {
            path: path.to_string_lossy().into_owned(),
            vmid: parsed.vmid,
            kind: parsed.kind,
        })
    }

    fn alloc_image(
        &self,
        cfg: &StorageConfig,
        vmid: u32,
        fmt: ImageFormat,
        name: Option<&str>,
        size_kb: u64,
    ) -> Result<String, StorageError> {
        let base = Self::path(cfg)?;
        let imgdir = Self::images_dir(base, vmid);
        std::fs::create_dir_all(&imgdir)?;

        let name = match name {
            Some(n) => {
                if !n.ends_with(&format!(".{}", fmt.extension())) {
                    return Err(StorageError::invalid_input(format!(
                        "volname '{n}' does not match requested format '{fmt}'"
                    )));
                }
                if imgdir.join(n).exists() {
                    return Err(StorageError::precondition(format!("volume '{n}' already exists")));
                }
                n.to_string()
            }
            None => find_free_diskname(&imgdir, vmid, fmt)?,
        };

        let target = imgdir.join(&name);
        let mut argv = vec!["qemu-img".to_string(), "create".to_string()];
        if fmt == ImageFormat::Qcow2 {
            argv.push("-o".to_string());
            argv.push("preallocation=metadata".to_string());
        }
        argv.push("-f".to_string());
        argv.push(fmt.to_string());
        argv.push(target.to_string_lossy().into_owned());
        argv.push(format!("{size_kb}K"));

        let out = self.run(argv.clone(), None)?;
        if !out.success() {
            return Err(out.to_backend_error(&argv));
        }
        Ok(format!("{vmid}/{name}"))
    }

    fn free_image(&self, cfg: &StorageConfig, volname: &str, is_base: bool) -> Result<(), StorageError> {
        let info = self.path(cfg, volname, None)?;
        if is_base {
            let _ = std::fs::set_permissions(&info.path, std::fs::Permissions::from_mode(0o644));
        }
        match std::fs::remove_file(&info.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn list_images(
        &self,
        cfg: &StorageConfig,
        vmid: Option<u32>,
        vollist: Option<&[String]>,
    ) -> Result<Vec<VolumeInfo>, StorageError> {
        let base = Self::path(cfg)?;
        let images_root = Path::new(base).join("images");
        let mut out = Vec::new();
        let Ok(vmid_dirs) = std::fs::read_dir(&images_root) else {
            return Ok(out);
        };
        for vmid_entry in vmid_dirs.flatten() {
            let Ok(dir_vmid) = vmid_entry.file_name().to_string_lossy().parse::<u32>() else { continue };
            if let Some(want) = vmid {
                if want != dir_vmid {
                    continue;
                }
            }
            let Ok(files) = std::fs::read_dir(vmid_entry.path()) else { continue };
            for file in files.flatten() {
                let file_name = file.file_name().to_string_lossy().into_owned();
                let volname = format!("{dir_vmid}/{file_name}");
                if let Some(list) = vollist {
                    if !list.iter().any(|v| v == &volname) {
                        continue;
                    }
                }
                let Ok(parsed) = parse_volname(&volname) else { continue };
                let size = file.metadata().map(|m| m.len()).unwrap_or(0);
                out.push(VolumeInfo {
                    volid: volname,
                    size,
                    format: parsed.format,
                    vmid: Some(dir_vmid),
                    used: Some(size),
                    parent: parsed.basevmid.zip(parsed.basename).map(|(bv, bn)| format!("{bv}/{bn}")),
                });
            }
        }
        Ok(out)
    }

    fn status(&self, cfg: &StorageConfig) -> StorageStatus {
        let Ok(base) = Self::path(cfg) else { return StorageStatus::inactive() };
        let argv = vec![
            "df".to_string(),
            "--output=size,avail".to_string(),
            "-B1".to_string(),
            base.to_string(),
        ];
        let Ok(out) = self.runner.run_in(&argv, self.df_timeout, None, None) else {
            return StorageStatus::inactive();
        };
        if !out.success() {
            return StorageStatus::inactive();
        }
        let Some(data_line) = out.stdout.lines().nth(1) else {
            return StorageStatus::inactive();
        };
        let mut fields = data_line.split_whitespace();
        let (Some(total_str), Some(free_str)) = (fields.next(), fields.next()) else {
            return StorageStatus::inactive();
        };
        let (Ok(total), Ok(free)) = (total_str.parse::<u64>(), free_str.parse::<u64>()) else {
            return StorageStatus::inactive();
        };
        StorageStatus {
            total,
            free,
            used: total.saturating_sub(free),
            active: true,
        }
    }

    fn activate_storage(&self, cfg: &StorageConfig) -> Result<(), StorageError> {
        let base = Self::path(cfg)?;
        if !Path::new(base).exists() {
            return Err(StorageError::backend(format!("storage path '{base}' does not exist")));
        }
        for content in &cfg.content {
            let dir = match content {
                ContentType::Images => Path::new(base).join("images"),
                ContentType::RootDir => Path::new(base).join("private"),
                ContentType::Iso => Self::iso_dir(base),
                ContentType::VzTmpl => Self::template_dir(base),
                ContentType::Backup => Self::dump_dir(base),
                ContentType::None => continue,
            };
            std::fs::create_dir_all(&dir)?;
        }
        if cfg.content.contains(&ContentType::RootDir) {
            std::fs::create_dir_all(Self::dump_dir(base))?;
        }
        Ok(())
    }

    fn deactivate_storage(&self, _cfg: &StorageConfig) -> Result<(), StorageError> {
        Ok(())
    }

    fn clone_image(
        &self,
        cfg: &StorageConfig,
        volname: &str,
        vmid: u32,
        _snap: Option<&str>,
    ) -> Result<String, StorageError> {
        let parsed = parse_volname(volname)?;
        if !parsed.is_base {
            return Err(StorageError::precondition(format!(
                "clone_image: '{volname}' is not a base image"
            )));
        }
        let base = Self::path(cfg)?;
        let clone_dir = Self::images_dir(base, vmid);
        std::fs::create_dir_all(&clone_dir)?;

        let fmt = ImageFormat::Qcow2;
        let name = find_free_diskname(&clone_dir, vmid, fmt)?;
        // The clone's image dir is images/<vmid>/; the base lives in
        // images/<basevmid>/, one level up and back down.
        let backing_rel = format!("../{}/{}", parsed.vmid, parsed.name);

        let mut argv = vec![
            "qemu-img".to_string(),
            "create".to_string(),
            "-f".to_string(),
            fmt.to_string(),
            "-o".to_string(),
            format!("backing_file={backing_rel},backing_fmt=qcow2"),
            name.clone(),
        ];
        let out = self.run(argv.clone(), Some(&clone_dir))?;
        if !out.success() {
            argv[0] = "qemu-img (cwd-relative)".to_string();
            return Err(out.to_backend_error(&argv));
        }

        Ok(format!("{}/{}/{}/{}", parsed.vmid, parsed.name, vmid, name))
    }

    fn create_base(&self, cfg: &StorageConfig, volname: &str) -> Result<String, StorageError> {
        let parsed = parse_volname(volname)?;
        if parsed.is_base {
            return Err(StorageError::precondition(format!("'{volname}' is already a base image")));
        }
        let base = Self::path(cfg)?;
        let imgdir = Self::images_dir(base, parsed.vmid);
        let old_path = imgdir.join(&parsed.name);

        if let (Some(basevmid), Some(basename)) = (&parsed.basevmid, &parsed.basename) {
            self.verify_backing_file(&old_path, *basevmid, basename)?;
        }

        let new_name = parsed
            .name
            .replacen(&format!("vm-{}-", parsed.vmid), &format!("base-{}-", parsed.vmid), 1);
        let new_path = imgdir.join(&new_name);

        std::fs::rename(&old_path, &new_path)?;
        std::fs::set_permissions(&new_path, std::fs::Permissions::from_mode(0o444))?;

        let chattr_argv = vec!["chattr".to_string(), "+i".to_string(), new_path.to_string_lossy().into_owned()];
        match self.run(chattr_argv, None) {
            Ok(out) if !out.success() => log::warn!("chattr +i failed for '{}': {}", new_path.display(), out.stderr),
            Err(e) => log::warn!("chattr +i failed for '{}': {e}", new_path.display()),
            Ok(_) => {}
        }

        Ok(format!("{}/{}", parsed.vmid, new_name))
    }

    fn volume_resize(&self, cfg: &StorageConfig, volname: &str, size_bytes: u64) -> Result<u64, StorageError> {
        let parsed = parse_volname(volname)?;
        let fmt = parsed.format.ok_or_else(|| StorageError::invalid_input("cannot resize a non-image volume".to_string()))?;
        if !matches!(fmt, ImageFormat::Raw | ImageFormat::Qcow2) {
            return Err(StorageError::not_supported("volume_resize", self.type_name().to_string()));
        }
        let info = self.path(cfg, volname, None)?;
        let argv = vec!["qemu-img".to_string(), "resize".to_string(), info.path.clone(), format!("{size_bytes}")];
        let out = self.run(argv.clone(), None)?;
        if !out.success() {
            return Err(out.to_backend_error(&argv));
        }
        Ok(size_bytes)
    }

    fn volume_snapshot(&self, cfg: &StorageConfig, volname: &str, snap: &str) -> Result<(), StorageError> {
        let parsed = parse_volname(volname)?;
        if !matches!(parsed.format, Some(ImageFormat::Qcow2)) {
            return Err(StorageError::not_supported("volume_snapshot", self.type_name().to_string()));
        }
        let info = self.path(cfg, volname, None)?;
        let argv = vec!["qemu-img".to_string(), "snapshot".to_string(), "-c".to_string(), snap.to_string(), info.path];
        let out = self.run(argv.clone(), None)?;
        if !out.success() {
            return Err(out.to_backend_error(&argv));
        }
        Ok(())
    }

    fn volume_snapshot_delete(&self, cfg: &StorageConfig, volname: &str, snap: &str) -> Result<(), StorageError> {
        let info = self.path(cfg, volname, None)?;
        let argv = vec!["qemu-img".to_string(), "snapshot".to_string(), "-d".to_string(), snap.to_string(), info.path];
        let out = self.run(argv.clone(), None)?;
        if !out.success() {
            return Err(out.to_backend_error(&argv));
        }
        Ok(())
    }

    fn volume_snapshot_rollback(&self, cfg: &StorageConfig, volname: &str, snap: &str) -> Result<(), StorageError> {
        if !self.volume_rollback_is_possible(cfg, volname, snap)? {
            return Err(StorageError::precondition(
                "can't rollback, more recent snapshots exist".to_string(),
            ));
        }
        let info = self.path(cfg, volname, None)?;
        let argv = vec!["qemu-img".to_string(), "snapshot".to_string(), "-a".to_string(), snap.to_string(), info.path];
        let out = self.run(argv.clone(), None)?;
        if !out.success() {
            return Err(out.to_backend_error(&argv));
        }
        Ok(())
    }

    fn volume_rollback_is_possible(&self, cfg: &StorageConfig, volname: &str, snap: &str) -> Result<bool, StorageError> {
        let info = self.path(cfg, volname, None)?;
        let argv = vec!["qemu-img".to_string(), "snapshot".to_string(), "-l".to_string(), info.path];
        let out = self.run(argv.clone(), None)?;
        if !out.success() {
            return Err(out.to_backend_error(&argv));
        }
        // qemu-img lists snapshots in creation order; rollback is only
        // possible if `snap` is the last one listed.
        let names: Vec<&str> = out
            .stdout
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().nth(1))
            .collect();
        Ok(names.last() == Some(&snap))
    }

    fn volume_has_feature(
        &self,
        _cfg: &StorageConfig,
        feature: Feature,
        volname: &str,
        snap: Option<&str>,
    ) -> Result<bool, StorageError> {
        let parsed = parse_volname(volname)?;
        let Some(fmt) = parsed.format else { return Ok(false) };
        let state = if snap.is_some() {
            VolState::Snap
        } else if parsed.is_base {
            VolState::Base
        } else {
            VolState::Current
        };
        Ok(feature_matrix(feature, state, fmt))
    }
}

/// `(feature, state, format)` capability matrix for the dir backend.
/// Snapshots require qcow2 (qed is not modeled, as the core never creates
/// qed images). Clone/template are base-only; copy (full copy) works for
/// any current image.
fn feature_matrix(feature: Feature, state: VolState, fmt: ImageFormat) -> bool {
    match feature {
        Feature::Snapshot => fmt == ImageFormat::Qcow2,
        Feature::Clone => state == VolState::Base && fmt == ImageFormat::Qcow2,
        Feature::Template => state != VolState::Snap,
        Feature::Copy => true,
    }
}
