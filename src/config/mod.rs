//! This crate's own runtime configuration (spec ambient module K) —
//! distinct from the cluster-wide `storage.cfg` that [`crate::section_config`]
//! and [`crate::config_api`] own. `storage.cfg` is shared, lock-guarded, and
//! mutated through the CRUD API; `RuntimeConfig` is local-process-only and
//! describes where that file lives and how long external commands are
//! allowed to run, mirroring the teacher's `ServerConfig` (JSON file,
//! write-default-on-missing, a small `ConfigError` enum).

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Local-process configuration: where the shared config lives, where the
/// node-local lock directory is, and the default timeouts for each external
/// tool family (spec §5's "defaults: 5 s zfs, 10 s udev settle, 2 s df").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub storage_cfg_path: PathBuf,
    pub lock_dir: PathBuf,
    pub command_timeout_secs: u64,
    pub udev_settle_timeout_secs: u64,
    pub df_timeout_secs: u64,
}

impl RuntimeConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn udev_settle_timeout(&self) -> Duration {
        Duration::from_secs(self.udev_settle_timeout_secs)
    }

    pub fn df_timeout(&self) -> Duration {
        Duration::from_secs(self.df_timeout_secs)
    }
}

/// Defaults match spec §4.H/§5: `/etc/pve/storage.cfg` as the canonical
/// config path, `/var/lock/pve-manager` as the node-local lock directory.
impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            storage_cfg_path: PathBuf::from("/etc/pve/storage.cfg"),
            lock_dir: PathBuf::from("/var/lock/pve-manager"),
            command_timeout_secs: 5,
            udev_settle_timeout_secs: 10,
            df_timeout_secs: 2,
        }
    }
}

/// Possible errors reading or writing the runtime config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConfigError {
    FileNotFound,
    FailedToWrite,
    ParseError,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileNotFound => write!(f, "runtime config file not found"),
            ConfigError::FailedToWrite => write!(f, "failed to write runtime config file"),
            ConfigError::ParseError => write!(f, "failed to parse runtime config file"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl RuntimeConfig {
    /// Reads `path`, creating it with defaults if missing. Teacher's
    /// `ServerConfig::read` hardcodes `"config.json"`; this takes an
    /// explicit path since a library has no fixed working directory to
    /// assume one in.
    pub fn read(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                let default = RuntimeConfig::default();
                default.write(path)?;
                return Ok(default);
            }
        };
        serde_json::from_str(&content).map_err(|_| ConfigError::ParseError)
    }

    pub fn write(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self).map_err(|_| ConfigError::ParseError)?;
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(path, content).map_err(|_| ConfigError::FailedToWrite)
    }
}

/// Process-global default runtime config, read lazily from
/// `OMNI_STORAGE_RUNTIME_CONFIG` (or left at built-in defaults if that
/// variable is unset). `once_cell::sync::Lazy` replaces the teacher's
/// `lazy_static!` — both provide a thread-safe, initialize-once static, but
/// `once_cell` is already a dependency this crate needs elsewhere (the
/// plugin registry, §4.C) and a library shouldn't pull in a second crate to
/// do the same job (noted in DESIGN.md as a deliberate idiom upgrade, not a
/// behavior change).
pub static RUNTIME_CONFIG: Lazy<Arc<RuntimeConfig>> = Lazy::new(|| {
    let path = std::env::var_os("OMNI_STORAGE_RUNTIME_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/pve/omni-storage-core.json"));
    match RuntimeConfig::read(&path) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            log::warn!("failed to read runtime config from '{}': {e}; using defaults", path.display());
            Arc::new(RuntimeConfig::default())
        }
    }
});
