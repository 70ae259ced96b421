//! Storage-abstraction core for a cluster virtualization manager.
//!
//! This crate is the control-plane layer higher-level subsystems (VM
//! lifecycle, backup, migration) use to allocate, locate, snapshot, clone,
//! resize, and free volumes on heterogeneous storage backends without
//! knowing which backend they're talking to. No data-path bytes ever flow
//! through here — only names, paths, and orchestration of external tools.
//!
//! Module map, leaves first:
//! - [`error`] / [`model`] / [`volume_id`] — shared types with no
//!   dependencies of their own.
//! - [`section_config`] — the flat `storage.cfg` text format.
//! - [`plugin`] — per-type schema assembly and option validation.
//! - [`driver`] — the `StorageDriver` trait every backend implements.
//! - [`drivers`] — the two reference backends: [`drivers::dir`] and
//!   [`drivers::zfs`].
//! - [`lock`] / [`fs`] — the cluster-lock and cluster-filesystem
//!   collaborators, reached only through narrow traits.
//! - [`command`] — external process orchestration shared by both drivers.
//! - [`config_api`] — the CRUD surface over `storage.cfg`.
//! - [`facade`] — resolves a `storeid` to a driver and dispatches.
//! - [`config`] — this crate's own runtime configuration (distinct from
//!   the cluster-wide `storage.cfg`).
//! - [`reconcile`] — detects the two-phase backend/config mutation hazard.
//! - [`logging`] — `log`/`env_logger` initialization.

pub mod command;
pub mod config;
pub mod config_api;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod facade;
pub mod fs;
pub mod lock;
pub mod logging;
pub mod model;
pub mod plugin;
pub mod reconcile;
pub mod section_config;
pub mod volume_id;

pub use driver::StorageDriver;
pub use error::{Result, StorageError};
