//! Concrete `StorageDriver` implementations (spec components F and G).
//!
//! Every other registered plugin type (lvm, iscsi, nfs, glusterfs, nexenta)
//! is config/schema-validated only — `facade::DriverRegistry` has no entry
//! for them, so dispatch fails with `StorageError::NotSupported` rather than
//! a default method quietly no-opping.

pub mod dir;
pub mod zfs;

pub use dir::DirDriver;
pub use zfs::ZfsDriver;
