//! Logging initialization (spec ambient module M).
//!
//! This crate logs exclusively through the `log` facade (`log::info!`,
//! `log::warn!`, ...) the way every other module here already does —
//! [`section_config`](crate::section_config) warns on duplicate storeids,
//! the dir driver warns on a failed `chattr`, the zfs driver's busy retry
//! would log its attempt count. Unlike the teacher's `cluster.rs`, which
//! mixes `println!` into otherwise `log`-based code, nothing in this crate
//! writes to stdout directly; an embedding binary decides where log output
//! goes by installing whatever `log` implementation it wants.
//!
//! `init_logging` is a thin, optional convenience around `env_logger`,
//! useful for integration tests and any binary that embeds this crate
//! without already having its own logger installed.

/// Installs `env_logger` as the global logger if one isn't already set.
/// Safe to call more than once (subsequent calls are no-ops); the teacher's
/// `main.rs` calls `env_logger::init()` unconditionally since it only runs
/// once per process, but library code may be embedded in a binary that
/// already initialized its own logger, so this swallows the "already
/// initialized" error instead of panicking.
pub fn init_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .is_test(cfg!(test))
        .try_init();
}
