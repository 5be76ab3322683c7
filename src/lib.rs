pub mod bootloader;
pub mod cancellation;
pub mod cli;
pub mod etc_persistence;
pub mod filesystem;
pub mod installer;
pub mod lint;
pub mod loopback;
pub mod luks;
pub mod oci;
pub mod partition;
pub mod progress;
pub mod updater;

/// `nbc` crate version, surfaced by the `version` CLI subcommand.
pub const NBC_VERSION: &str = env!("CARGO_PKG_VERSION");
