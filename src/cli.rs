use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use nbc_api::config::FilesystemType;

use crate::NBC_VERSION;

#[derive(Parser, Debug)]
#[clap(name = "nbc", version = NBC_VERSION)]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, long, default_value_t = LevelFilter::Info)]
    pub verbosity: LevelFilter,

    /// Emit progress as JSON Lines instead of human-readable text
    #[arg(global = true, long)]
    pub json: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

/// Root filesystem choice for newly-formatted partitions. Mirrors
/// [`nbc_api::config::FilesystemType`]; kept as a separate type so `clap::ValueEnum` does not leak
/// into `nbc_api`, which has no CLI dependency.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum CliFilesystemType {
    Ext4,
    Btrfs,
}

impl From<CliFilesystemType> for FilesystemType {
    fn from(value: CliFilesystemType) -> Self {
        match value {
            CliFilesystemType::Ext4 => FilesystemType::Ext4,
            CliFilesystemType::Btrfs => FilesystemType::Btrfs,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Partition a device (or loopback image), extract a container image onto it, and install a
    /// bootloader
    Install {
        /// Image reference to pull, e.g. `registry.example.com/os:latest`
        #[clap(long, conflicts_with = "local_image")]
        image: Option<String>,

        /// Path to a pre-staged local OCI layout; skips all network access
        #[clap(long, conflicts_with = "image")]
        local_image: Option<PathBuf>,

        /// Target block device, e.g. `/dev/sda`
        #[clap(long, conflicts_with = "loopback")]
        device: Option<PathBuf>,

        /// Create (or reuse) a loopback image at this path instead of a physical device
        #[clap(long, conflicts_with = "device")]
        loopback: Option<PathBuf>,

        /// Size of the loopback image in bytes; defaults to the 35 GiB minimum
        #[clap(long)]
        loopback_size_bytes: Option<u64>,

        /// Root filesystem for both A/B slots and `/var`
        #[clap(long, value_enum, default_value = "ext4")]
        filesystem: CliFilesystemType,

        /// Extra kernel command-line argument; may be repeated
        #[clap(long = "kernel-arg")]
        kernel_args: Vec<String>,

        /// Encrypt root1, root2, and var with LUKS2
        #[clap(long)]
        encrypt: bool,

        /// Passphrase for LUKS2 encryption; required with `--encrypt`
        #[clap(long, requires = "encrypt")]
        passphrase: Option<String>,

        /// Enroll a TPM2 device for automatic unlock; requires `--encrypt`
        #[clap(long, requires = "encrypt")]
        tpm2: bool,

        /// Password to set for root; if omitted the account is left locked
        #[clap(long)]
        root_password: Option<String>,

        /// Log every action without touching any disk
        #[clap(long)]
        dry_run: bool,

        /// Skip the interactive confirmation prompt
        #[clap(long)]
        force: bool,
    },

    /// Extract a new image onto the inactive A/B slot and rewrite the bootloader to boot it next
    Update {
        /// Image reference to pull; defaults to the reference recorded at the last install/update
        #[clap(long, conflicts_with = "local_image")]
        image: Option<String>,

        /// Path to a pre-staged local OCI layout; skips all network access
        #[clap(long, conflicts_with = "image")]
        local_image: Option<PathBuf>,

        /// Re-extract even if the resolved digest matches the installed digest
        #[clap(long)]
        force: bool,

        /// Use only the local image cache; never contact the registry
        #[clap(long)]
        skip_pull: bool,

        /// Log every action without touching any disk
        #[clap(long)]
        dry_run: bool,
    },

    /// List block devices eligible as install targets
    List,

    /// Print the persisted `SystemConfig` for the currently installed system
    Status,

    /// Validate a would-be install/update configuration without touching any disk
    Validate {
        /// Image reference to validate
        #[clap(long, conflicts_with = "local_image")]
        image: Option<String>,

        /// Path to a pre-staged local OCI layout
        #[clap(long, conflicts_with = "image")]
        local_image: Option<PathBuf>,

        /// Target block device
        #[clap(long, conflicts_with = "loopback")]
        device: Option<PathBuf>,

        /// Loopback image path
        #[clap(long, conflicts_with = "device")]
        loopback: Option<PathBuf>,

        /// Size of the loopback image in bytes
        #[clap(long)]
        loopback_size_bytes: Option<u64>,

        /// Encrypt root1, root2, and var with LUKS2
        #[clap(long)]
        encrypt: bool,

        /// Passphrase for LUKS2 encryption
        #[clap(long)]
        passphrase: Option<String>,
    },

    /// Print the `nbc` version
    Version,
}
