use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::primitives::hash::Sha256Hash;

/// Root filesystem type. Only the types nbc actually formats are represented; anything else is
/// rejected during validation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FilesystemType {
    Ext4,
    Btrfs,
    Vfat,
}

impl FilesystemType {
    pub fn as_mkfs_type(self) -> &'static str {
        match self {
            FilesystemType::Ext4 => "ext4",
            FilesystemType::Btrfs => "btrfs",
            FilesystemType::Vfat => "vfat",
        }
    }
}

/// Bootloader family written to the ESP. Determined by probing for `bootctl` rather than taken
/// on faith from configuration, but still modeled as a tagged enum rather than a string so
/// callers cannot typo their way into an unhandled branch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BootloaderType {
    Grub2,
    SystemdBoot,
}

/// Which of the two root slots a partition scheme, boot entry, or overlay state refers to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    pub fn mapper_name(self) -> &'static str {
        match self {
            Slot::A => crate::constants::MAPPER_ROOT1,
            Slot::B => crate::constants::MAPPER_ROOT2,
        }
    }
}

/// A partition scheme progresses through these states as the Partitioner, LUKS Manager, and
/// Filesystem Manager act on it. Each state only exposes the operations valid from it, so a
/// caller cannot, say, format a partition that hasn't been encrypted yet when encryption was
/// requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionScheme {
    /// No partitions have been written to the target device yet.
    Empty { device: PathBuf },

    /// `sgdisk` has created the ESP and root/var partitions, but they carry no filesystem or
    /// encryption header yet.
    Partitioned {
        device: PathBuf,
        esp: PathBuf,
        root1: PathBuf,
        root2: PathBuf,
        var: PathBuf,
    },

    /// LUKS2 headers have been written to root1, root2, and var. The ESP is never encrypted.
    Encrypted {
        device: PathBuf,
        esp: PathBuf,
        root1: LuksDevice,
        root2: LuksDevice,
        var: LuksDevice,
    },

    /// Every partition (or its mapped, decrypted device) carries a filesystem.
    Formatted {
        device: PathBuf,
        esp: PathBuf,
        root1: LuksDevice,
        root2: LuksDevice,
        var: LuksDevice,
    },

    /// The slot being installed, plus `/var`, are mounted under a staging root ready for image
    /// extraction.
    Mounted {
        device: PathBuf,
        esp: PathBuf,
        root1: LuksDevice,
        root2: LuksDevice,
        var: LuksDevice,
        mount_root: PathBuf,
    },
}

impl PartitionScheme {
    pub fn device(&self) -> &std::path::Path {
        match self {
            PartitionScheme::Empty { device }
            | PartitionScheme::Partitioned { device, .. }
            | PartitionScheme::Encrypted { device, .. }
            | PartitionScheme::Formatted { device, .. }
            | PartitionScheme::Mounted { device, .. } => device,
        }
    }
}

/// A single LUKS2-backed block device: the raw (still-encrypted) partition path, the
/// device-mapper name it is opened under, and whether it was enrolled for TPM2 auto-unlock.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct LuksDevice {
    pub backing_partition: PathBuf,
    pub mapper_name: String,
    pub tpm2_enrolled: bool,
}

impl LuksDevice {
    pub fn mapper_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/mapper/{}", self.mapper_name))
    }
}

/// The three LUKS container UUIDs and TPM2 enrollment flag for an encrypted install, persisted
/// alongside [`SystemConfig`] so the updater can reopen the same containers without re-probing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct EncryptionRecord {
    pub root1_luks_uuid: uuid::Uuid,
    pub root2_luks_uuid: uuid::Uuid,
    pub var_luks_uuid: uuid::Uuid,
    pub tpm2_enabled: bool,
}

/// Persisted installer/updater state for a host, written to
/// [`crate::constants::STATE_FILE_PATH`] and read back by `update`, `status`, and `list`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct SystemConfig {
    pub device: PathBuf,
    /// Stable `/dev/disk/by-id/*` name. Refreshed on every update; `device` is not, since device
    /// names can renumber across boots.
    pub disk_id: String,
    pub esp: PathBuf,
    pub root1: PathBuf,
    pub root2: PathBuf,
    pub var: PathBuf,
    pub root_filesystem: FilesystemType,
    pub encryption: Option<EncryptionRecord>,
    pub bootloader: BootloaderType,
    pub active_slot: Slot,
    pub image: CachedImageMetadata,
    pub install_date: chrono::DateTime<chrono::Utc>,
    pub kernel_args: Vec<String>,
}

impl SystemConfig {
    pub fn encrypted(&self) -> bool {
        self.encryption.is_some()
    }
}

/// Digest and reference of the image currently installed in a slot, used by
/// `IsUpdateNeeded` to decide whether an update has anything to do.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct CachedImageMetadata {
    pub reference: String,
    pub digest: Sha256Hash,
}

/// Recorded when an update has staged a new slot but the host has not yet rebooted into it.
/// Written to [`crate::constants::REBOOT_REQUIRED_PATH`] on tmpfs; cleared implicitly by reboot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RebootPendingInfo {
    pub staged_slot: Slot,
    pub pending_image_ref: String,
    pub pending_digest: Sha256Hash,
    pub update_time: chrono::DateTime<chrono::Utc>,
    pub target_partition: PathBuf,
}

/// State of the `/etc` persistence overlay as observed on disk: whether the pristine lower
/// snapshot, the upper (writable) directory, and the work directory are all present and
/// consistent with each other.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct OverlayState {
    pub lower_present: bool,
    pub upper_present: bool,
    pub work_present: bool,
}

impl OverlayState {
    pub fn is_consistent(&self) -> bool {
        self.lower_present && self.upper_present && self.work_present
    }
}

/// Severity of a single finding produced by the lint/extraction verifier.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LintSeverity {
    Warning,
    Error,
}

/// A single finding produced while verifying an extracted root or a staged update.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct LintIssue {
    pub check_name: String,
    pub severity: LintSeverity,
    pub message: String,
    pub target_path: PathBuf,
    pub was_fixed: bool,
}

/// Top-level, user-facing configuration assembled from CLI flags before any operation runs.
/// `validate()` is always called before a `Config` is allowed to drive a mutation.
#[derive(Debug, Clone)]
pub struct Config {
    pub target_device: Option<PathBuf>,
    pub loopback_image_path: Option<PathBuf>,
    pub loopback_image_size_bytes: Option<u64>,
    pub image_reference: Option<String>,
    pub local_image_path: Option<PathBuf>,
    pub root_filesystem: FilesystemType,
    pub encrypt: bool,
    pub encryption_passphrase: Option<String>,
    pub tpm2_auto_unlock: bool,
    pub extra_kernel_args: Vec<String>,
    pub root_password: Option<String>,
    pub dry_run: bool,
    pub force: bool,
    pub json_output: bool,
    pub skip_pull: bool,
}

impl Config {
    /// Rejects configurations that are self-contradictory before any disk is touched. Mirrors
    /// the Installer Orchestrator's precondition step: every check here is something the caller
    /// could have fixed without nbc having written anything yet.
    pub fn validate(&self) -> Result<(), crate::error::NbcError> {
        use crate::error::{ErrorKind, MisconfigurationError};

        if self.image_reference.is_some() && self.local_image_path.is_some() {
            return Err(crate::error::NbcError::new(ErrorKind::Misconfiguration(
                MisconfigurationError::ImageRefAndLocalImage,
            )));
        }
        if self.image_reference.is_none() && self.local_image_path.is_none() {
            return Err(crate::error::NbcError::new(ErrorKind::Misconfiguration(
                MisconfigurationError::NoImageReference,
            )));
        }
        if self.target_device.is_some() && self.loopback_image_path.is_some() {
            return Err(crate::error::NbcError::new(ErrorKind::Misconfiguration(
                MisconfigurationError::DeviceAndLoopback,
            )));
        }
        if self.target_device.is_none() && self.loopback_image_path.is_none() {
            return Err(crate::error::NbcError::new(ErrorKind::Misconfiguration(
                MisconfigurationError::NoTarget,
            )));
        }
        if let Some(size) = self.loopback_image_size_bytes {
            if size < crate::constants::LOOPBACK_MIN_SIZE_BYTES {
                return Err(crate::error::NbcError::new(ErrorKind::Misconfiguration(
                    MisconfigurationError::LoopbackTooSmall {
                        requested_bytes: size,
                        min_bytes: crate::constants::LOOPBACK_MIN_SIZE_BYTES,
                    },
                )));
            }
        }
        if self.encrypt && self.encryption_passphrase.is_none() {
            return Err(crate::error::NbcError::new(ErrorKind::Misconfiguration(
                MisconfigurationError::EncryptionRequiresPassphrase,
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            target_device: Some(PathBuf::from("/dev/sdx")),
            loopback_image_path: None,
            loopback_image_size_bytes: None,
            image_reference: Some("example.com/os:latest".to_string()),
            local_image_path: None,
            root_filesystem: FilesystemType::Ext4,
            encrypt: false,
            encryption_passphrase: None,
            tpm2_auto_unlock: false,
            extra_kernel_args: Vec::new(),
            root_password: None,
            dry_run: false,
            force: false,
            json_output: false,
            skip_pull: false,
        }
    }

    #[test]
    fn test_validate_accepts_minimal_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_both_image_sources() {
        let mut config = base_config();
        config.local_image_path = Some(PathBuf::from("/tmp/image.tar"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_neither_image_source() {
        let mut config = base_config();
        config.image_reference = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_both_targets() {
        let mut config = base_config();
        config.loopback_image_path = Some(PathBuf::from("/tmp/disk.img"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_neither_target() {
        let mut config = base_config();
        config.target_device = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_undersized_loopback() {
        let mut config = base_config();
        config.target_device = None;
        config.loopback_image_path = Some(PathBuf::from("/tmp/disk.img"));
        config.loopback_image_size_bytes = Some(1024);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_encryption_without_passphrase() {
        let mut config = base_config();
        config.encrypt = true;
        assert!(config.validate().is_err());
        config.encryption_passphrase = Some("hunter2".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_system_config_json_roundtrip() {
        let config = SystemConfig {
            device: PathBuf::from("/dev/sdx"),
            disk_id: "nvme-SAMSUNG_MZVL2".to_string(),
            esp: PathBuf::from("/dev/sdx1"),
            root1: PathBuf::from("/dev/sdx2"),
            root2: PathBuf::from("/dev/sdx3"),
            var: PathBuf::from("/dev/sdx4"),
            root_filesystem: FilesystemType::Ext4,
            encryption: Some(EncryptionRecord {
                root1_luks_uuid: uuid::Uuid::nil(),
                root2_luks_uuid: uuid::Uuid::nil(),
                var_luks_uuid: uuid::Uuid::nil(),
                tpm2_enabled: true,
            }),
            bootloader: BootloaderType::SystemdBoot,
            active_slot: Slot::A,
            image: CachedImageMetadata {
                reference: "example.com/os:latest".to_string(),
                digest: Sha256Hash::from(
                    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85",
                ),
            },
            install_date: chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
            kernel_args: vec!["console=ttyS0".to_string()],
        };
        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: SystemConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
        assert!(config.encrypted());
    }

    #[test]
    fn test_luks_device_json_roundtrip() {
        let device = LuksDevice {
            backing_partition: PathBuf::from("/dev/sdx2"),
            mapper_name: "root1".to_string(),
            tpm2_enrolled: true,
        };
        let serialized = serde_json::to_string(&device).unwrap();
        let deserialized: LuksDevice = serde_json::from_str(&serialized).unwrap();
        assert_eq!(device, deserialized);
        assert_eq!(device.mapper_path(), PathBuf::from("/dev/mapper/root1"));
    }

    #[test]
    fn test_reboot_pending_info_json_roundtrip() {
        let info = RebootPendingInfo {
            staged_slot: Slot::B,
            pending_image_ref: "example.com/os:v2".to_string(),
            pending_digest: Sha256Hash::from(
                "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85",
            ),
            update_time: chrono::DateTime::parse_from_rfc3339("2026-02-01T00:00:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
            target_partition: PathBuf::from("/dev/sdx3"),
        };
        let serialized = serde_json::to_string(&info).unwrap();
        let deserialized: RebootPendingInfo = serde_json::from_str(&serialized).unwrap();
        assert_eq!(info, deserialized);
    }

    #[test]
    fn test_slot_other_is_involution() {
        assert_eq!(Slot::A.other(), Slot::B);
        assert_eq!(Slot::B.other(), Slot::A);
        assert_eq!(Slot::A.other().other(), Slot::A);
    }

    #[test]
    fn test_overlay_state_consistency() {
        let consistent = OverlayState {
            lower_present: true,
            upper_present: true,
            work_present: true,
        };
        assert!(consistent.is_consistent());

        let missing_work = OverlayState {
            lower_present: true,
            upper_present: true,
            work_present: false,
        };
        assert!(!missing_work.is_consistent());
    }
}
