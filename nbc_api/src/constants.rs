// On-disk layout and runtime path constants.

/// Minimum size of the EFI system partition.
pub const ESP_MIN_SIZE_BYTES: u64 = 512 * 1024 * 1024;

/// Nominal size of each A/B root partition on a dedicated target device.
pub const ROOT_PARTITION_SIZE_BYTES: u64 = 12 * 1024 * 1024 * 1024;

/// Minimum size accepted for a loopback-backed install image.
pub const LOOPBACK_MIN_SIZE_BYTES: u64 = 35 * 1024 * 1024 * 1024;

/// Device-mapper name for the first root slot's decrypted mapping.
pub const MAPPER_ROOT1: &str = "root1";

/// Device-mapper name for the second root slot's decrypted mapping.
pub const MAPPER_ROOT2: &str = "root2";

/// Device-mapper name for the shared `/var` partition's decrypted mapping.
pub const MAPPER_VAR: &str = "var";

/// Persisted installer/updater state, one JSON document per host.
pub const STATE_FILE_PATH: &str = "/var/lib/nbc/state/config.json";

/// Directory holding the pristine `/etc` snapshot used for three-way merges.
pub const ETC_LOWER_DIR: &str = "/.etc.lower";

/// Pristine `/etc` snapshot taken at install time, used as the merge base for [`ETC_LOWER_DIR`].
pub const ETC_PRISTINE_DIR: &str = "/var/lib/nbc/etc.pristine";

/// Upper directory of the `/etc` persistence overlay.
pub const ETC_OVERLAY_UPPER_DIR: &str = "/var/lib/nbc/etc-overlay/upper";

/// Work directory of the `/etc` persistence overlay.
pub const ETC_OVERLAY_WORK_DIR: &str = "/var/lib/nbc/etc-overlay/work";

/// Marker file written once an update has staged a new slot and a reboot is required to
/// activate it.
pub const REBOOT_REQUIRED_PATH: &str = "/run/nbc/reboot-required";

/// Marker file written by the initrd naming which slot this boot actually used.
pub const BOOTED_SLOT_MARKER_PATH: &str = "/run/nbc-booted";

/// Exclusive lock file preventing concurrent installer/updater invocations.
pub const LOCK_FILE_PATH: &str = "/run/nbc/lock";

/// Sentinel content of `/etc/machine-id` before first boot assigns a real id.
pub const MACHINE_ID_UNINITIALIZED: &str = "uninitialized\n";

/// Name of the directory under `/usr/lib/modules/<version>` that should contain `vmlinuz`.
pub const KERNEL_MODULES_DIR: &str = "/usr/lib/modules";

/// Device-mapper multipath kernel argument value used to disable nvme multipathing.
pub const NVME_MULTIPATH_DISABLED: &str = "0";

/// Whiteout marker recreated as an opaque directory attribute.
pub const OCI_OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Prefix identifying a per-entry whiteout file in an OCI layer tarball.
pub const OCI_WHITEOUT_PREFIX: &str = ".wh.";

/// Value used for `IsUpdateNeeded` checks when a cached image has no recorded digest.
pub const IMAGE_SHA256_CHECKSUM_IGNORED: &str = "ignored";
