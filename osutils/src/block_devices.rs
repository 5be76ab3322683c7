use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{ensure, Context, Error};

use crate::sgdisk;

/// One entry in the kernel's block-device list, as discovered under `/sys/block`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    pub device: PathBuf,
    pub size_bytes: u64,
    pub model: Option<String>,
    pub removable: bool,
    pub partitions: Vec<PathBuf>,
}

/// Enumerates every whole-disk block device under `/sys/block`, skipping loop, device-mapper,
/// and ram devices, which are never install targets. Reads are best-effort per §4.1: a missing
/// attribute leaves the field empty rather than failing the whole probe.
pub fn list_disks() -> Result<Vec<DiskInfo>, Error> {
    let sys_block = Path::new("/sys/block");
    let mut disks = Vec::new();

    let entries = fs::read_dir(sys_block)
        .with_context(|| format!("Failed to read '{}'", sys_block.display()))?;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("loop") || name.starts_with("dm-") || name.starts_with("ram") {
            continue;
        }

        let sys_dir = entry.path();
        let device = Path::new("/dev").join(name.as_ref());

        let size_bytes = fs::read_to_string(sys_dir.join("size"))
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|sectors| sectors * 512)
            .unwrap_or_default();

        let model = fs::read_to_string(sys_dir.join("device/model"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let removable = fs::read_to_string(sys_dir.join("removable"))
            .ok()
            .map(|s| s.trim() == "1")
            .unwrap_or(false);

        let partitions = fs::read_dir(&sys_dir)
            .into_iter()
            .flatten()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(name.as_ref()))
            .map(|e| Path::new("/dev").join(e.file_name()))
            .collect();

        disks.push(DiskInfo {
            device,
            size_bytes,
            model,
            removable,
            partitions,
        });
    }

    disks.sort_by(|a, b| a.device.cmp(&b.device));
    Ok(disks)
}

/// Resolves `device` to its preferred `/dev/disk/by-id/*` entry. Preference order: `nvme-*`
/// (with `nvme-eui.*` deprioritized within that group) > `ata-*` > `scsi-*` > first remaining
/// entry, matching udev's own naming precedence for real disk hardware.
pub fn get_disk_id(device: impl AsRef<Path>) -> Result<PathBuf, Error> {
    let device = device.as_ref();
    let canonical = device
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize device path '{}'", device.display()))?;

    let by_id_dir = Path::new("/dev/disk/by-id");
    let mut candidates: Vec<PathBuf> = fs::read_dir(by_id_dir)
        .with_context(|| format!("Failed to read '{}'", by_id_dir.display()))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            !p.file_name()
                .map(|n| n.to_string_lossy().contains("-part"))
                .unwrap_or(true)
        })
        .filter(|p| p.canonicalize().map(|c| c == canonical).unwrap_or(false))
        .collect();

    candidates.sort();

    let rank = |p: &Path| -> u8 {
        let name = p.file_name().unwrap_or_default().to_string_lossy();
        if name.starts_with("nvme-eui.") {
            3
        } else if name.starts_with("nvme-") {
            0
        } else if name.starts_with("ata-") {
            1
        } else if name.starts_with("scsi-") {
            2
        } else {
            4
        }
    };
    candidates.sort_by_key(|p| rank(p));

    candidates
        .into_iter()
        .next()
        .with_context(|| format!("Failed to find a stable by-id path for '{}'", device.display()))
}

/// True when `expected` is empty, or the disk's current by-id name equals `expected`. Used by
/// the updater to detect that the boot disk was swapped since install.
pub fn verify_disk_id(device: impl AsRef<Path>, expected: &str) -> bool {
    if expected.is_empty() {
        return true;
    }
    match get_disk_id(device) {
        Ok(path) => path
            .file_name()
            .map(|n| n.to_string_lossy() == expected)
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Splits a partition device path into its parent disk and 1-based partition index. Delegates
/// to [`sgdisk::parse_partition_device`], which already applies the `nvme`/`mmcblk` `pN`-suffix
/// rule versus the plain trailing-digit rule used elsewhere.
pub fn parse_partition_device(path: impl AsRef<Path>) -> Option<(PathBuf, u32)> {
    sgdisk::parse_partition_device(path.as_ref())
}

/// Validates that `device` exists, is at least `min_size` bytes, and has no currently-mounted
/// partition, returning a distinct error for each case so the caller can report which
/// precondition failed.
pub fn validate_disk(device: impl AsRef<Path>, min_size: u64) -> Result<(), Error> {
    let device = device.as_ref();
    ensure!(
        device.exists(),
        "Device '{}' does not exist",
        device.display()
    );

    let disks = list_disks()?;
    let disk = disks
        .iter()
        .find(|d| d.device == device)
        .with_context(|| format!("Device '{}' is not a recognized disk", device.display()))?;

    ensure!(
        disk.size_bytes >= min_size,
        "Device '{}' is {} bytes, smaller than the required minimum of {} bytes",
        device.display(),
        disk.size_bytes,
        min_size
    );

    let mounted = mounted_devices()?;
    for partition in &disk.partitions {
        ensure!(
            !mounted.contains(partition),
            "Device '{}' has mounted partition '{}'",
            device.display(),
            partition.display()
        );
    }

    Ok(())
}

fn mounted_devices() -> Result<Vec<PathBuf>, Error> {
    let contents = fs::read_to_string("/proc/mounts").context("Failed to read '/proc/mounts'")?;
    Ok(contents
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|field| field.starts_with("/dev/"))
        .map(PathBuf::from)
        .collect())
}

/// Returns the path of the first symlink in `directory` whose canonical target is `target`.
pub fn find_symlink_for_target(
    target: impl AsRef<Path>,
    directory: impl AsRef<Path>,
) -> Result<PathBuf, Error> {
    let target_canonicalized = target.as_ref().canonicalize().with_context(|| {
        format!(
            "Failed to canonicalize target path '{}'",
            target.as_ref().display()
        )
    })?;

    fs::read_dir(directory.as_ref())?
        .flatten()
        .filter(|f| {
            f.file_type()
                .ok()
                .map(|t| t.is_symlink())
                .unwrap_or_default()
        })
        .map(|entry| entry.path())
        .filter(|path| {
            path.canonicalize()
                .map(|p| target_canonicalized == p)
                .unwrap_or_default()
        })
        .min()
        .with_context(|| {
            format!(
                "Failed to find symlink for '{}' in directory '{}'",
                target.as_ref().display(),
                directory.as_ref().display()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_disk_id_empty_expected_always_true() {
        assert!(verify_disk_id(Path::new("/dev/does-not-exist"), ""));
    }

    #[test]
    fn test_verify_disk_id_mismatched_device_is_false() {
        assert!(!verify_disk_id(
            Path::new("/dev/does-not-exist"),
            "nvme-SAMSUNG_MZVL2"
        ));
    }

    #[test]
    fn test_validate_disk_missing_device() {
        let err = validate_disk(Path::new("/dev/nbc-test-missing-disk"), 0).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_find_symlink_for_target() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().canonicalize().unwrap();
        let symlink = temp_dir.path().join("symlink");
        std::os::unix::fs::symlink(&target, &symlink).unwrap();
        assert_eq!(
            find_symlink_for_target(&target, temp_dir.path()).unwrap(),
            symlink
        );

        let symlink = temp_dir.path().join("asymlink");
        std::os::unix::fs::symlink(&target, &symlink).unwrap();
        assert_eq!(
            find_symlink_for_target(&target, temp_dir.path()).unwrap(),
            symlink
        );
    }

    #[test]
    fn test_find_symlink_for_target_fail_no_symlink() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().canonicalize().unwrap();
        let temp_dir2 = tempfile::tempdir().unwrap();
        assert_eq!(
            find_symlink_for_target(&target, temp_dir2.path())
                .unwrap_err()
                .to_string(),
            format!(
                "Failed to find symlink for '{}' in directory '{}'",
                target.display(),
                temp_dir2.path().display()
            )
        );
    }
}
