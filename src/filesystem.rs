use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use nbc_api::config::{FilesystemType, LuksDevice, PartitionScheme};
use osutils::filesystems::{MkfsFileSystemType, MountFileSystemType};
use osutils::{mkfs, mount};

fn target_device(device: &Path, luks: Option<&LuksDevice>) -> PathBuf {
    match luks {
        Some(luks) => luks.mapper_path(),
        None => device.to_path_buf(),
    }
}

/// Formats the ESP as FAT32 and each root slot plus `var` with `root_filesystem`. If `scheme` is
/// encrypted, formatters target the mapper paths rather than the raw partitions.
pub fn format_partitions(
    scheme: &PartitionScheme,
    root_filesystem: FilesystemType,
) -> Result<(), Error> {
    let (esp, root1, root2, var, luks1, luks2, lukv) = match scheme {
        PartitionScheme::Partitioned {
            esp, root1, root2, var, ..
        } => (esp, root1, root2, var, None, None, None),
        PartitionScheme::Encrypted {
            esp, root1, root2, var, ..
        } => (esp, &root1.backing_partition, &root2.backing_partition, &var.backing_partition, Some(root1), Some(root2), Some(var)),
        _ => anyhow::bail!("format_partitions requires a Partitioned or Encrypted scheme"),
    };

    mkfs::run(esp, MkfsFileSystemType::Vfat).context("Failed to format ESP as FAT32")?;

    let root_mkfs = MkfsFileSystemType::from_api_type(root_filesystem);
    mkfs::run(&target_device(root1, luks1), root_mkfs)
        .context("Failed to format root1 partition")?;
    mkfs::run(&target_device(root2, luks2), root_mkfs)
        .context("Failed to format root2 partition")?;
    mkfs::run(&target_device(var, lukv), root_mkfs).context("Failed to format var partition")?;

    Ok(())
}

/// Mounts `root1` on `mount_root`, then `var` on `mount_root/var`, then the ESP on
/// `mount_root/boot`. Parent directories are created as needed. On any failure, already-mounted
/// paths are unwound before returning.
pub fn mount_partitions(
    scheme: &PartitionScheme,
    mount_root: impl AsRef<Path>,
    root_filesystem: FilesystemType,
) -> Result<(), Error> {
    let mount_root = mount_root.as_ref();
    let (esp, root, var, luks_root, luks_var) = match scheme {
        PartitionScheme::Formatted {
            esp, root1, var, ..
        } => (esp, &root1.backing_partition, &var.backing_partition, Some(root1), Some(var)),
        _ => anyhow::bail!("mount_partitions requires a Formatted scheme"),
    };

    let root_fs = MountFileSystemType::from_api_type(root_filesystem);
    let mut mounted = Vec::new();

    let result = (|| -> Result<(), Error> {
        mount::ensure_mount_directory(mount_root)?;
        mount::mount(&target_device(root, luks_root), mount_root, root_fs, &[])
            .context("Failed to mount root partition")?;
        mounted.push(mount_root.to_path_buf());

        let var_dir = mount_root.join("var");
        mount::ensure_mount_directory(&var_dir)?;
        mount::mount(&target_device(var, luks_var), &var_dir, root_fs, &[])
            .context("Failed to mount var partition")?;
        mounted.push(var_dir);

        let boot_dir = mount_root.join("boot");
        mount::ensure_mount_directory(&boot_dir)?;
        mount::mount(esp, &boot_dir, MountFileSystemType::Vfat, &[])
            .context("Failed to mount ESP")?;
        mounted.push(boot_dir);

        Ok(())
    })();

    if result.is_err() {
        for path in mounted.iter().rev() {
            if let Err(e) = mount::umount(path, false) {
                log::warn!("Failed to unwind mount '{}': {e:#}", path.display());
            }
        }
    }

    result
}

/// Unmounts `boot`, then `var`, then the root, tolerating entries that are already unmounted.
/// Does not remove `mount_root` itself.
pub fn unmount_partitions(mount_root: impl AsRef<Path>) -> Result<(), Error> {
    let mount_root = mount_root.as_ref();
    for relative in ["boot", "var", ""] {
        let path = mount_root.join(relative);
        if !path.exists() {
            continue;
        }
        match mount::umount(&path, false) {
            Ok(()) => {}
            Err(e) if e.to_string().contains("not mounted") => {}
            Err(e) => log::warn!("Failed to unmount '{}': {e:#}", path.display()),
        }
    }
    Ok(())
}

/// Writes a minimal `/etc/fstab` to `target_root`. `/boot` and `/var` are mounted via
/// `systemd.mount-extra=` on the kernel command line and the root device comes from `root=`, so
/// the only line is a commented alternate-root entry kept for operator reference. `device` is
/// only a reference noted in the comment; either the install-time device or a persisted
/// `SystemConfig::device` from a later update works here.
pub fn create_fstab(target_root: impl AsRef<Path>, device: &Path) -> Result<(), Error> {
    let contents = format!(
        "# This file is intentionally near-empty. The root filesystem is specified by `root=`\n\
         # and `/boot` and `/var` are mounted via `systemd.mount-extra=` on the kernel command\n\
         # line, both written by the bootloader at install/update time. The line below is kept\n\
         # only as a reference for the device this slot was installed from; it is not parsed.\n\
         # {device} / auto defaults 0 0\n",
        device = device.display(),
    );
    std::fs::write(target_root.as_ref().join("etc/fstab"), contents)
        .context("Failed to write /etc/fstab")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_fstab_is_commented_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        create_fstab(dir.path(), Path::new("/dev/sda")).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("etc/fstab")).unwrap();
        for line in contents.lines() {
            assert!(line.is_empty() || line.starts_with('#'));
        }
        assert!(contents.contains("/dev/sda"));
    }

    #[test]
    fn test_unmount_partitions_tolerates_missing_mount_root() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-mounted-anywhere");
        unmount_partitions(&missing).unwrap();
    }
}
