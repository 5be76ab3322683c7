use std::fs;
use std::{path::Path, process::Command};

use anyhow::{bail, Context, Error};
use log::info;

use crate::{exe::RunAndCheck, files, filesystems::MountFileSystemType};

/// Mounts file or block device in path to a dir mount_dir.
pub fn mount(
    path: impl AsRef<Path>,
    mount_dir: impl AsRef<Path>,
    filesystem: MountFileSystemType,
    options: &[String],
) -> Result<(), Error> {
    let mut options = options.to_owned();
    let mut command = Command::new("mount");

    // Check if file_path is a regular file and not a block device
    if path.as_ref().is_file() {
        // Use -o loop for mounting files
        options.push("loop".into());
    }

    if !options.is_empty() {
        command.arg("-o").arg(options.join(","));
    }

    // Execute the mount command
    command
        .arg("-t")
        .arg(filesystem.name())
        .arg(path.as_ref())
        .arg(mount_dir.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to mount {} to path {}",
            path.as_ref().display(),
            mount_dir.as_ref().display(),
        ))?;

    Ok(())
}

/// Create a recursive bind mount for mount_dir as an alias of path, including
/// all sub-mounts. The mount is private, confining mount/unmount events to this
/// point.
pub fn private_rbind_mount(
    path: impl AsRef<Path>,
    mount_dir: impl AsRef<Path>,
) -> Result<(), Error> {
    Command::new("mount")
        .arg("--rbind")
        .arg("--make-rprivate")
        .arg(path.as_ref())
        .arg(mount_dir.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to mount {} as a bind mount for {}",
            path.as_ref().display(),
            mount_dir.as_ref().display(),
        ))
}

/// Recursively remounts a given directory as private.
pub fn remount_rprivate(mount_dir: impl AsRef<Path>) -> Result<(), Error> {
    Command::new("mount")
        .arg("--make-rprivate")
        .arg(mount_dir.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to remount {} as private",
            mount_dir.as_ref().display(),
        ))
}

/// Unmounts given directory mount_dir.
pub fn umount(mount_dir: impl AsRef<Path>, recursive: bool) -> Result<(), Error> {
    let mut cmd = Command::new("umount");
    if recursive {
        cmd.arg("-R");
    }

    // Try to unmount the directory
    cmd.arg(mount_dir.as_ref()).run_and_check().with_context(|| {
        format!(
            "Failed to unmount directory {}",
            mount_dir.as_ref().display()
        )
    })?;

    Ok(())
}

// MountGuard is a helper struct that automatically unmounts a directory when it goes out of scope.
// It is used to ensure that the ESP image is unmounted even if the function returns early.
pub struct MountGuard<'a> {
    pub mount_dir: &'a Path,
}

impl<'a> Drop for MountGuard<'a> {
    fn drop(&mut self) {
        if let Err(e) = umount(self.mount_dir, false) {
            info!(
                "Failed to unmount directory {}: {}",
                self.mount_dir.display(),
                e
            );
        }
    }
}

/// Ensure that the target_path is a suitable path for a mount point
pub fn ensure_mount_directory(target_path: &Path) -> Result<(), Error> {
    if target_path.exists() {
        if !target_path.is_dir() {
            bail!("Mount path '{}' is not a directory", target_path.display());
        }
        if let Ok(entries) = fs::read_dir(target_path) {
            if entries.count() > 0 {
                bail!("Mount path '{}' is not empty", target_path.display());
            }
        }
    } else {
        files::create_dirs(target_path).context(format!(
            "Failed to create mount path '{}'",
            target_path.display()
        ))?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs::File;

    use tempfile::TempDir;

    #[test]
    fn test_ensure_mount_directory() {
        let temp_mount_dir = TempDir::new().unwrap();

        // Test case 1: Ensure a directory that exists and is empty
        ensure_mount_directory(temp_mount_dir.path()).unwrap();

        // Test case 2: Ensure a directory that does not exist
        let temp_mount_point_dir = temp_mount_dir.path().join("temp_dir");
        ensure_mount_directory(&temp_mount_point_dir).unwrap();
        assert!(temp_mount_point_dir.exists());

        // Test case 3: Ensure a directory that exists and is not empty
        assert_eq!(
            ensure_mount_directory(temp_mount_dir.path())
                .unwrap_err()
                .to_string(),
            format!(
                "Mount path '{}' is not empty",
                temp_mount_dir.path().display()
            )
        );

        // Test case 4: Ensure a file path does not work
        let temp_mount_point_file = temp_mount_dir.path().join("temp_file");
        File::create(&temp_mount_point_file).unwrap();
        assert_eq!(
            ensure_mount_directory(&temp_mount_point_file)
                .unwrap_err()
                .to_string(),
            format!(
                "Mount path '{}' is not a directory",
                temp_mount_point_file.display()
            )
        );
    }
}

