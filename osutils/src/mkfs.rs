use std::path::Path;

use anyhow::{Context, Error};

use crate::{dependencies::Dependency, exe::RunAndCheck, filesystems::MkfsFileSystemType};

pub fn run(device_path: &Path, filesystem: MkfsFileSystemType) -> Result<(), Error> {
    let mut cmd = Dependency::Mkfs.cmd();
    cmd.arg("--type").arg(filesystem.name());
    if filesystem == MkfsFileSystemType::Vfat {
        cmd.arg("-F").arg("32");
    }
    cmd.arg(device_path)
        .run_and_check()
        .context("Failed to execute mkfs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_fails_on_missing_device() {
        assert!(run(Path::new("/dev/does-not-exist-at-all"), MkfsFileSystemType::Ext4).is_err());
    }
}
