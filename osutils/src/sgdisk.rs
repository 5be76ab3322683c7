use std::path::{Path, PathBuf};

use anyhow::{Context, Error};

use crate::{dependencies::Dependency, exe::RunAndCheck, partition_types::PartitionGuidType, udevadm};

/// A partition to create on a disk, expressed the way `sgdisk -n` wants it: a 1-based partition
/// number, a start sector (`0` meaning "next free sector"), and an end expressed either as a
/// size in sectors from the start or `0` to mean "rest of the disk".
#[derive(Debug, Clone, Copy)]
pub struct PartitionSpec {
    pub number: u32,
    pub size_bytes: Option<u64>,
    pub guid_type: PartitionGuidType,
    pub label: &'static str,
}

/// Wipes any pre-existing partition table on `device` and writes a fresh GPT with the given
/// partitions in order, then waits for udev to create the corresponding device nodes.
///
/// Returns the resolved `/dev/...N` path for each partition, in the same order as `partitions`.
pub fn create_gpt_table(
    device: impl AsRef<Path>,
    partitions: &[PartitionSpec],
) -> Result<Vec<PathBuf>, Error> {
    let device = device.as_ref();

    let mut cmd = Dependency::Sgdisk.cmd();
    cmd.arg("--zap-all").arg(device);
    cmd.run_and_check()
        .with_context(|| format!("Failed to clear existing partition table on '{}'", device.display()))?;

    let mut cmd = Dependency::Sgdisk.cmd();
    cmd.arg("--clear");
    for partition in partitions {
        let end = match partition.size_bytes {
            Some(bytes) => format!("+{bytes}"),
            None => "0".to_string(),
        };
        cmd.arg("-n").arg(format!("{}:0:{}", partition.number, end));
        cmd.arg("-t")
            .arg(format!("{}:{}", partition.number, partition.guid_type.sgdisk_code()));
        cmd.arg("-c").arg(format!("{}:{}", partition.number, partition.label));
    }
    cmd.arg(device);
    cmd.run_and_check()
        .with_context(|| format!("Failed to partition device '{}'", device.display()))?;

    udevadm::settle().context("Failed to wait for udev after partitioning")?;

    Ok(partitions
        .iter()
        .map(|p| partition_device_path(device, p.number))
        .collect())
}

/// Appends the device's kernel partition-numbering convention: a trailing digit for most
/// devices (`/dev/sda` -> `/dev/sda1`), or a `pN` suffix for devices that already end in a
/// digit (`/dev/nvme0n1` -> `/dev/nvme0n1p1`, `/dev/loop0` -> `/dev/loop0p1`).
pub fn partition_device_path(device: impl AsRef<Path>, number: u32) -> PathBuf {
    let device = device.as_ref();
    let ends_in_digit = device
        .to_string_lossy()
        .chars()
        .next_back()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false);

    if ends_in_digit {
        PathBuf::from(format!("{}p{}", device.display(), number))
    } else {
        PathBuf::from(format!("{}{}", device.display(), number))
    }
}

/// Parses a partition device path back into its parent disk and partition number, the inverse
/// of [`partition_device_path`].
pub fn parse_partition_device(path: impl AsRef<Path>) -> Option<(PathBuf, u32)> {
    let s = path.as_ref().to_string_lossy().to_string();
    if let Some(p_pos) = s.rfind('p') {
        let (disk, rest) = s.split_at(p_pos);
        let number_str = &rest[1..];
        if !disk.is_empty()
            && disk.chars().next_back().map(|c| c.is_ascii_digit()).unwrap_or(false)
            && !number_str.is_empty()
            && number_str.chars().all(|c| c.is_ascii_digit())
        {
            if let Ok(number) = number_str.parse() {
                return Some((PathBuf::from(disk), number));
            }
        }
    }

    let digit_start = s.rfind(|c: char| !c.is_ascii_digit()).map(|i| i + 1)?;
    if digit_start == s.len() {
        return None;
    }
    let number = s[digit_start..].parse().ok()?;
    Some((PathBuf::from(&s[..digit_start]), number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_device_path_sata() {
        assert_eq!(
            partition_device_path(Path::new("/dev/sda"), 1),
            PathBuf::from("/dev/sda1")
        );
    }

    #[test]
    fn test_partition_device_path_nvme() {
        assert_eq!(
            partition_device_path(Path::new("/dev/nvme0n1"), 2),
            PathBuf::from("/dev/nvme0n1p2")
        );
    }

    #[test]
    fn test_partition_device_path_loop() {
        assert_eq!(
            partition_device_path(Path::new("/dev/loop0"), 3),
            PathBuf::from("/dev/loop0p3")
        );
    }

    #[test]
    fn test_parse_partition_device_roundtrip_sata() {
        let path = partition_device_path(Path::new("/dev/sda"), 2);
        assert_eq!(
            parse_partition_device(&path),
            Some((PathBuf::from("/dev/sda"), 2))
        );
    }

    #[test]
    fn test_parse_partition_device_roundtrip_nvme() {
        let path = partition_device_path(Path::new("/dev/nvme1n1"), 4);
        assert_eq!(
            parse_partition_device(&path),
            Some((PathBuf::from("/dev/nvme1n1"), 4))
        );
    }

    #[test]
    fn test_parse_partition_device_roundtrip_loop() {
        let path = partition_device_path(Path::new("/dev/loop3"), 1);
        assert_eq!(
            parse_partition_device(&path),
            Some((PathBuf::from("/dev/loop3"), 1))
        );
    }
}
