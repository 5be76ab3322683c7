use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Error};
use nbc_api::config::PartitionScheme;
use osutils::{
    block_devices, partition_types::PartitionGuidType, sgdisk, udevadm, wipefs,
};

const POLL_BUDGET: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Clears filesystem signatures, then zaps any existing GPT. Precedes [`create_partitions`] on
/// any device that may have been previously used.
pub fn wipe_disk(device: impl AsRef<Path>) -> Result<(), Error> {
    wipefs::all(device.as_ref()).context("Failed to wipe filesystem signatures")?;
    Ok(())
}

/// Lays out the fixed four-partition scheme from spec.md §3 on `device` and returns a
/// `Partitioned` scheme. In `dry_run`, logs the operation and returns an `Empty` scheme without
/// touching the disk.
pub fn create_partitions(
    device: impl AsRef<Path>,
    root_size_bytes: u64,
    dry_run: bool,
) -> Result<PartitionScheme, Error> {
    let device = device.as_ref().to_path_buf();

    if dry_run {
        log::info!(
            "dry-run: would create boot/root1/root2/var partitions on '{}'",
            device.display()
        );
        return Ok(PartitionScheme::Empty { device });
    }

    let specs = [
        sgdisk::PartitionSpec {
            number: 1,
            size_bytes: Some(nbc_api::constants::ESP_MIN_SIZE_BYTES),
            guid_type: PartitionGuidType::Esp,
            label: "UEFI",
        },
        sgdisk::PartitionSpec {
            number: 2,
            size_bytes: Some(root_size_bytes),
            guid_type: PartitionGuidType::LinuxGeneric,
            label: "root1",
        },
        sgdisk::PartitionSpec {
            number: 3,
            size_bytes: Some(root_size_bytes),
            guid_type: PartitionGuidType::LinuxGeneric,
            label: "root2",
        },
        sgdisk::PartitionSpec {
            number: 4,
            size_bytes: None,
            guid_type: PartitionGuidType::LinuxGeneric,
            label: "var",
        },
    ];

    let paths = sgdisk::create_gpt_table(&device, &specs)
        .with_context(|| format!("Failed to partition device '{}'", device.display()))?;
    let [esp, root1, root2, var]: [PathBuf; 4] = paths
        .try_into()
        .map_err(|_| anyhow::anyhow!("sgdisk did not return exactly 4 partition paths"))?;

    for partition in [&esp, &root1, &root2, &var] {
        await_partition_node(partition)?;
    }

    Ok(PartitionScheme::Partitioned {
        device,
        esp,
        root1,
        root2,
        var,
    })
}

/// Bounded poll for a partition device node to appear after the kernel re-reads the partition
/// table. `udevadm settle` has already been run by [`sgdisk::create_gpt_table`]; this covers the
/// remaining race on slower block layers (loopback, some USB controllers).
fn await_partition_node(path: &Path) -> Result<(), Error> {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() > POLL_BUDGET {
            bail!(
                "Timed out waiting for partition device node '{}' to appear",
                path.display()
            );
        }
        std::thread::sleep(POLL_INTERVAL);
        let _ = udevadm::settle();
    }
    Ok(())
}

/// Reconstructs a `PartitionScheme` purely from the disk's partition-numbering convention,
/// without reading GPT content. Fails if any of the four expected partitions does not exist,
/// since there is then no scheme to detect.
pub fn detect_existing_scheme(device: impl AsRef<Path>) -> Result<PartitionScheme, Error> {
    let device = device.as_ref().to_path_buf();
    let esp = sgdisk::partition_device_path(&device, 1);
    let root1 = sgdisk::partition_device_path(&device, 2);
    let root2 = sgdisk::partition_device_path(&device, 3);
    let var = sgdisk::partition_device_path(&device, 4);

    for (name, path) in [("esp", &esp), ("root1", &root1), ("root2", &root2), ("var", &var)] {
        ensure!(
            path.exists(),
            "Expected partition '{}' ({}) does not exist on '{}'",
            name,
            path.display(),
            device.display()
        );
    }

    Ok(PartitionScheme::Partitioned {
        device,
        esp,
        root1,
        root2,
        var,
    })
}

/// Thin re-export of the Disk Probe contract used by the orchestrators, kept here so callers
/// only need to import `partition` for both steps of "find a disk, then lay it out".
pub use block_devices::{get_disk_id, list_disks, parse_partition_device, validate_disk, verify_disk_id};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_existing_scheme_fails_when_partitions_missing() {
        let err = detect_existing_scheme(Path::new("/dev/nbc-test-nonexistent-disk")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_create_partitions_dry_run_is_empty_scheme() {
        let scheme =
            create_partitions(Path::new("/dev/nbc-test-disk"), 12 << 30, true).unwrap();
        assert!(matches!(scheme, PartitionScheme::Empty { .. }));
        assert_eq!(scheme.device(), Path::new("/dev/nbc-test-disk"));
    }
}
