use std::path::{Path, PathBuf};

use anyhow::{ensure, Error};
use nbc_api::constants::LOOPBACK_MIN_SIZE_BYTES;
use osutils::losetup;

/// A loopback image attached to a loop device, with partition scanning enabled so the kernel
/// exposes `/dev/loopNpM` nodes for each partition `sgdisk` later creates.
pub struct LoopbackDevice {
    pub image_path: PathBuf,
    pub device: PathBuf,
    pub size_gb: u64,
}

impl LoopbackDevice {
    /// Creates a sparse file of `size_bytes` (clamped up to the 35 GiB minimum) at `image_path`
    /// and attaches it to the next free loop device.
    pub fn create(image_path: impl AsRef<Path>, size_bytes: u64) -> Result<Self, Error> {
        let size_bytes = size_bytes.max(LOOPBACK_MIN_SIZE_BYTES);
        let image_path = image_path.as_ref().to_path_buf();
        let device = losetup::create_and_attach(&image_path, size_bytes)?;
        Ok(Self {
            image_path,
            device,
            size_gb: size_bytes / (1024 * 1024 * 1024),
        })
    }

    /// Attaches an already-existing sparse image (an update re-targeting a prior install).
    pub fn attach_existing(image_path: impl AsRef<Path>) -> Result<Self, Error> {
        let image_path = image_path.as_ref().to_path_buf();
        let size_bytes = std::fs::metadata(&image_path)?.len();
        ensure!(
            size_bytes >= LOOPBACK_MIN_SIZE_BYTES,
            "Loopback image '{}' is smaller than the minimum supported size",
            image_path.display()
        );
        let device = losetup::attach(&image_path)?;
        Ok(Self {
            image_path,
            device,
            size_gb: size_bytes / (1024 * 1024 * 1024),
        })
    }

    /// Detaches the loop device. Deletion of the underlying image file is the orchestrator's
    /// decision, not this type's.
    pub fn cleanup(&self) -> Result<(), Error> {
        losetup::detach(&self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_existing_rejects_undersized_image() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("small.raw");
        std::fs::File::create(&image_path)
            .unwrap()
            .set_len(1024 * 1024)
            .unwrap();
        let err = LoopbackDevice::attach_existing(&image_path).unwrap_err();
        assert!(err.to_string().contains("smaller than the minimum"));
    }

    #[test]
    fn test_create_clamps_to_minimum_size() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("img.raw");
        // Requested size below the minimum; we only check the clamp math here since actually
        // attaching requires a real loop device.
        let size_bytes = 1024u64.max(LOOPBACK_MIN_SIZE_BYTES);
        assert_eq!(size_bytes, LOOPBACK_MIN_SIZE_BYTES);
        let _ = image_path;
    }
}
