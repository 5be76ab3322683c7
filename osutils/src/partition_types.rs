use uuid::Uuid;

/// GPT partition type GUIDs nbc actually writes with `sgdisk -t`. Limited to what the
/// Partitioner needs: the EFI System Partition and a single generic Linux filesystem type
/// shared by both root slots and `/var` (no RAID/verity/arch-specific discoverable-partition
/// variants, since nbc never hands the kernel a partition table it expects to auto-discover).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionGuidType {
    Esp,
    LinuxGeneric,
}

impl PartitionGuidType {
    pub fn to_uuid(self) -> Uuid {
        Uuid::from_u128(match self {
            PartitionGuidType::Esp => 0xc12a7328_f81f_11d2_ba4b_00a0c93ec93bu128,
            PartitionGuidType::LinuxGeneric => 0x0fc63daf_8483_4772_8e79_3d69d8477de4u128,
        })
    }

    /// GUID string formatted the way `sgdisk --typecode` accepts it.
    pub fn sgdisk_code(self) -> String {
        self.to_uuid().hyphenated().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_esp_guid_matches_uefi_spec() {
        assert_eq!(
            PartitionGuidType::Esp.to_uuid().to_string(),
            "c12a7328-f81f-11d2-ba4b-00a0c93ec93b"
        );
    }
}
