use std::fmt::Display;

/// A plain byte count. Unlike [`FormatSize`], this type carries no formatting opinion of its
/// own and (de)serializes as a bare integer, which is what every on-disk and wire representation
/// in nbc actually needs (`sgdisk` sizes, partition bounds, image lengths).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ByteCount(pub u64);

impl From<u64> for ByteCount {
    fn from(x: u64) -> Self {
        ByteCount(x)
    }
}

impl ByteCount {
    pub fn bytes(self) -> u64 {
        self.0
    }
}

/// Formats a byte count the way nbc reports disk and image sizes to a human: one decimal place,
/// a space before the unit, and the smallest unit that keeps the mantissa under 1024 (binary
/// steps, same as `lsblk -b --output SIZE` post-processing, just relabeled with the familiar
/// KB/MB/GB/TB suffixes instead of KiB/MiB/GiB/TiB).
pub struct FormatSize(pub u64);

impl Display for FormatSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
        let bytes = self.0;
        if bytes < 1024 {
            return write!(f, "{bytes} B");
        }

        let mut value = bytes as f64;
        let mut unit_index = 0;
        while value >= 1024.0 && unit_index < UNITS.len() - 1 {
            value /= 1024.0;
            unit_index += 1;
        }
        write!(f, "{:.1} {}", value, UNITS[unit_index])
    }
}

impl From<ByteCount> for FormatSize {
    fn from(value: ByteCount) -> Self {
        FormatSize(value.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size_bytes_stay_unscaled() {
        assert_eq!(FormatSize(0).to_string(), "0 B");
        assert_eq!(FormatSize(1).to_string(), "1 B");
        assert_eq!(FormatSize(999).to_string(), "999 B");
        assert_eq!(FormatSize(1023).to_string(), "1023 B");
    }

    #[test]
    fn test_format_size_kilobytes() {
        assert_eq!(FormatSize(1024).to_string(), "1.0 KB");
        assert_eq!(FormatSize(1536).to_string(), "1.5 KB");
    }

    #[test]
    fn test_format_size_gigabytes() {
        assert_eq!(FormatSize(1536 * 1024 * 1024).to_string(), "1.5 GB");
        assert_eq!(FormatSize(12 * 1024 * 1024 * 1024).to_string(), "12.0 GB");
    }

    #[test]
    fn test_format_size_terabytes() {
        assert_eq!(
            FormatSize(1024u64 * 1024 * 1024 * 1024).to_string(),
            "1.0 TB"
        );
    }

    #[test]
    fn test_byte_count_json_roundtrip() {
        let count = ByteCount(123_456);
        let serialized = serde_json::to_string(&count).unwrap();
        assert_eq!(serialized, "123456");
        let deserialized: ByteCount = serde_json::from_str(&serialized).unwrap();
        assert_eq!(count, deserialized);
    }
}
