use nbc_api::config::FilesystemType;

/// File system types for `mount`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountFileSystemType {
    Ext4,
    Btrfs,
    Vfat,
    Overlay,
    Auto,
}

/// File system types for `mkfs`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MkfsFileSystemType {
    Ext4,
    Btrfs,
    Vfat,
}

/// File system types for the fstab file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabFileSystemType {
    Auto,
    Ext4,
    Btrfs,
    Vfat,
    Overlay,
}

impl MountFileSystemType {
    pub fn name(self) -> &'static str {
        match self {
            MountFileSystemType::Ext4 => "ext4",
            MountFileSystemType::Btrfs => "btrfs",
            MountFileSystemType::Vfat => "vfat",
            MountFileSystemType::Overlay => "overlay",
            MountFileSystemType::Auto => "auto",
        }
    }

    pub fn from_api_type(api_type: FilesystemType) -> Self {
        match api_type {
            FilesystemType::Ext4 => MountFileSystemType::Ext4,
            FilesystemType::Btrfs => MountFileSystemType::Btrfs,
            FilesystemType::Vfat => MountFileSystemType::Vfat,
        }
    }
}

impl std::fmt::Display for MountFileSystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Provides a conversion from `MountFileSystemType` to `sys_mount::FilesystemType`
impl From<MountFileSystemType> for sys_mount::FilesystemType<'static> {
    fn from(s: MountFileSystemType) -> Self {
        sys_mount::FilesystemType::Manual(s.name())
    }
}

impl MkfsFileSystemType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ext4 => "ext4",
            Self::Btrfs => "btrfs",
            Self::Vfat => "vfat",
        }
    }

    pub fn from_api_type(api_type: FilesystemType) -> Self {
        match api_type {
            FilesystemType::Ext4 => Self::Ext4,
            FilesystemType::Btrfs => Self::Btrfs,
            FilesystemType::Vfat => Self::Vfat,
        }
    }

    pub fn mkfs_command_name(self) -> &'static str {
        match self {
            Self::Ext4 => "mkfs.ext4",
            Self::Btrfs => "mkfs.btrfs",
            Self::Vfat => "mkfs.vfat",
        }
    }
}

impl std::fmt::Display for MkfsFileSystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl TabFileSystemType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Ext4 => "ext4",
            Self::Btrfs => "btrfs",
            Self::Vfat => "vfat",
            Self::Overlay => "overlay",
        }
    }

    pub fn from_api_type(api_type: FilesystemType) -> Self {
        match api_type {
            FilesystemType::Ext4 => Self::Ext4,
            FilesystemType::Btrfs => Self::Btrfs,
            FilesystemType::Vfat => Self::Vfat,
        }
    }
}

impl std::fmt::Display for TabFileSystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
