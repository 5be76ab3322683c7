use std::process::Command;

/// Every external tool nbc shells out to. Centralizing the list means a missing binary is
/// reported with the same tool name a human would type at a shell, and lets the Installer
/// Orchestrator's precondition check walk the whole list up front instead of failing midway
/// through a partitioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dependency {
    Sgdisk,
    Cryptsetup,
    SystemdCryptenroll,
    Mkfs,
    Mount,
    Umount,
    Losetup,
    Blkid,
    Wipefs,
    Udevadm,
    Bootctl,
    EfiBootMgr,
    Mkdir,
    Touch,
    Chown,
    Chmod,
}

impl Dependency {
    pub fn name(self) -> &'static str {
        match self {
            Dependency::Sgdisk => "sgdisk",
            Dependency::Cryptsetup => "cryptsetup",
            Dependency::SystemdCryptenroll => "systemd-cryptenroll",
            Dependency::Mkfs => "mkfs",
            Dependency::Mount => "mount",
            Dependency::Umount => "umount",
            Dependency::Losetup => "losetup",
            Dependency::Blkid => "blkid",
            Dependency::Wipefs => "wipefs",
            Dependency::Udevadm => "udevadm",
            Dependency::Bootctl => "bootctl",
            Dependency::EfiBootMgr => "efibootmgr",
            Dependency::Mkdir => "mkdir",
            Dependency::Touch => "touch",
            Dependency::Chown => "chown",
            Dependency::Chmod => "chmod",
        }
    }

    pub fn cmd(self) -> Command {
        Command::new(self.name())
    }

    /// Whether this tool is present on `PATH`. Used by the Installer/Updater Orchestrators'
    /// precondition step so a missing tool is reported before any disk mutation is attempted.
    pub fn is_present(self) -> bool {
        which::which(self.name()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_uses_tool_name_as_program() {
        let cmd = Dependency::Sgdisk.cmd();
        assert_eq!(cmd.get_program().to_str().unwrap(), "sgdisk");
    }
}
