use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Error};
use nbc_api::config::{BootloaderType, FilesystemType};
use uuid::Uuid;

/// Candidate distro-signed shim paths under a target root, checked in order. The first one
/// present wins; none of these are required to exist.
const SHIM_CANDIDATES: &[&str] = &[
    "usr/lib/shim/shimx64.efi.signed",
    "usr/lib/shim/shimx64.efi",
    "usr/lib/shim-signed/shimx64.efi.signed",
    "boot/efi/EFI/fedora/shimx64.efi",
    "boot/efi/EFI/centos/shimx64.efi",
    "boot/efi/EFI/almalinux/shimx64.efi",
    "boot/efi/EFI/ubuntu/shimx64.efi.signed",
    "boot/efi/EFI/debian/shimx64.efi.signed",
];

const SIGNED_GRUB_CANDIDATES: &[&str] = &[
    "usr/lib/grub/x86_64-efi-signed/grubx64.efi.signed",
    "boot/efi/EFI/fedora/grubx64.efi",
    "boot/efi/EFI/centos/grubx64.efi",
    "boot/efi/EFI/ubuntu/grubx64.efi.signed",
    "boot/efi/EFI/debian/grubx64.efi.signed",
];

const SIGNED_SYSTEMD_BOOT_CANDIDATES: &[&str] = &[
    "usr/lib/systemd-boot-signed/systemd-bootx64.efi.signed",
    "usr/lib/systemd/boot/efi/systemd-bootx64.efi.signed",
];

const UNSIGNED_GRUB_CANDIDATES: &[&str] = &[
    "usr/lib/grub/x86_64-efi-monolithic/grubx64.efi",
    "usr/lib/grub/x86_64-efi/grubx64.efi",
];

const UNSIGNED_SYSTEMD_BOOT_CANDIDATES: &[&str] = &["usr/lib/systemd/boot/efi/systemd-bootx64.efi"];

const MOK_MANAGER_CANDIDATES: &[&str] = &[
    "usr/lib/shim/mmx64.efi.signed",
    "usr/lib/shim/mmx64.efi",
    "boot/efi/EFI/fedora/mmx64.efi",
];

/// A kernel + initramfs pair discovered under `/usr/lib/modules/<version>` in a target root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelVersion {
    pub version: String,
    pub vmlinuz: PathBuf,
    pub initramfs: PathBuf,
}

/// Picks the lexicographically greatest directory name under `KERNEL_MODULES_DIR`, which for
/// standard kernel version strings (`A.B.C-release`) is also the newest. Fails if no directory
/// contains a `vmlinuz` file.
pub fn select_kernel_version(target_root: impl AsRef<Path>) -> Result<KernelVersion, Error> {
    let modules_dir = target_root.as_ref().join(
        nbc_api::constants::KERNEL_MODULES_DIR
            .trim_start_matches('/'),
    );

    let mut versions: Vec<String> = fs::read_dir(&modules_dir)
        .with_context(|| format!("Failed to read '{}'", modules_dir.display()))?
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    versions.sort();

    let version = versions
        .pop()
        .context("No kernel found under /usr/lib/modules in the target root")?;

    let version_dir = modules_dir.join(&version);
    let vmlinuz = version_dir.join("vmlinuz");
    ensure!(
        vmlinuz.is_file(),
        "Kernel version directory '{}' has no vmlinuz",
        version_dir.display()
    );
    let initramfs = version_dir.join("initramfs.img");

    Ok(KernelVersion {
        version,
        vmlinuz,
        initramfs,
    })
}

/// Copies the selected kernel and initramfs into `esp_mount` as `vmlinuz-<ver>` and
/// `initramfs-<ver>.img`, regenerating the initramfs is out of scope here (the caller does that,
/// if at all, before calling this). Verifies both files landed on the ESP before returning.
pub fn install_kernel_and_initramfs(
    kernel: &KernelVersion,
    esp_mount: impl AsRef<Path>,
) -> Result<(), Error> {
    let esp_mount = esp_mount.as_ref();
    let vmlinuz_dest = esp_mount.join(format!("vmlinuz-{}", kernel.version));
    let initramfs_dest = esp_mount.join(format!("initramfs-{}.img", kernel.version));

    fs::copy(&kernel.vmlinuz, &vmlinuz_dest)
        .with_context(|| format!("Failed to copy kernel to '{}'", vmlinuz_dest.display()))?;

    if kernel.initramfs.is_file() {
        fs::copy(&kernel.initramfs, &initramfs_dest).with_context(|| {
            format!("Failed to copy initramfs to '{}'", initramfs_dest.display())
        })?;
    }

    ensure!(
        vmlinuz_dest.is_file(),
        "Kernel was not found on the ESP after copy at '{}'",
        vmlinuz_dest.display()
    );

    Ok(())
}

/// Presence of `/usr/bin/bootctl` in the target root selects systemd-boot; otherwise GRUB2.
pub fn detect_bootloader_type(target_root: impl AsRef<Path>) -> BootloaderType {
    if target_root.as_ref().join("usr/bin/bootctl").is_file() {
        BootloaderType::SystemdBoot
    } else {
        BootloaderType::Grub2
    }
}

/// FAT is case-insensitive but case-preserving: an `efi/` directory extracted from an image that
/// shipped lower-case paths stays lower-case forever unless renamed through an intermediate name.
/// Renames `efi` to `EFI` and, within it, `boot` to `BOOT`, each via a two-step rename so the
/// on-disk case actually changes.
pub fn normalize_esp_case(esp_mount: impl AsRef<Path>) -> Result<(), Error> {
    let esp_mount = esp_mount.as_ref();
    rename_case_insensitive(esp_mount, "efi", "EFI")?;
    let efi_dir = esp_mount.join("EFI");
    fs::create_dir_all(&efi_dir)
        .with_context(|| format!("Failed to create '{}'", efi_dir.display()))?;
    rename_case_insensitive(&efi_dir, "boot", "BOOT")?;
    fs::create_dir_all(efi_dir.join("BOOT")).context("Failed to create EFI/BOOT")?;
    Ok(())
}

fn rename_case_insensitive(parent: &Path, from: &str, to: &str) -> Result<(), Error> {
    let from_path = parent.join(from);
    let to_path = parent.join(to);
    if to_path.exists() || !from_path.exists() {
        return Ok(());
    }
    let tmp_path = parent.join(format!(".{to}.nbc-rename-tmp"));
    fs::rename(&from_path, &tmp_path)
        .with_context(|| format!("Failed to rename '{}'", from_path.display()))?;
    fs::rename(&tmp_path, &to_path)
        .with_context(|| format!("Failed to rename '{}' to '{}'", tmp_path.display(), to_path.display()))?;
    Ok(())
}

/// The LUKS-specific pieces of a kernel command line, present only on encrypted schemes.
#[derive(Debug, Clone)]
pub struct LuksCmdlineInputs {
    pub root_luks_uuid: Uuid,
    pub var_luks_uuid: Uuid,
    pub root_mapper_name: String,
    pub tpm2_enabled: bool,
}

/// Everything needed to assemble one menu entry's kernel command line.
#[derive(Debug, Clone)]
pub struct CmdlineInputs {
    pub boot_uuid: Uuid,
    pub root_spec: String,
    pub var_spec: String,
    pub var_filesystem: FilesystemType,
    pub luks: Option<LuksCmdlineInputs>,
    pub extra_args: Vec<String>,
}

/// Assembles the kernel command line in the exact order specified: boot mount, root, `ro`, var
/// mount, overlay activation, multipath disable, then LUKS unlock args when encrypted, then user
/// args verbatim. Both the default and "previous" menu entries are built by calling this twice
/// with different `root_spec`/`luks` values and otherwise-identical inputs.
pub fn build_kernel_cmdline(inputs: &CmdlineInputs) -> String {
    let mut args = vec![
        format!(
            "systemd.mount-extra=UUID={}:/boot:vfat:defaults",
            inputs.boot_uuid
        ),
        format!("root={}", inputs.root_spec),
        "ro".to_string(),
        format!(
            "systemd.mount-extra={}:/var:{}:defaults",
            inputs.var_spec,
            inputs.var_filesystem.as_mkfs_type()
        ),
        "rd.etc.overlay=1".to_string(),
        format!("rd.etc.overlay.var={}", inputs.var_spec),
        format!(
            "nvme_core.multipath={}",
            nbc_api::constants::NVME_MULTIPATH_DISABLED
        ),
    ];

    if let Some(luks) = &inputs.luks {
        args.push(format!("rd.luks.uuid={}", luks.root_luks_uuid));
        args.push(format!(
            "rd.luks.name={}={}",
            luks.root_luks_uuid, luks.root_mapper_name
        ));
        args.push(format!("rd.luks.uuid={}", luks.var_luks_uuid));
        args.push(format!(
            "rd.luks.name={}=var",
            luks.var_luks_uuid
        ));
        if luks.tpm2_enabled {
            args.push(format!(
                "rd.luks.options={}=tpm2-device=auto",
                luks.root_luks_uuid
            ));
            args.push(format!(
                "rd.luks.options={}=tpm2-device=auto",
                luks.var_luks_uuid
            ));
        }
    }

    args.extend(inputs.extra_args.iter().cloned());
    args.join(" ")
}

/// One bootable menu entry: which kernel version to boot and the command line to boot it with.
#[derive(Debug, Clone)]
pub struct BootMenuEntry {
    pub label: &'static str,
    pub kernel_version: String,
    pub cmdline: String,
}

/// Renders a two-entry GRUB2 `grub.cfg`: the default entry first, then the rollback "Previous"
/// entry. Both search by the ESP's filesystem UUID embedded in each entry's command line rather
/// than relying on GRUB's own disk enumeration.
pub fn render_grub_config(boot_uuid: Uuid, default: &BootMenuEntry, previous: &BootMenuEntry) -> String {
    let mut out = String::new();
    out.push_str("set timeout=3\nset default=0\n\n");
    for entry in [default, previous] {
        out.push_str(&format!(
            "menuentry \"{label}\" {{\n\
             \tsearch --no-floppy --fs-uuid --set=root {uuid}\n\
             \tlinux /vmlinuz-{ver} {cmdline}\n\
             \tinitrd /initramfs-{ver}.img\n\
             }}\n\n",
            label = entry.label,
            uuid = boot_uuid,
            ver = entry.kernel_version,
            cmdline = entry.cmdline,
        ));
    }
    out
}

/// Renders `loader/loader.conf` plus the two `loader/entries/*.conf` files for systemd-boot.
/// Returns `(loader_conf, default_entry, previous_entry)`.
pub fn render_systemd_boot_config(
    default: &BootMenuEntry,
    previous: &BootMenuEntry,
) -> (String, String, String) {
    let loader_conf = "default bootc.conf\ntimeout 3\nconsole-mode max\n".to_string();
    let entry = |e: &BootMenuEntry| {
        format!(
            "title {label}\nlinux /vmlinuz-{ver}\ninitrd /initramfs-{ver}.img\noptions {cmdline}\n",
            label = e.label,
            ver = e.kernel_version,
            cmdline = e.cmdline,
        )
    };
    (loader_conf, entry(default), entry(previous))
}

/// Writes the two-entry bootloader configuration to the ESP, in the format matching `bootloader`.
pub fn write_bootloader_config(
    bootloader: BootloaderType,
    esp_mount: impl AsRef<Path>,
    boot_uuid: Uuid,
    default: &BootMenuEntry,
    previous: &BootMenuEntry,
) -> Result<(), Error> {
    let esp_mount = esp_mount.as_ref();
    match bootloader {
        BootloaderType::Grub2 => {
            let grub_dir = esp_mount.join("grub2");
            fs::create_dir_all(&grub_dir)
                .with_context(|| format!("Failed to create '{}'", grub_dir.display()))?;
            let config = render_grub_config(boot_uuid, default, previous);
            fs::write(grub_dir.join("grub.cfg"), config).context("Failed to write grub.cfg")?;
        }
        BootloaderType::SystemdBoot => {
            let entries_dir = esp_mount.join("loader/entries");
            fs::create_dir_all(&entries_dir)
                .with_context(|| format!("Failed to create '{}'", entries_dir.display()))?;
            let (loader_conf, default_entry, previous_entry) =
                render_systemd_boot_config(default, previous);
            fs::write(esp_mount.join("loader/loader.conf"), loader_conf)
                .context("Failed to write loader.conf")?;
            fs::write(entries_dir.join("bootc.conf"), default_entry)
                .context("Failed to write the default boot entry")?;
            fs::write(entries_dir.join("bootc-previous.conf"), previous_entry)
                .context("Failed to write the rollback boot entry")?;
        }
    }
    Ok(())
}

fn first_existing(target_root: &Path, candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|rel| target_root.join(rel))
        .find(|p| p.is_file())
}

/// Installs the Secure Boot shim chain if a distro-signed shim is present in the target root:
/// shim at `BOOTX64.EFI` (so firmware boots it unconditionally), the signed bootloader at
/// `grubx64.efi` (the exact filename shim is compiled to chain-load next), and the MOK manager,
/// if found, at `mmx64.efi`. `systemd-boot` never gets an `fbx64.efi` fallback: that file format
/// expects a distro-specific `BOOTX64.CSV` this installer does not produce. Falls back to
/// installing the plain (unsigned) bootloader directly as `BOOTX64.EFI` when no shim is found.
pub fn install_secure_boot_chain(
    target_root: impl AsRef<Path>,
    esp_mount: impl AsRef<Path>,
    bootloader: BootloaderType,
) -> Result<(), Error> {
    let target_root = target_root.as_ref();
    let boot_dir = esp_mount.as_ref().join("EFI/BOOT");
    fs::create_dir_all(&boot_dir)
        .with_context(|| format!("Failed to create '{}'", boot_dir.display()))?;

    let (signed_candidates, unsigned_candidates): (&[&str], &[&str]) = match bootloader {
        BootloaderType::Grub2 => (SIGNED_GRUB_CANDIDATES, UNSIGNED_GRUB_CANDIDATES),
        BootloaderType::SystemdBoot => (SIGNED_SYSTEMD_BOOT_CANDIDATES, UNSIGNED_SYSTEMD_BOOT_CANDIDATES),
    };

    match first_existing(target_root, SHIM_CANDIDATES) {
        Some(shim) => {
            let signed_bootloader = first_existing(target_root, signed_candidates).with_context(|| {
                "A Secure Boot shim was found but no matching signed bootloader binary was"
            })?;
            fs::copy(&shim, boot_dir.join("BOOTX64.EFI"))
                .context("Failed to install shim as BOOTX64.EFI")?;
            fs::copy(&signed_bootloader, boot_dir.join("grubx64.efi"))
                .context("Failed to install signed bootloader as grubx64.efi")?;
            if let Some(mok_manager) = first_existing(target_root, MOK_MANAGER_CANDIDATES) {
                fs::copy(&mok_manager, boot_dir.join("mmx64.efi"))
                    .context("Failed to install MOK manager as mmx64.efi")?;
            }
        }
        None => {
            let bootloader_binary =
                first_existing(target_root, unsigned_candidates).with_context(|| {
                    format!("No {bootloader:?} EFI binary found in the target root")
                })?;
            fs::copy(&bootloader_binary, boot_dir.join("BOOTX64.EFI"))
                .context("Failed to install bootloader as BOOTX64.EFI")?;
        }
    }

    Ok(())
}

/// Registers a UEFI firmware boot entry pointing at `\EFI\BOOT\BOOTX64.EFI`, if `efibootmgr` and
/// `efivars` are both available. Failure is logged as a warning, never fatal: the removable-media
/// fallback path the firmware tries on its own remains valid either way.
pub fn register_uefi_boot_entry(
    label: &str,
    disk: impl AsRef<Path>,
    esp_mount: impl AsRef<Path>,
) -> Result<(), Error> {
    if !osutils::efibootmgr::is_efi_available() {
        log::warn!("UEFI variables are not available; skipping firmware boot entry registration");
        return Ok(());
    }

    match osutils::efibootmgr::create_boot_entry(label, disk.as_ref(), esp_mount.as_ref(), "EFI/BOOT/BOOTX64.EFI") {
        Ok(()) => Ok(()),
        Err(e) => {
            log::warn!("Failed to register UEFI boot entry: {e:#}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inputs(encrypted: bool) -> CmdlineInputs {
        CmdlineInputs {
            boot_uuid: Uuid::nil(),
            root_spec: if encrypted {
                "/dev/mapper/root1".to_string()
            } else {
                format!("UUID={}", Uuid::nil())
            },
            var_spec: if encrypted {
                "/dev/mapper/var".to_string()
            } else {
                format!("UUID={}", Uuid::nil())
            },
            var_filesystem: FilesystemType::Ext4,
            luks: encrypted.then(|| LuksCmdlineInputs {
                root_luks_uuid: Uuid::nil(),
                var_luks_uuid: Uuid::nil(),
                root_mapper_name: "root1".to_string(),
                tpm2_enabled: true,
            }),
            extra_args: vec!["console=ttyS0".to_string()],
        }
    }

    #[test]
    fn test_build_kernel_cmdline_contains_required_tokens() {
        let cmdline = build_kernel_cmdline(&sample_inputs(false));
        assert!(cmdline.contains("rd.etc.overlay=1"));
        assert!(cmdline.contains(" ro "));
        assert_eq!(cmdline.matches("root=").count(), 1);
        assert!(cmdline.ends_with("console=ttyS0"));
    }

    #[test]
    fn test_build_kernel_cmdline_encrypted_adds_luks_args() {
        let cmdline = build_kernel_cmdline(&sample_inputs(true));
        assert!(cmdline.contains("root=/dev/mapper/root1"));
        assert!(cmdline.contains("rd.luks.uuid="));
        assert!(cmdline.contains("rd.luks.name=") );
        assert!(cmdline.contains("rd.luks.options="));
    }

    #[test]
    fn test_detect_bootloader_type_defaults_to_grub2() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_bootloader_type(dir.path()), BootloaderType::Grub2);
    }

    #[test]
    fn test_detect_bootloader_type_picks_systemd_boot_when_bootctl_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("usr/bin")).unwrap();
        std::fs::write(dir.path().join("usr/bin/bootctl"), b"").unwrap();
        assert_eq!(detect_bootloader_type(dir.path()), BootloaderType::SystemdBoot);
    }

    #[test]
    fn test_normalize_esp_case_renames_lowercase_efi() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("efi/boot")).unwrap();
        std::fs::write(dir.path().join("efi/boot/bootx64.efi"), b"x").unwrap();
        normalize_esp_case(dir.path()).unwrap();
        assert!(dir.path().join("EFI/BOOT/bootx64.efi").exists());
        assert!(!dir.path().join("efi").exists());
    }

    #[test]
    fn test_select_kernel_version_picks_lexicographically_greatest() {
        let dir = tempfile::tempdir().unwrap();
        for ver in ["5.10.0-1", "6.1.0-2", "6.1.0-10"] {
            let version_dir = dir.path().join("usr/lib/modules").join(ver);
            std::fs::create_dir_all(&version_dir).unwrap();
            std::fs::write(version_dir.join("vmlinuz"), b"kernel").unwrap();
        }
        let selected = select_kernel_version(dir.path()).unwrap();
        assert_eq!(selected.version, "6.1.0-2");
    }

    #[test]
    fn test_render_grub_config_has_two_menuentries() {
        let default = BootMenuEntry {
            label: "nbc",
            kernel_version: "6.1.0-2".to_string(),
            cmdline: "ro".to_string(),
        };
        let previous = BootMenuEntry {
            label: "nbc (previous)",
            kernel_version: "6.1.0-1".to_string(),
            cmdline: "ro".to_string(),
        };
        let config = render_grub_config(Uuid::nil(), &default, &previous);
        assert_eq!(config.matches("menuentry").count(), 2);
    }
}
