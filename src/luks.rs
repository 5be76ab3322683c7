use std::path::Path;

use anyhow::{Context, Error};
use nbc_api::config::{LuksDevice, PartitionScheme};
use nbc_api::constants::{MAPPER_ROOT1, MAPPER_ROOT2, MAPPER_VAR};
use osutils::encryption;

/// Formats `root1`, `root2`, and `var` as LUKS2 with `passphrase` and opens all three under
/// deterministic mapper names. The ESP is never encrypted. Only valid on a `Partitioned` scheme;
/// returns a `Formatted`-adjacent `Encrypted` scheme whose mapper paths callers must target
/// instead of the raw partitions from here on.
pub fn setup_luks(scheme: PartitionScheme, passphrase: &str) -> Result<PartitionScheme, Error> {
    let PartitionScheme::Partitioned {
        device,
        esp,
        root1,
        root2,
        var,
    } = scheme
    else {
        anyhow::bail!("setup_luks requires a Partitioned scheme");
    };

    let root1 = open_one(&root1, MAPPER_ROOT1, passphrase)
        .context("Failed to set up LUKS2 on root1 partition")?;
    let root2 = open_one(&root2, MAPPER_ROOT2, passphrase)
        .context("Failed to set up LUKS2 on root2 partition")?;
    let var =
        open_one(&var, MAPPER_VAR, passphrase).context("Failed to set up LUKS2 on var partition")?;

    Ok(PartitionScheme::Encrypted {
        device,
        esp,
        root1,
        root2,
        var,
    })
}

fn open_one(partition: &Path, mapper_name: &str, passphrase: &str) -> Result<LuksDevice, Error> {
    encryption::luks_format(partition, passphrase)?;
    encryption::luks_open(partition, mapper_name, passphrase)?;
    Ok(LuksDevice {
        backing_partition: partition.to_path_buf(),
        mapper_name: mapper_name.to_string(),
        tpm2_enrolled: false,
    })
}

/// Closes every mapper device named in `scheme`, if open. Idempotent: safe to call on a scheme
/// that was never encrypted, or one whose devices are already closed. Must run on every exit
/// path from any operation that opened devices.
pub fn close_luks_devices(scheme: &PartitionScheme) {
    let devices: &[&LuksDevice] = match scheme {
        PartitionScheme::Encrypted { root1, root2, var, .. }
        | PartitionScheme::Formatted { root1, root2, var, .. }
        | PartitionScheme::Mounted { root1, root2, var, .. } => &[root1, root2, var],
        _ => return,
    };

    for device in devices {
        if let Err(e) = encryption::luks_close(&device.mapper_name) {
            log::warn!("Failed to close LUKS mapper '{}': {e:#}", device.mapper_name);
        }
    }
}

/// Emits one `/etc/crypttab` line per device, of the form
/// `<mapper> UUID=<luks_uuid> none luks[,tpm2-device=auto]`. Pure; writing the result to disk is
/// the orchestrator's responsibility.
pub fn generate_crypttab(
    devices: &[(&LuksDevice, uuid::Uuid)],
    tpm2_enabled: bool,
) -> String {
    let mut out = String::new();
    for (device, luks_uuid) in devices {
        let options = if tpm2_enabled {
            "luks,tpm2-device=auto"
        } else {
            "luks"
        };
        out.push_str(&format!(
            "{} UUID={} none {}\n",
            device.mapper_name, luks_uuid, options
        ));
    }
    out
}

/// Enrolls every LUKS device in `scheme` for TPM2 auto-unlock. Called after the bootloader is
/// installed, since enrollment is meaningless if the box can never reach a unified kernel to
/// measure PCR 7 against.
pub fn enroll_tpm2(scheme: &mut PartitionScheme, passphrase: &str) -> Result<(), Error> {
    let devices: Vec<&mut LuksDevice> = match scheme {
        PartitionScheme::Encrypted { root1, root2, var, .. }
        | PartitionScheme::Formatted { root1, root2, var, .. }
        | PartitionScheme::Mounted { root1, root2, var, .. } => vec![root1, root2, var],
        _ => anyhow::bail!("enroll_tpm2 requires an encrypted scheme"),
    };

    for device in devices {
        encryption::enroll_tpm2(&device.backing_partition, passphrase).with_context(|| {
            format!(
                "Failed to enroll TPM2 for mapper '{}'",
                device.mapper_name
            )
        })?;
        device.tpm2_enrolled = true;
    }
    Ok(())
}

/// Attempts TPM2-only unlock of `device`, falling back to the caller's passphrase prompt on any
/// failure (no TPM present, slot not enrolled, PCR measurements changed).
pub fn try_tpm2_unlock(device: &LuksDevice) -> Result<(), Error> {
    encryption::try_tpm2_unlock(&device.backing_partition, &device.mapper_name)
}

/// Inspects `target_root` for initramfs support for unlocking LUKS at boot. Missing support is
/// returned as warnings, not a fatal error, so an at-risk installation can still proceed.
pub fn validate_initramfs_support(target_root: impl AsRef<Path>, tpm2_required: bool) -> Vec<String> {
    let target_root = target_root.as_ref();
    let mut warnings = Vec::new();

    let dracut_crypt = target_root.join("usr/lib/dracut/modules.d/90crypt");
    let initramfs_tools_hook = target_root.join("usr/share/initramfs-tools/hooks/cryptroot");
    if !dracut_crypt.exists() && !initramfs_tools_hook.exists() {
        warnings.push(
            "Target root has neither a dracut crypt module nor an initramfs-tools cryptroot \
             hook; the installed system may not be able to unlock its root filesystem at boot."
                .to_string(),
        );
    }

    if tpm2_required {
        let tpm2_module = target_root.join("usr/lib/dracut/modules.d/91tpm2-tss");
        if !tpm2_module.exists() {
            warnings.push(
                "Target root is missing the tpm2-tss dracut module; TPM2 auto-unlock was \
                 requested but will not function at boot."
                    .to_string(),
            );
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn luks_device(mapper_name: &str) -> LuksDevice {
        LuksDevice {
            backing_partition: Path::new("/dev/sda2").to_path_buf(),
            mapper_name: mapper_name.to_string(),
            tpm2_enrolled: false,
        }
    }

    #[test]
    fn test_generate_crypttab_without_tpm2() {
        let root1 = luks_device("root1");
        let uuid = Uuid::nil();
        let crypttab = generate_crypttab(&[(&root1, uuid)], false);
        assert_eq!(crypttab, format!("root1 UUID={uuid} none luks\n"));
    }

    #[test]
    fn test_generate_crypttab_with_tpm2() {
        let var = luks_device("var");
        let uuid = Uuid::nil();
        let crypttab = generate_crypttab(&[(&var, uuid)], true);
        assert_eq!(crypttab, format!("var UUID={uuid} none luks,tpm2-device=auto\n"));
    }

    #[test]
    fn test_validate_initramfs_support_warns_on_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let warnings = validate_initramfs_support(dir.path(), true);
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_validate_initramfs_support_clean_when_modules_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("usr/lib/dracut/modules.d/90crypt")).unwrap();
        std::fs::create_dir_all(dir.path().join("usr/lib/dracut/modules.d/91tpm2-tss")).unwrap();
        let warnings = validate_initramfs_support(dir.path(), true);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_close_luks_devices_noop_on_unpartitioned_scheme() {
        let scheme = PartitionScheme::Empty {
            device: Path::new("/dev/sda").to_path_buf(),
        };
        close_luks_devices(&scheme);
    }
}
