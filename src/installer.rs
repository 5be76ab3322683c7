use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{ensure, Context, Error};
use nbc_api::config::{
    CachedImageMetadata, Config, EncryptionRecord, LuksDevice, PartitionScheme, SystemConfig,
};
use nbc_api::constants::{LOCK_FILE_PATH, ROOT_PARTITION_SIZE_BYTES, STATE_FILE_PATH};
use nbc_api::error::{InternalError, NbcError, PreconditionError, ReportError};
use nbc_api::primitives::hash::Sha256Hash;
use osutils::dependencies::Dependency;
use osutils::lock::ExclusiveLock;
use uuid::Uuid;

use crate::cancellation::CancellationToken;
use crate::progress::ProgressReporter;
use crate::{bootloader, etc_persistence, filesystem, lint, loopback, luks, oci, partition};

const TOTAL_STEPS: u32 = 6;

fn required_dependencies(config: &Config) -> Vec<Dependency> {
    let mut deps = vec![
        Dependency::Sgdisk,
        Dependency::Wipefs,
        Dependency::Mkfs,
        Dependency::Mount,
        Dependency::Umount,
        Dependency::Udevadm,
        Dependency::Blkid,
        Dependency::Mkdir,
        Dependency::Chown,
        Dependency::Chmod,
    ];
    if config.loopback_image_path.is_some() {
        deps.push(Dependency::Losetup);
    }
    if config.encrypt {
        deps.push(Dependency::Cryptsetup);
        if config.tpm2_auto_unlock {
            deps.push(Dependency::SystemdCryptenroll);
        }
    }
    deps
}

/// Fails fast if a required tool is missing from `PATH`. Skipped for tools a `dry_run` will never
/// invoke is not an option: a dry run should still tell the operator what is missing.
fn check_dependencies(config: &Config) -> Result<(), NbcError> {
    for dependency in required_dependencies(config) {
        if !dependency.is_present() {
            return Err(NbcError::new(PreconditionError::MissingTool {
                tool: dependency.name(),
            }));
        }
    }
    Ok(())
}

fn relative(path: &str) -> &Path {
    Path::new(path.trim_start_matches('/'))
}

/// Runs the full install pipeline described by `config` against a fresh target: partition,
/// optionally encrypt, format, mount, extract the container image, configure the system, and
/// install the bootloader. Any failure after partitions exist unwinds mounts and closes any LUKS
/// mappers it opened; the target device is left partitioned but not booted from.
pub fn run_install(
    config: &Config,
    reporter: &dyn ProgressReporter,
    token: &CancellationToken,
) -> Result<(), NbcError> {
    check_dependencies(config)?;

    let _lock = ExclusiveLock::try_acquire(LOCK_FILE_PATH)
        .structured(InternalError::Internal("failed to acquire the install lock file"))?
        .ok_or_else(|| NbcError::new(PreconditionError::AlreadyLocked))?;

    run_install_locked(config, reporter, token)
        .structured(InternalError::Internal("install failed"))
}

fn run_install_locked(
    config: &Config,
    reporter: &dyn ProgressReporter,
    token: &CancellationToken,
) -> Result<(), Error> {
    let mount_root = tempfile::Builder::new()
        .prefix("nbc-install-")
        .tempdir()
        .context("Failed to create a staging mount root")?;

    let mut loopback: Option<loopback::LoopbackDevice> = None;
    let device: PathBuf = match (&config.target_device, &config.loopback_image_path) {
        (Some(device), None) => device.clone(),
        (None, Some(image_path)) => {
            let size = config
                .loopback_image_size_bytes
                .unwrap_or(nbc_api::constants::LOOPBACK_MIN_SIZE_BYTES);
            let attached = loopback::LoopbackDevice::create(image_path, size)
                .context("Failed to create and attach the loopback image")?;
            let device = attached.device.clone();
            loopback = Some(attached);
            device
        }
        _ => anyhow::bail!("exactly one of target_device or loopback_image_path must be set"),
    };

    let cleanup_loopback = |loopback: &Option<loopback::LoopbackDevice>| {
        if let Some(loopback) = loopback {
            if let Err(e) = loopback.cleanup() {
                log::warn!("Failed to detach loopback device: {e:#}");
            }
        }
    };

    let result = install_onto_device(
        config,
        reporter,
        token,
        &device,
        mount_root.path(),
    );

    if let Err(e) = &result {
        log::warn!("Install failed, cleaning up: {e:#}");
    }
    cleanup_loopback(&loopback);
    result
}

fn install_onto_device(
    config: &Config,
    reporter: &dyn ProgressReporter,
    token: &CancellationToken,
    device: &Path,
    mount_root: &Path,
) -> Result<(), Error> {
    // Step 1: partition, optionally encrypt.
    reporter.step(1, TOTAL_STEPS, "Partitioning");
    token.check_before_step("Partition")?;

    if !config.dry_run {
        partition::wipe_disk(device)?;
    }
    let mut scheme = partition::create_partitions(device, ROOT_PARTITION_SIZE_BYTES, config.dry_run)?;

    if config.dry_run {
        reporter.message("dry-run: stopping after planning the partition layout");
        return Ok(());
    }

    if config.encrypt {
        reporter.message("Setting up LUKS2 encryption on root1, root2, and var");
        let passphrase = config
            .encryption_passphrase
            .as_deref()
            .context("encryption was requested but no passphrase is available")?;
        scheme = luks::setup_luks(scheme, passphrase)?;
    }

    // From this point on, any early return must close whatever LUKS mappers are open.
    let result = install_formatted(config, reporter, token, &mut scheme, mount_root);
    if result.is_err() {
        luks::close_luks_devices(&scheme);
    }
    result
}

fn install_formatted(
    config: &Config,
    reporter: &dyn ProgressReporter,
    token: &CancellationToken,
    scheme: &mut PartitionScheme,
    mount_root: &Path,
) -> Result<(), Error> {
    // Step 2: format.
    reporter.step(2, TOTAL_STEPS, "Formatting partitions");
    token.check_before_step("Format")?;
    *scheme = promote_to_formatted(scheme.clone())?;
    filesystem::format_partitions(scheme, config.root_filesystem)?;

    // Step 3: mount.
    reporter.step(3, TOTAL_STEPS, "Mounting partitions");
    token.check_before_step("Mount")?;
    filesystem::mount_partitions(scheme, mount_root, config.root_filesystem)?;
    *scheme = promote_to_mounted(scheme.clone(), mount_root.to_path_buf())?;

    let result = install_into_mounted_root(config, reporter, token, scheme, mount_root);
    if let Err(e) = filesystem::unmount_partitions(mount_root) {
        log::warn!("Failed to unwind partition mounts: {e:#}");
    }
    result
}

fn promote_to_formatted(scheme: PartitionScheme) -> Result<PartitionScheme, Error> {
    match scheme {
        PartitionScheme::Partitioned {
            device,
            esp,
            root1,
            root2,
            var,
        } => Ok(PartitionScheme::Formatted {
            device,
            esp,
            root1: LuksDevice {
                backing_partition: root1,
                mapper_name: String::new(),
                tpm2_enrolled: false,
            },
            root2: LuksDevice {
                backing_partition: root2,
                mapper_name: String::new(),
                tpm2_enrolled: false,
            },
            var: LuksDevice {
                backing_partition: var,
                mapper_name: String::new(),
                tpm2_enrolled: false,
            },
        }),
        PartitionScheme::Encrypted {
            device,
            esp,
            root1,
            root2,
            var,
        } => Ok(PartitionScheme::Formatted {
            device,
            esp,
            root1,
            root2,
            var,
        }),
        other => anyhow::bail!("cannot format a scheme in state {other:?}"),
    }
}

fn promote_to_mounted(scheme: PartitionScheme, mount_root: PathBuf) -> Result<PartitionScheme, Error> {
    match scheme {
        PartitionScheme::Formatted {
            device,
            esp,
            root1,
            root2,
            var,
        } => Ok(PartitionScheme::Mounted {
            device,
            esp,
            root1,
            root2,
            var,
            mount_root,
        }),
        other => anyhow::bail!("cannot mount a scheme in state {other:?}"),
    }
}

fn install_into_mounted_root(
    config: &Config,
    reporter: &dyn ProgressReporter,
    token: &CancellationToken,
    scheme: &mut PartitionScheme,
    mount_root: &Path,
) -> Result<(), Error> {
    let PartitionScheme::Mounted { device, esp, .. } = scheme.clone() else {
        anyhow::bail!("install_into_mounted_root requires a Mounted scheme");
    };

    // Step 4: extract and verify the image.
    reporter.step(4, TOTAL_STEPS, "Extracting container image");
    token.check_before_step("Extract")?;
    let extracted = oci::extract_image(
        config.image_reference.as_deref().unwrap_or(""),
        config.local_image_path.as_deref(),
        mount_root,
        token,
    )
    .context("Failed to extract the container image")?;

    let lint_report = lint::lint_extracted_root(mount_root, true)
        .context("Failed to run the extraction lint/verifier")?;
    for issue in &lint_report.issues {
        reporter.warning(&format!("{}: {}", issue.target_path.display(), issue.message));
    }

    if config.encrypt {
        for warning in luks::validate_initramfs_support(mount_root, config.tpm2_auto_unlock) {
            reporter.warning(&warning);
        }
    }

    // Step 5: configure the system.
    reporter.step(5, TOTAL_STEPS, "Configuring system");
    token.check_before_step("Configure")?;
    filesystem::create_fstab(mount_root, scheme.device())?;
    write_crypttab(mount_root, scheme, config.tpm2_auto_unlock)?;
    etc_persistence::provision_etc_persistence(mount_root)
        .context("Failed to provision /etc persistence")?;
    write_tmpfiles_rule(mount_root)?;
    if let Some(password) = &config.root_password {
        set_root_password(mount_root, password)?;
    }

    // Step 6: install the bootloader.
    reporter.step(6, TOTAL_STEPS, "Installing bootloader");
    token.check_before_step("Bootloader")?;

    let esp_mount = mount_root.join("boot");
    bootloader::normalize_esp_case(&esp_mount)?;
    let kernel = bootloader::select_kernel_version(mount_root)?;
    bootloader::install_kernel_and_initramfs(&kernel, &esp_mount)?;
    let bootloader_type = bootloader::detect_bootloader_type(mount_root);

    if config.encrypt && config.tpm2_auto_unlock {
        reporter.message("Enrolling LUKS devices for TPM2 auto-unlock");
        let passphrase = config
            .encryption_passphrase
            .as_deref()
            .context("encryption was requested but no passphrase is available")?;
        luks::enroll_tpm2(scheme, passphrase)?;
    }

    let PartitionScheme::Mounted { root1, var, .. } = scheme.clone() else {
        anyhow::bail!("scheme left Mounted state unexpectedly");
    };

    let boot_uuid = osutils::blkid::get_filesystem_uuid(&esp)?;
    let cmdline_inputs = cmdline_inputs_for(config, &root1, &var, boot_uuid)?;
    let cmdline = bootloader::build_kernel_cmdline(&cmdline_inputs);
    let menu_entry = bootloader::BootMenuEntry {
        label: "nbc",
        kernel_version: kernel.version.clone(),
        cmdline,
    };
    // A fresh install has no previous slot yet; the rollback entry mirrors the default one so
    // the bootloader config format stays the two-entry shape the updater will later populate.
    bootloader::write_bootloader_config(
        bootloader_type,
        &esp_mount,
        boot_uuid,
        &menu_entry,
        &menu_entry,
    )?;
    bootloader::install_secure_boot_chain(mount_root, &esp_mount, bootloader_type)?;
    bootloader::register_uefi_boot_entry("nbc", &device, &esp_mount)?;

    let disk_id = osutils::block_devices::get_disk_id(&device)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default();

    let encryption = encryption_record(scheme, config.tpm2_auto_unlock)?;

    let system_config = SystemConfig {
        device,
        disk_id,
        esp,
        root1: root1.backing_partition.clone(),
        root2: match scheme {
            PartitionScheme::Mounted { root2, .. } => root2.backing_partition.clone(),
            _ => unreachable!(),
        },
        var: var.backing_partition.clone(),
        root_filesystem: config.root_filesystem,
        encryption,
        bootloader: bootloader_type,
        active_slot: nbc_api::config::Slot::A,
        image: CachedImageMetadata {
            reference: config
                .image_reference
                .clone()
                .unwrap_or_else(|| "local".to_string()),
            digest: Sha256Hash::from(oci::digest_hex(&extracted.digest)),
        },
        install_date: chrono::Utc::now(),
        kernel_args: config.extra_kernel_args.clone(),
    };
    write_system_config(mount_root, &system_config)?;

    reporter.complete(true);
    Ok(())
}

fn cmdline_inputs_for(
    config: &Config,
    root1: &LuksDevice,
    var: &LuksDevice,
    boot_uuid: Uuid,
) -> Result<bootloader::CmdlineInputs, Error> {
    let (root_spec, var_spec, luks) = if config.encrypt {
        (
            root1.mapper_path().display().to_string(),
            var.mapper_path().display().to_string(),
            Some(bootloader::LuksCmdlineInputs {
                root_luks_uuid: osutils::encryption::luks_uuid(&root1.backing_partition)?,
                var_luks_uuid: osutils::encryption::luks_uuid(&var.backing_partition)?,
                root_mapper_name: root1.mapper_name.clone(),
                tpm2_enabled: config.tpm2_auto_unlock,
            }),
        )
    } else {
        (
            format!("UUID={}", osutils::blkid::get_filesystem_uuid(&root1.backing_partition)?),
            format!("UUID={}", osutils::blkid::get_filesystem_uuid(&var.backing_partition)?),
            None,
        )
    };

    Ok(bootloader::CmdlineInputs {
        boot_uuid,
        root_spec,
        var_spec,
        var_filesystem: config.root_filesystem,
        luks,
        extra_args: config.extra_kernel_args.clone(),
    })
}

pub(crate) fn encryption_record(
    scheme: &PartitionScheme,
    tpm2_enabled: bool,
) -> Result<Option<EncryptionRecord>, Error> {
    let (root1, root2, var) = match scheme {
        PartitionScheme::Mounted { root1, root2, var, .. } => (root1, root2, var),
        _ => return Ok(None),
    };
    if root1.mapper_name.is_empty() {
        return Ok(None);
    }
    Ok(Some(EncryptionRecord {
        root1_luks_uuid: osutils::encryption::luks_uuid(&root1.backing_partition)?,
        root2_luks_uuid: osutils::encryption::luks_uuid(&root2.backing_partition)?,
        var_luks_uuid: osutils::encryption::luks_uuid(&var.backing_partition)?,
        tpm2_enabled,
    }))
}

fn write_crypttab(mount_root: &Path, scheme: &PartitionScheme, tpm2_enabled: bool) -> Result<(), Error> {
    let (root1, root2, var) = match scheme {
        PartitionScheme::Mounted { root1, root2, var, .. } => (root1, root2, var),
        _ => return Ok(()),
    };
    if root1.mapper_name.is_empty() {
        return Ok(());
    }

    let devices = [
        (root1, osutils::encryption::luks_uuid(&root1.backing_partition)?),
        (root2, osutils::encryption::luks_uuid(&root2.backing_partition)?),
        (var, osutils::encryption::luks_uuid(&var.backing_partition)?),
    ];
    let contents = luks::generate_crypttab(
        &devices.iter().map(|(d, u)| (*d, *u)).collect::<Vec<_>>(),
        tpm2_enabled,
    );

    let path = mount_root.join("etc/crypttab");
    std::fs::write(&path, contents).context("Failed to write /etc/crypttab")?;
    let mut permissions = std::fs::metadata(&path)?.permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut permissions, 0o600);
    std::fs::set_permissions(&path, permissions).context("Failed to chmod /etc/crypttab")?;
    Ok(())
}

/// Drops a tmpfiles.d rule ensuring `/run/nbc` exists early enough in boot for the initrd to
/// write [`nbc_api::constants::BOOTED_SLOT_MARKER_PATH`] and the updater to later write
/// [`nbc_api::constants::REBOOT_REQUIRED_PATH`] under it.
fn write_tmpfiles_rule(mount_root: &Path) -> Result<(), Error> {
    let dir = mount_root.join("usr/lib/tmpfiles.d");
    std::fs::create_dir_all(&dir).context("Failed to create /usr/lib/tmpfiles.d")?;
    std::fs::write(
        dir.join("nbc.conf"),
        format!(
            "f {} 0644 root root -\n",
            nbc_api::constants::BOOTED_SLOT_MARKER_PATH
        ),
    )
    .context("Failed to write tmpfiles.d rule for the booted-slot marker")
}

fn set_root_password(mount_root: &Path, password: &str) -> Result<(), Error> {
    let mut child = Command::new("chroot")
        .arg(mount_root)
        .arg("chpasswd")
        .stdin(Stdio::piped())
        .spawn()
        .context("Failed to spawn chpasswd inside the target root")?;
    child
        .stdin
        .take()
        .context("chpasswd stdin was not piped")?
        .write_all(format!("root:{password}\n").as_bytes())
        .context("Failed to write to chpasswd's stdin")?;
    let status = child.wait().context("Failed to wait for chpasswd")?;
    ensure!(status.success(), "chpasswd exited with status {status}");
    Ok(())
}

fn write_system_config(mount_root: &Path, config: &SystemConfig) -> Result<(), Error> {
    let path = mount_root.join(relative(STATE_FILE_PATH));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create '{}'", parent.display()))?;
    }
    let serialized = serde_json::to_string_pretty(config).context("Failed to serialize SystemConfig")?;
    std::fs::write(&path, serialized)
        .with_context(|| format!("Failed to write '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_dependencies_adds_encryption_tools() {
        let mut config = sample_config();
        config.encrypt = true;
        config.encryption_passphrase = Some("x".to_string());
        config.tpm2_auto_unlock = true;
        let deps = required_dependencies(&config);
        assert!(deps.contains(&Dependency::Cryptsetup));
        assert!(deps.contains(&Dependency::SystemdCryptenroll));
    }

    #[test]
    fn test_required_dependencies_without_encryption() {
        let deps = required_dependencies(&sample_config());
        assert!(!deps.contains(&Dependency::Cryptsetup));
    }

    #[test]
    fn test_promote_to_formatted_rejects_empty_scheme() {
        let scheme = PartitionScheme::Empty {
            device: PathBuf::from("/dev/sda"),
        };
        assert!(promote_to_formatted(scheme).is_err());
    }

    fn sample_config() -> Config {
        Config {
            target_device: Some(PathBuf::from("/dev/sdx")),
            loopback_image_path: None,
            loopback_image_size_bytes: None,
            image_reference: Some("example.com/os:latest".to_string()),
            local_image_path: None,
            root_filesystem: nbc_api::config::FilesystemType::Ext4,
            encrypt: false,
            encryption_passphrase: None,
            tpm2_auto_unlock: false,
            extra_kernel_args: Vec::new(),
            root_password: None,
            dry_run: false,
            force: false,
            json_output: false,
            skip_pull: false,
        }
    }
}
