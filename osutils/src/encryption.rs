use std::path::Path;

use anyhow::{Context, Error};
use uuid::Uuid;

use crate::{dependencies::Dependency, exe::RunAndCheck};

/// Cipher specification string for the LUKS2 data segment.
pub const CIPHER: &str = "aes-xts-plain64";

/// Key size in bits, limited by the cipher specification.
pub const KEY_SIZE: &str = "512";

/// Formats `device_path` as a LUKS2 container with the given passphrase, fed over stdin so it
/// never appears in a process listing.
pub fn luks_format(device_path: impl AsRef<Path>, passphrase: &str) -> Result<(), Error> {
    use std::io::Write;
    use std::process::Stdio;

    let mut child = Dependency::Cryptsetup
        .cmd()
        .arg("luksFormat")
        .arg("--type")
        .arg("luks2")
        .arg("--cipher")
        .arg(CIPHER)
        .arg("--key-size")
        .arg(KEY_SIZE)
        .arg("--batch-mode")
        .arg("--key-file")
        .arg("-")
        .arg(device_path.as_ref())
        .stdin(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to spawn cryptsetup luksFormat for '{}'", device_path.as_ref().display()))?;
    child
        .stdin
        .take()
        .context("Failed to open stdin for cryptsetup luksFormat")?
        .write_all(passphrase.as_bytes())
        .context("Failed to write passphrase to cryptsetup luksFormat")?;
    let status = child
        .wait()
        .with_context(|| format!("Failed to wait for cryptsetup luksFormat on '{}'", device_path.as_ref().display()))?;
    if !status.success() {
        anyhow::bail!(
            "cryptsetup luksFormat on '{}' exited with {}",
            device_path.as_ref().display(),
            status
        );
    }
    Ok(())
}

/// Opens a LUKS2 container at `device_path` under device-mapper name `mapper_name`, feeding the
/// passphrase over stdin. Idempotent: if `/dev/mapper/<mapper_name>` already exists, this is a
/// no-op, since the running system may already hold the mapping open.
pub fn luks_open(device_path: impl AsRef<Path>, mapper_name: &str, passphrase: &str) -> Result<(), Error> {
    use std::io::Write;
    use std::process::Stdio;

    if mapper_exists(mapper_name) {
        return Ok(());
    }

    let mut child = Dependency::Cryptsetup
        .cmd()
        .arg("luksOpen")
        .arg("--key-file")
        .arg("-")
        .arg(device_path.as_ref())
        .arg(mapper_name)
        .stdin(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to spawn cryptsetup luksOpen for '{}'", device_path.as_ref().display()))?;
    child
        .stdin
        .take()
        .context("Failed to open stdin for cryptsetup luksOpen")?
        .write_all(passphrase.as_bytes())
        .context("Failed to write passphrase to cryptsetup luksOpen")?;
    let status = child
        .wait()
        .with_context(|| format!("Failed to wait for cryptsetup luksOpen on '{}'", device_path.as_ref().display()))?;
    if !status.success() {
        anyhow::bail!(
            "cryptsetup luksOpen on '{}' as '{}' exited with {}",
            device_path.as_ref().display(),
            mapper_name,
            status
        );
    }
    Ok(())
}

/// Attempts to open a LUKS2 container using only an enrolled TPM2 token, without a passphrase.
/// Fails fast (rather than hanging on a prompt) if no TPM device is present or the slot was
/// never enrolled.
pub fn try_tpm2_unlock(device_path: impl AsRef<Path>, mapper_name: &str) -> Result<(), Error> {
    if mapper_exists(mapper_name) {
        return Ok(());
    }

    Dependency::Cryptsetup
        .cmd()
        .arg("open")
        .arg("--tpm2-device=auto")
        .arg(device_path.as_ref())
        .arg(mapper_name)
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to open '{}' as '{}' using TPM2 auto-unlock",
                device_path.as_ref().display(),
                mapper_name
            )
        })
}

/// Closes a device-mapper mapping opened by [`luks_open`] or [`try_tpm2_unlock`]. Idempotent:
/// closing an already-closed or never-opened mapper is not an error, since callers run this
/// unconditionally on every exit path.
pub fn luks_close(mapper_name: &str) -> Result<(), Error> {
    if !mapper_exists(mapper_name) {
        return Ok(());
    }

    Dependency::Cryptsetup
        .cmd()
        .arg("close")
        .arg(mapper_name)
        .run_and_check()
        .with_context(|| format!("Failed to close encrypted volume '{}'", mapper_name))
}

/// Enrolls a TPM2 device for auto-unlock on an already-open LUKS2 container, using the supplied
/// passphrase to authenticate the enrollment itself.
pub fn enroll_tpm2(device_path: impl AsRef<Path>, passphrase: &str) -> Result<(), Error> {
    use std::io::Write;
    use std::process::Stdio;

    let mut child = Dependency::SystemdCryptenroll
        .cmd()
        .arg("--tpm2-device=auto")
        .arg("--tpm2-pcrs=7")
        .arg(device_path.as_ref())
        .stdin(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to spawn systemd-cryptenroll for '{}'", device_path.as_ref().display()))?;
    child
        .stdin
        .take()
        .context("Failed to open stdin for systemd-cryptenroll")?
        .write_all(passphrase.as_bytes())
        .context("Failed to write passphrase to systemd-cryptenroll")?;
    let status = child
        .wait()
        .with_context(|| format!("Failed to wait for systemd-cryptenroll on '{}'", device_path.as_ref().display()))?;
    if !status.success() {
        anyhow::bail!(
            "systemd-cryptenroll on '{}' exited with {}",
            device_path.as_ref().display(),
            status
        );
    }
    Ok(())
}

/// Reads the LUKS2 container UUID of a backing partition via `cryptsetup luksUUID`.
pub fn luks_uuid(device_path: impl AsRef<Path>) -> Result<Uuid, Error> {
    let output = Dependency::Cryptsetup
        .cmd()
        .arg("luksUUID")
        .arg(device_path.as_ref())
        .output_and_check()
        .with_context(|| format!("Failed to read LUKS UUID of '{}'", device_path.as_ref().display()))?;
    Uuid::parse_str(output.trim()).with_context(|| {
        format!(
            "Failed to parse LUKS UUID '{}' for '{}'",
            output.trim(),
            device_path.as_ref().display()
        )
    })
}

/// Whether a device-mapper mapping with this name currently exists.
pub fn mapper_exists(mapper_name: &str) -> bool {
    Path::new("/dev/mapper").join(mapper_name).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapper_exists_false_for_unknown_name() {
        assert!(!mapper_exists("nbc-test-mapper-that-does-not-exist"));
    }
}
