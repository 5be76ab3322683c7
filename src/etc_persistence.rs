use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use nbc_api::constants::{ETC_LOWER_DIR, ETC_OVERLAY_UPPER_DIR, ETC_OVERLAY_WORK_DIR, ETC_PRISTINE_DIR, MACHINE_ID_UNINITIALIZED};
use sha2::{Digest, Sha256};

/// Strips a leading `/` so a constant like [`ETC_LOWER_DIR`] can be joined onto `target_root`.
fn relative(path: &str) -> &Path {
    Path::new(path.trim_start_matches('/'))
}

/// Copies `target_root/etc` into `target_root/.etc.lower`, snapshots it again into
/// `/var/lib/nbc/etc.pristine`, creates the empty overlay upper/work directories, and overwrites
/// `machine-id` in the lower copy with the fresh-install sentinel. Run once, at the end of
/// extraction, before the root slot is ever booted.
pub fn provision_etc_persistence(target_root: impl AsRef<Path>) -> Result<(), Error> {
    let target_root = target_root.as_ref();
    populate_etc_lower(target_root)?;

    let pristine = target_root.join(relative(ETC_PRISTINE_DIR));
    let upper = target_root.join(relative(ETC_OVERLAY_UPPER_DIR));
    let work = target_root.join(relative(ETC_OVERLAY_WORK_DIR));

    copy_tree(&target_root.join("etc"), &pristine).context("Failed to snapshot pristine /etc")?;
    fs::create_dir_all(&upper).context("Failed to create /etc overlay upper directory")?;
    fs::create_dir_all(&work).context("Failed to create /etc overlay work directory")?;

    Ok(())
}

/// Copies `target_root/etc` into `target_root/.etc.lower` and resets the copy's `machine-id` to
/// the fresh-install sentinel. Shared by a fresh install (via [`provision_etc_persistence`]) and
/// the updater's new slot: the updater does not otherwise touch `/var`'s shared pristine/upper/work
/// directories here, since pruning them is a separate, explicit merge step.
pub fn populate_etc_lower(target_root: impl AsRef<Path>) -> Result<(), Error> {
    let target_root = target_root.as_ref();
    let source_etc = target_root.join("etc");
    let lower = target_root.join(relative(ETC_LOWER_DIR));

    copy_tree(&source_etc, &lower).context("Failed to populate /.etc.lower from extracted /etc")?;
    fs::write(lower.join("machine-id"), MACHINE_ID_UNINITIALIZED)
        .context("Failed to reset machine-id to the fresh-install sentinel")?;
    Ok(())
}

/// Three-way merge run by the updater before the new slot is booted. For every file under
/// `active_upper` (the currently-running system's overlay upper layer), compares it against the
/// same relative path in `pristine` (the snapshot taken at install or last update). A file that
/// differs from pristine, or has no pristine counterpart at all, is user data and is copied into
/// `new_upper`; a file that matches pristine is left for the new image's own `/.etc.lower` to
/// provide.
pub fn merge_etc_from_active(
    active_upper: impl AsRef<Path>,
    pristine: impl AsRef<Path>,
    new_upper: impl AsRef<Path>,
) -> Result<(), Error> {
    let active_upper = active_upper.as_ref();
    let pristine = pristine.as_ref();
    let new_upper = new_upper.as_ref();

    if !active_upper.is_dir() {
        return Ok(());
    }

    for relative_path in walk_files(active_upper)? {
        let active_file = active_upper.join(&relative_path);
        let pristine_file = pristine.join(&relative_path);

        let user_modified = match pristine_file.is_file() {
            false => true,
            true => hash_file(&active_file)? != hash_file(&pristine_file)?,
        };

        if !user_modified {
            continue;
        }

        let dest = new_upper.join(&relative_path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create '{}'", parent.display()))?;
        }
        fs::copy(&active_file, &dest).with_context(|| {
            format!(
                "Failed to merge user-modified '{}' into new overlay upper",
                relative_path.display()
            )
        })?;
    }

    Ok(())
}

/// Run by the updater before extraction begins: copies SSH host keys and `machine-id` from the
/// running system's real `/etc` into `running_upper` if they are not already present there, so an
/// update can never regress host identity even on a system where the user never touched either
/// file. A no-op in `dry_run`.
pub fn ensure_critical_files_in_overlay(
    running_upper: impl AsRef<Path>,
    dry_run: bool,
) -> Result<(), Error> {
    let running_upper = running_upper.as_ref();
    let live_etc = Path::new("/etc");

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(entries) = fs::read_dir(live_etc.join("ssh")) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("ssh_host_") {
                candidates.push(Path::new("ssh").join(name));
            }
        }
    }
    candidates.push(PathBuf::from("machine-id"));

    for relative_path in candidates {
        let source = live_etc.join(&relative_path);
        let dest = running_upper.join(&relative_path);
        if !source.is_file() || dest.exists() {
            continue;
        }
        if dry_run {
            log::info!(
                "dry-run: would preserve '{}' into the /etc overlay upper layer",
                relative_path.display()
            );
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, &dest).with_context(|| {
            format!(
                "Failed to preserve critical file '{}' into the overlay upper layer",
                relative_path.display()
            )
        })?;
    }

    Ok(())
}

/// Recursively copies `src` onto `dst`, creating `dst` if it does not exist. Symlinks are
/// recreated as symlinks rather than followed.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<(), Error> {
    fs::create_dir_all(dst).with_context(|| format!("Failed to create '{}'", dst.display()))?;

    for entry in fs::read_dir(src).with_context(|| format!("Failed to read '{}'", src.display()))? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if file_type.is_dir() {
            copy_tree(&src_path, &dst_path)?;
        } else if file_type.is_symlink() {
            let link_target = fs::read_link(&src_path)?;
            let _ = fs::remove_file(&dst_path);
            std::os::unix::fs::symlink(&link_target, &dst_path).with_context(|| {
                format!("Failed to recreate symlink '{}'", dst_path.display())
            })?;
        } else {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("Failed to copy '{}'", src_path.display()))?;
        }
    }
    Ok(())
}

/// Lists every regular file under `root`, as paths relative to `root`. Directories and symlinks
/// are not returned; a symlink is never "user data" in the sense the merge cares about.
pub(crate) fn walk_files(root: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut out = Vec::new();
    let mut stack = vec![PathBuf::new()];

    while let Some(relative_dir) = stack.pop() {
        let absolute_dir = root.join(&relative_dir);
        for entry in fs::read_dir(&absolute_dir)
            .with_context(|| format!("Failed to read '{}'", absolute_dir.display()))?
        {
            let entry = entry?;
            let relative_path = relative_dir.join(entry.file_name());
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(relative_path);
            } else if file_type.is_file() {
                out.push(relative_path);
            }
        }
    }

    Ok(out)
}

fn hash_file(path: &Path) -> Result<[u8; 32], Error> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read '{}'", path.display()))?;
    Ok(Sha256::digest(&bytes).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_etc_persistence_resets_machine_id() {
        let root = tempfile::tempdir().unwrap();
        let etc = root.path().join("etc");
        fs::create_dir_all(&etc).unwrap();
        fs::write(etc.join("machine-id"), "deadbeefcafef00d\n").unwrap();
        fs::write(etc.join("hostname"), "myhost\n").unwrap();

        provision_etc_persistence(root.path()).unwrap();

        let lower_machine_id =
            fs::read_to_string(root.path().join(".etc.lower/machine-id")).unwrap();
        assert_eq!(lower_machine_id, MACHINE_ID_UNINITIALIZED);
        assert!(root.path().join(".etc.lower/hostname").exists());
        assert!(root
            .path()
            .join("var/lib/nbc/etc.pristine/hostname")
            .exists());
        assert!(root.path().join("var/lib/nbc/etc-overlay/upper").is_dir());
        assert!(root.path().join("var/lib/nbc/etc-overlay/work").is_dir());
    }

    #[test]
    fn test_merge_etc_from_active_keeps_modified_and_new_files() {
        let active_upper = tempfile::tempdir().unwrap();
        let pristine = tempfile::tempdir().unwrap();
        let new_upper = tempfile::tempdir().unwrap();

        fs::write(pristine.path().join("resolv.conf"), "nameserver 1.1.1.1\n").unwrap();
        fs::write(active_upper.path().join("resolv.conf"), "nameserver 9.9.9.9\n").unwrap();
        fs::write(active_upper.path().join("motd"), "welcome\n").unwrap();

        merge_etc_from_active(active_upper.path(), pristine.path(), new_upper.path()).unwrap();

        assert!(new_upper.path().join("resolv.conf").exists());
        assert!(new_upper.path().join("motd").exists());
    }

    #[test]
    fn test_merge_etc_from_active_skips_unmodified_files() {
        let active_upper = tempfile::tempdir().unwrap();
        let pristine = tempfile::tempdir().unwrap();
        let new_upper = tempfile::tempdir().unwrap();

        fs::write(pristine.path().join("hosts"), "127.0.0.1 localhost\n").unwrap();
        fs::write(active_upper.path().join("hosts"), "127.0.0.1 localhost\n").unwrap();

        merge_etc_from_active(active_upper.path(), pristine.path(), new_upper.path()).unwrap();

        assert!(!new_upper.path().join("hosts").exists());
    }

    #[test]
    fn test_merge_etc_from_active_noop_without_active_upper() {
        let pristine = tempfile::tempdir().unwrap();
        let new_upper = tempfile::tempdir().unwrap();
        merge_etc_from_active(
            Path::new("/nbc-test-nonexistent-upper"),
            pristine.path(),
            new_upper.path(),
        )
        .unwrap();
    }
}
