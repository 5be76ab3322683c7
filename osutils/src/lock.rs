use std::{
    fs::{File, OpenOptions},
    path::Path,
};

use anyhow::{Context, Error};
use nix::fcntl::{flock, FlockArg};
use std::os::fd::AsRawFd;

/// An exclusive, advisory lock on a file path, released automatically when dropped. Used by the
/// Installer and Updater Orchestrators to refuse to run concurrently against the same host.
pub struct ExclusiveLock {
    _file: File,
}

impl ExclusiveLock {
    /// Attempts to acquire the lock without blocking. Returns `Ok(None)` (rather than an error)
    /// if another process already holds it, so the caller can translate that into a
    /// precondition error with its own message.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>, Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory '{}'", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file '{}'", path.display()))?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(Some(ExclusiveLock { _file: file })),
            Err(nix::errno::Errno::EWOULDBLOCK) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to lock '{}'", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lock_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");

        let first = ExclusiveLock::try_acquire(&path).unwrap();
        assert!(first.is_some());

        let second = ExclusiveLock::try_acquire(&path).unwrap();
        assert!(second.is_none());

        drop(first);
        let third = ExclusiveLock::try_acquire(&path).unwrap();
        assert!(third.is_some());
    }
}
