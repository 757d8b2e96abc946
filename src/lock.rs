//! Single-instance enforcement via an exclusive lock file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{info, warn};

use crate::error::{Result, StorageError};

/// An exclusive advisory lock over one storage scope.
///
/// The lock file is created with `create_new`, so a pre-existing file from
/// any process — live or crashed — refuses the scope. A crashed owner
/// leaves a stale file behind; the spec'd recovery is manual removal by an
/// operator after verifying no live process, never automatic takeover.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquires the lock at `path`, writing the owner PID into the file.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StorageError::InstanceLocked {
                    path: path.to_path_buf(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        // The flock guards against a second handle on the file we just
        // created; create_new already rejected everyone else.
        if file.try_lock_exclusive().is_err() {
            let _ = fs::remove_file(path);
            return Err(StorageError::InstanceLocked {
                path: path.to_path_buf(),
            });
        }

        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        info!(path = %path.display(), "acquired instance lock");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), %err, "could not unlock instance lock");
        }
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "could not remove instance lock file");
        } else {
            info!(path = %self.path.display(), "released instance lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_fails_while_held() {
        let tmp = TempDir::new().expect("tmp");
        let path = tmp.path().join(".lock");

        let held = InstanceLock::acquire(&path).expect("first acquire");
        let err = InstanceLock::acquire(&path).expect_err("second acquire");
        assert!(matches!(err, StorageError::InstanceLocked { .. }));

        drop(held);
        assert!(!path.exists());
        let _ = InstanceLock::acquire(&path).expect("reacquire after release");
    }

    #[test]
    fn stale_file_refuses_until_removed() {
        let tmp = TempDir::new().expect("tmp");
        let path = tmp.path().join(".lock_2025-01-15");
        std::fs::write(&path, "12345\n").expect("seed stale lock");

        let err = InstanceLock::acquire(&path).expect_err("stale lock");
        assert!(matches!(err, StorageError::InstanceLocked { .. }));

        std::fs::remove_file(&path).expect("operator removes stale lock");
        let _ = InstanceLock::acquire(&path).expect("acquire after removal");
    }
}
