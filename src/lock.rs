//! Exclusive session lock
//!
//! The executor holds this lock on `<target>/.install-state/session.lock` for
//! the whole of an install or uninstall run, so two sessions can never mutate
//! the same target at once. The lock is `flock(LOCK_EX)` (or `LockFileEx` on
//! Windows) via `fs2`, and is released when the guard drops.

use crate::error::{InstallError, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of the lock inside the state directory
pub const LOCK_FILE_NAME: &str = "session.lock";

/// Held session lock
#[derive(Debug)]
pub struct SessionLock {
    /// Kept open to hold the lock
    file: File,
    path: PathBuf,
}

impl SessionLock {
    /// Try to take the lock without blocking.
    ///
    /// # Errors
    ///
    /// `SessionAlreadyActive` if another process (or another handle in this
    /// process) holds it; `Io` for anything else.
    pub fn try_acquire(state_dir: &Path, target: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOCK_FILE_NAME);

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                info!("Acquired session lock at {:?}", path);
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                debug!("Session lock already held at {:?}", path);
                Err(InstallError::SessionAlreadyActive {
                    target: target.to_path_buf(),
                })
            }
            Err(e) => Err(InstallError::Io(e)),
        }
    }

    /// Check whether some session currently holds the lock in `state_dir`.
    pub fn is_held(state_dir: &Path) -> bool {
        let Ok(file) = File::open(state_dir.join(LOCK_FILE_NAME)) else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock and delete the lock file.
    pub fn release_and_remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("Released session lock at {:?}", self.path);
    }
}
