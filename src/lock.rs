//! A host-wide advisory lock guaranteeing at most one engine instance
//! mutates host state at a time (SPEC_FULL.md §5). Implemented with
//! `create_new`'s exclusive-create semantics rather than pulling in a
//! file-locking crate the rest of the stack doesn't otherwise need.

use std::path::{Path, PathBuf};

use crate::errors::InstallerError;

/// Held for the lifetime of one [`crate::engine::ActiveTransaction`];
/// the lockfile is removed on drop.
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Acquire the advisory lock at `path`, failing with `EngineBusy` if
/// another process already holds it.
pub fn acquire(path: &Path) -> Result<LockGuard, InstallerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(LockGuard {
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(InstallerError::EngineBusy(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}
