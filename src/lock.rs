//! Exclusive per-build-directory lock.
//!
//! Two invocations against the same build directory would interleave
//! package transactions and mount setup in one rootfs. The second one is
//! rejected instead.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};

pub const LOCK_FILENAME: &str = ".build.lock";

/// RAII guard. The lock is released when the file closes; the file itself
/// stays so every process locks the same inode.
#[derive(Debug)]
pub struct BuildLock {
    _file: File,
    path: PathBuf,
}

impl BuildLock {
    /// Take the lock without blocking.
    pub fn acquire(build_dir: &Path) -> Result<Self> {
        fs::create_dir_all(build_dir)
            .map_err(|e| BuildError::io("creating build directory", build_dir, e))?;
        let path = build_dir.join(LOCK_FILENAME);

        // Never unlink a lock file we do not hold. A second process could then
        // create a fresh file at the same path and lock that one instead.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| BuildError::io("opening lock file", &path, e))?;

        if file.try_lock_exclusive().is_err() {
            return Err(BuildError::Locked { path });
        }

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
