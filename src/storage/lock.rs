//! Cross-process lock per logical file using advisory file locking (fs2 flock).
//!
//! In-process writers are already serialized by the store's name locks; this
//! keeps a second process (another CLI invocation, say) from interleaving
//! its commit with ours.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Advisory lock for one logical file. Lives at `<locks_dir>/<name>.lock`.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

/// RAII guard that releases the lock on drop.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl FileLock {
    pub fn for_name(locks_dir: &Path, name: &str) -> Self {
        Self {
            path: locks_dir.join(format!("{}.lock", name)),
        }
    }

    /// Blocking acquire.
    pub fn acquire(&self) -> Result<FileLockGuard> {
        let file = self.open()?;
        file.lock_exclusive()?;
        Ok(FileLockGuard { file })
    }

    /// Non-blocking acquire. `None` if another holder has it.
    pub fn try_acquire(&self) -> Result<Option<FileLockGuard>> {
        let file = self.open()?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(FileLockGuard { file })),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            #[cfg(unix)]
            Err(ref e) if e.raw_os_error() == Some(libc::EWOULDBLOCK) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn open(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?)
    }
}
