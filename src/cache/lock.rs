//! Cross-process locks guarding cache read-modify-write cycles.
//!
//! Each cache key has a lock file in the cache directory. Holding the lock
//! means holding an exclusive advisory lock on that file for the lifetime of
//! the guard. The operating system drops the lock when the holder closes the
//! file or dies, so an abandoned lock never needs to be broken by hand and the
//! file itself stays in place.

use crate::error::CacheError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Held lock on a single cache key.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Acquire the lock for `key` inside `dir`, waiting up to `timeout`.
    pub async fn acquire(dir: &Path, key: &str, timeout: Duration) -> Result<Self, CacheError> {
        fs::create_dir_all(dir).map_err(|e| CacheError::StoreFailed(e.to_string()))?;
        let path = dir.join(format!("{}.lock", key));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CacheError::StoreFailed(e.to_string()))?;
        let deadline = Instant::now() + timeout;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!("Acquired cache lock {}", path.display());
                    return Ok(Self { file, path });
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if Instant::now() >= deadline {
                        return Err(CacheError::LockTimeout(key.to_string()));
                    }
                    sleep(RETRY_INTERVAL).await;
                }
                Err(e) => return Err(CacheError::StoreFailed(e.to_string())),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release cache lock {}: {}", self.path.display(), e);
        }
    }
}
