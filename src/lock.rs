//! Advisory file locking with a bounded wait, used by every store that
//! shares its backing file across independent server processes.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tokio::time::sleep;

use crate::error::{AgentMeshError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A held exclusive lock on `path.lock`. Dropping it releases the lock.
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Acquire an exclusive lock on `lock_path`, retrying until `timeout`
    /// elapses. Callers pass the dedicated lock-file path (e.g.
    /// `dashboard.lock`), not the data file itself.
    pub async fn acquire(lock_path: &Path, timeout: Duration, what: &str) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(lock_path)?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(_) if start.elapsed() >= timeout => {
                    return Err(AgentMeshError::ConcurrencyTimeout(timeout, what.to_string()));
                }
                Err(_) => sleep(POLL_INTERVAL).await,
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Write `contents` to `path` atomically: write to a sibling temp file then
/// rename over the target. Guarantees readers never observe a partial write.
pub async fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension(format!(
        "{}.tmp-{}",
        path.extension().and_then(|e| e.to_str()).unwrap_or("dat"),
        uuid::Uuid::new_v4()
    ));
    tokio::fs::write(&tmp_path, contents).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}
