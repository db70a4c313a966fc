//! Common I/O utilities for kiln crates

use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

pub mod net;

/// Atomically write contents to a file.
///
/// Creates a temporary file in the same directory, writes contents,
/// then atomically renames to the final path. Readers never observe a
/// partially written file, and concurrent writers of identical contents
/// leave the same file behind.
pub async fn atomic_write(path: &Utf8Path, contents: &[u8]) -> Result<(), std::io::Error> {
    let parent_dir = path.parent().unwrap_or_else(|| Utf8Path::new("."));

    tokio::fs::create_dir_all(parent_dir).await?;

    // Same directory, so the rename stays on one filesystem
    let temp_file = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent_dir)
        .map_err(std::io::Error::other)?;

    let temp_path = temp_file.into_temp_path();
    tokio::fs::write(&temp_path, contents).await?;

    temp_path
        .persist(path)
        .map_err(|e| std::io::Error::other(format!("failed to persist temp file: {}", e)))?;

    Ok(())
}

/// Create a unique scratch directory under the given base path.
///
/// The directory name is derived from timestamp + PID + atomic counter,
/// ensuring uniqueness even under concurrent access.
///
/// The caller is responsible for cleaning up the directory when done.
pub async fn create_scratch_dir(base: &Utf8Path) -> Result<Utf8PathBuf, std::io::Error> {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let pid = std::process::id();
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let id = format!("{:x}-{}-{}", timestamp, pid, count);
    let dir = base.join(&id);

    tokio::fs::create_dir_all(&dir).await?;

    Ok(dir)
}

/// Server-owned scratch space holding the cache and every session's
/// instance folder.
///
/// Released explicitly with [`ScratchRoot::release`]; releasing more than
/// once is a no-op. Dropping an unreleased root also deletes it.
#[derive(Debug)]
pub struct ScratchRoot {
    path: Utf8PathBuf,
    dir: Mutex<Option<TempDir>>,
}

impl ScratchRoot {
    /// Create a fresh root under `parent`, or under the system temp
    /// directory when `parent` is `None`.
    pub fn create(parent: Option<&Utf8Path>) -> eyre::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("kiln-");
        let dir = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };

        let path = Utf8PathBuf::try_from(dir.path().to_path_buf())
            .map_err(|e| eyre::eyre!("scratch root is not valid UTF-8: {}", e))?;
        debug!(path = %path, "created scratch root");

        Ok(Self {
            path,
            dir: Mutex::new(Some(dir)),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Recursively delete the root. Returns `Ok(false)` if it was already
    /// released.
    pub fn release(&self) -> Result<bool, std::io::Error> {
        let dir = match self.dir.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        match dir {
            Some(dir) => {
                dir.close()?;
                info!(path = %self.path, "released scratch root");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_released(&self) -> bool {
        match self.dir.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}
