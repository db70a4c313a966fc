//! kiln-cache: content-addressed dependency store
//!
//! Dependencies uploaded by one session are reused by every later session
//! that names the same content hash. Blobs live under
//! `<root>/blobs/blake3/<first two hex chars>/<hex>` and are written with
//! tmp + rename, so concurrent `put`s of the same hash are harmless: the
//! content is identical by construction.

use camino::{Utf8Path, Utf8PathBuf};
use kiln_io::atomic_write;
use kiln_proto::ContentHash;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("blob {0} not found in cache")]
    NotFound(ContentHash),

    #[error("failed to read blob {hash}: {source}")]
    Read {
        hash: ContentHash,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write blob {hash}: {source}")]
    Write {
        hash: ContentHash,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create cache directory {path}: {source}")]
    CreateDir {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Content-addressed blob store.
///
/// Safe to share between sessions (`Arc<Cache>`): every operation goes
/// straight to the filesystem and holds no in-process state.
#[derive(Debug)]
pub struct Cache {
    root: Utf8PathBuf,
}

impl Cache {
    /// Open a cache rooted at `<scratch>/cache`, creating its directories.
    pub async fn open(scratch: &Utf8Path) -> Result<Self> {
        let cache = Self {
            root: scratch.join("cache"),
        };
        let blobs_dir = cache.blobs_dir();
        tokio::fs::create_dir_all(&blobs_dir)
            .await
            .map_err(|source| CacheError::CreateDir {
                path: blobs_dir,
                source,
            })?;
        Ok(cache)
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn blobs_dir(&self) -> Utf8PathBuf {
        self.root.join("blobs/blake3")
    }

    /// Where the blob for `hash` lives (whether or not it exists yet).
    pub fn path(&self, hash: &ContentHash) -> Utf8PathBuf {
        let hex = hash.to_hex();
        self.blobs_dir().join(&hex[..2]).join(&hex)
    }

    pub async fn contains(&self, hash: &ContentHash) -> bool {
        tokio::fs::try_exists(self.path(hash))
            .await
            .unwrap_or(false)
    }

    pub async fn get(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        match tokio::fs::read(self.path(hash)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CacheError::NotFound(*hash)),
            Err(source) => Err(CacheError::Read {
                hash: *hash,
                source,
            }),
        }
    }

    /// Store `data` under `hash`. The caller has already verified that
    /// `hash` is the digest of `data`.
    pub async fn put(&self, hash: &ContentHash, data: &[u8]) -> Result<()> {
        let dest = self.path(hash);
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            trace!(hash = %hash.short_hex(), "blob already cached");
            return Ok(());
        }

        atomic_write(&dest, data)
            .await
            .map_err(|source| CacheError::Write {
                hash: *hash,
                source,
            })?;
        debug!(hash = %hash.short_hex(), size = data.len(), "cached blob");
        Ok(())
    }
}
