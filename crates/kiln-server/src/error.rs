//! Error types for kiln-server.

use camino::Utf8PathBuf;
use kiln_cache::CacheError;
use kiln_env::EnvError;
use kiln_proto::ProtoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    // === Startup Errors ===
    /// The listening socket could not be bound. Fatal to process startup.
    #[error("could not start server on {address}: {source}")]
    Initialization {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: Utf8PathBuf,
        #[source]
        source: toml_edit::de::Error,
    },

    #[error("failed to create scratch root: {0}")]
    Scratch(eyre::Report),

    #[error("failed to release scratch root: {0}")]
    ScratchRelease(#[source] std::io::Error),

    // === Session Errors ===
    #[error("connection idle for more than {secs}s")]
    IdleTimeout { secs: u64 },

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
