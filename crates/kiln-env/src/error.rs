//! Error types for kiln-env.

use std::time::Duration;

use camino::Utf8PathBuf;
use kiln_cache::CacheError;
use thiserror::Error;

/// Errors that can occur while preparing or running a compilation.
#[derive(Debug, Error)]
pub enum EnvError {
    // === Request Errors ===
    #[error("empty compiler invocation")]
    EmptyArguments,

    #[error("could not retrieve target information for compiler '{0}'")]
    UnsupportedCompiler(String),

    /// A client path that resolves outside the session's instance folder
    #[error("path '{path}' leaves the session workspace")]
    PathOutsideInstance { path: String },

    // === Workspace Errors ===
    #[error("failed to create instance folder {path}: {source}")]
    InstanceFolder {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to link dependency {path}: {source}")]
    Link {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    // === Compilation Errors ===
    #[error("client disconnected during compilation")]
    ClientDisconnected,

    #[error("compilation did not finish within {}s", .timeout.as_secs())]
    CompilationTimeout { timeout: Duration },

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Result type for environment operations.
pub type Result<T> = std::result::Result<T, EnvError>;
