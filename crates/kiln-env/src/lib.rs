//! kiln-env: per-session compilation environments
//!
//! An [`Environment`] is the workspace one client connection compiles in:
//!
//! - an instance folder under the server's scratch root, into which every
//!   client path is relocated ([`mapping`])
//! - dependencies linked in from the shared [`kiln_cache::Cache`]
//! - a [`ShellEnvironment`] deciding where the compiler runs (host,
//!   schroot profile, docker container)
//!
//! Compilation failures the protocol cares about are typed:
//! [`EnvError::CompilationTimeout`], [`EnvError::ClientDisconnected`] and
//! [`EnvError::Io`].

pub mod arguments;
pub mod environment;
pub mod error;
pub mod mapping;
pub mod sandbox;
pub mod shell;

pub use arguments::{Arguments, CompilerKind, extract_source_files};
pub use environment::{Environment, EnvironmentOptions};
pub use error::{EnvError, Result};
pub use mapping::{
    confine, map_arguments, map_cwd, map_path, normalize_path, unmap_path, unmap_text,
};
pub use shell::ShellEnvironment;

#[cfg(test)]
mod tests;
