//! Server configuration.
//!
//! Precedence, lowest first: built-in defaults, the `[kilnd]` table of the
//! first config file found (see [`config_search_paths`]), command-line flags.
//!
//! ```toml
//! [kilnd]
//! address = "0.0.0.0"
//! port = 3126
//! limit = 16
//! log_level = "info"
//! verbose = false
//! compilation_timeout_secs = 180
//! ```

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use kiln_io::net::{normalize_tcp_host, tcp_endpoint};
use serde::Deserialize;
use tracing::error;

use crate::error::{Result, ServerError};

pub const DEFAULT_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3126;
pub const DEFAULT_COMPILATION_TIMEOUT: Duration = Duration::from_secs(180);

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "KILN_CONFIG";

/// Immutable once the server is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    /// Maximum number of concurrently served connections
    pub limit: usize,
    /// Bounds both socket inactivity and compiler wall-clock time
    pub compilation_timeout: Duration,
    /// Where the scratch root is created (system temp dir when `None`)
    pub scratch_parent: Option<Utf8PathBuf>,
    /// Fixes the per-session dependency order; tests only
    pub shuffle_seed: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(default_limit())
    }
}

impl ServerConfig {
    /// Defaults for everything but the connection limit.
    pub fn new(limit: usize) -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            limit,
            compilation_timeout: DEFAULT_COMPILATION_TIMEOUT,
            scratch_parent: None,
            shuffle_seed: None,
        }
    }

    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn with_compilation_timeout(mut self, timeout: Duration) -> Self {
        self.compilation_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_scratch_parent(mut self, parent: impl Into<Utf8PathBuf>) -> Self {
        self.scratch_parent = Some(parent.into());
        self
    }

    #[must_use]
    pub fn with_shuffle_seed(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(ServerError::Config(
                "connection limit must be at least 1".to_string(),
            ));
        }
        if self.compilation_timeout.is_zero() {
            return Err(ServerError::Config(
                "compilation timeout must be positive".to_string(),
            ));
        }
        self.endpoint().map(|_| ())
    }

    /// `host:port` to bind, IPv6 literals bracketed.
    pub fn endpoint(&self) -> Result<String> {
        let host = normalize_tcp_host(&self.address)
            .map_err(|e| ServerError::Config(format!("listen address: {e}")))?;
        Ok(tcp_endpoint(&host, self.port))
    }
}

/// One connection per CPU plus two, so sessions blocked on disk or network
/// do not starve the CPUs.
pub fn default_limit() -> usize {
    match std::thread::available_parallelism() {
        Ok(cpus) => cpus.get() + 2,
        Err(e) => {
            let limit = 1;
            error!(
                error = %e,
                limit,
                "a meaningful CPU count could not be determined; \
                 provide the connection limit explicitly via --jobs or the config file"
            );
            limit
        }
    }
}

/// A parsed config file.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub kilnd: DaemonSection,
}

/// The `[kilnd]` table.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DaemonSection {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub limit: Option<usize>,
    pub log_level: Option<String>,
    pub verbose: Option<bool>,
    pub compilation_timeout_secs: Option<u64>,
}

impl ConfigFile {
    pub fn parse(path: &Utf8Path, text: &str) -> Result<Self> {
        toml_edit::de::from_str(text).map_err(|source| ServerError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Utf8Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ServerError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &text)
    }

    /// Load the first existing file from [`config_search_paths`], if any.
    pub fn discover() -> Result<Option<(Utf8PathBuf, Self)>> {
        match config_search_paths().into_iter().find(|path| path.is_file()) {
            Some(path) => {
                let file = Self::load(&path)?;
                Ok(Some((path, file)))
            }
            None => Ok(None),
        }
    }
}

impl DaemonSection {
    /// Overlay the values set in this table onto `config`.
    #[must_use]
    pub fn apply(&self, mut config: ServerConfig) -> ServerConfig {
        if let Some(address) = &self.address {
            config.address = address.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(limit) = self.limit {
            config.limit = limit;
        }
        if let Some(secs) = self.compilation_timeout_secs {
            config.compilation_timeout = Duration::from_secs(secs);
        }
        config
    }
}

/// Candidate config files, highest priority first.
pub fn config_search_paths() -> Vec<Utf8PathBuf> {
    search_paths_from(
        std::env::var(CONFIG_ENV).ok(),
        std::env::var("XDG_CONFIG_HOME").ok(),
        dirs::home_dir().and_then(|home| Utf8PathBuf::from_path_buf(home).ok()),
    )
}

pub(crate) fn search_paths_from(
    explicit: Option<String>,
    xdg_config_home: Option<String>,
    home: Option<Utf8PathBuf>,
) -> Vec<Utf8PathBuf> {
    let mut paths = Vec::new();

    if let Some(explicit) = explicit.filter(|p| !p.is_empty()) {
        paths.push(Utf8PathBuf::from(explicit));
    }

    match (xdg_config_home.filter(|p| !p.is_empty()), &home) {
        (Some(xdg), _) => paths.push(Utf8PathBuf::from(xdg).join("kiln/server.toml")),
        (None, Some(home)) => paths.push(home.join(".config/kiln/server.toml")),
        (None, None) => {}
    }

    if let Some(home) = &home {
        paths.push(home.join(".kiln/server.toml"));
    }

    paths.push(Utf8PathBuf::from("/etc/kiln/server.toml"));
    paths
}
