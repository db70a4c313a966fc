//! kiln-server: the remote compilation daemon
//!
//! Clients connect over TCP, send an `Argument` message describing a
//! compiler invocation and the content hashes of everything it reads, upload
//! whatever the server's cache lacks, and receive a `CompilationResult`.
//!
//! Layout:
//! - [`server`]: bind, accept loop, admission control, shutdown
//! - [`limiter`]: bounded count of live sessions
//! - [`session`]: the per-connection state machine
//! - [`order`]: shuffled request order for missing dependencies
//! - [`refusal`]: the polite refuse-and-close handshake
//! - [`config`]: defaults, config file, CLI overlay

pub mod config;
pub mod error;
pub mod limiter;
pub mod order;
pub mod refusal;
pub mod server;
pub mod session;

pub use config::{DEFAULT_ADDRESS, DEFAULT_COMPILATION_TIMEOUT, DEFAULT_PORT, ServerConfig};
pub use error::{Result, ServerError};
pub use limiter::{ConnectionLimiter, ConnectionPermit};
pub use order::DependencyOrder;
pub use server::{Server, ServerHandle};
pub use session::MAX_DEPENDENCY_ATTEMPTS;
