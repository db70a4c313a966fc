//! kiln protocol definitions
//!
//! Messages exchanged between a compilation client and `kilnd`, plus the
//! framing codec that turns a byte buffer into messages.
//!
//! A session looks like:
//!
//! ```text
//! Client                                    Server
//!   |  -- Argument { args, cwd, deps } -->     |
//!   |  <-- DependencyRequest { hash } ---------|  (zero or more times,
//!   |  -- DependencyReply { content } -->      |   one outstanding at a time)
//!   |  <-- CompilationResult { ... } ----------|
//!   |      OR                                  |
//!   |  <-- ConnectionRefused { info } ---------|
//! ```
//!
//! Replies carry no correlation id: a `DependencyReply` answers the single
//! outstanding `DependencyRequest`.

pub mod codec;
pub mod compression;
pub mod error;
pub mod hash;
pub mod message;

pub use codec::{MAX_HEADER_SIZE, MAX_PAYLOAD_SIZE, MINIMUM_SIZE_BYTES};
pub use compression::Compression;
pub use error::{ProtoError, Result};
pub use hash::ContentHash;
pub use message::{
    ArgumentMessage, ArtifactFile, CompilationResultMessage, ConnectionRefusedMessage,
    DependencyReplyMessage, DependencyRequestMessage, Message, MessageKind,
};

/// Return code reported when a compilation hit the server's time limit
/// (sysexits `EX_TEMPFAIL`).
pub const EX_TEMPFAIL: i32 = 75;

/// Return code reported when the compiler could not be launched or run
/// (sysexits `EX_IOERR`).
pub const EX_IOERR: i32 = 74;
