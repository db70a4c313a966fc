//! Protocol messages exchanged between client and server.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::compression::Compression;
use crate::hash::ContentHash;

/// The kind of a [`Message`], used for dispatch and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Argument,
    DependencyRequest,
    DependencyReply,
    CompilationResult,
    ConnectionRefused,
}

impl MessageKind {
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Argument => "Argument",
            MessageKind::DependencyRequest => "DependencyRequest",
            MessageKind::DependencyReply => "DependencyReply",
            MessageKind::CompilationResult => "CompilationResult",
            MessageKind::ConnectionRefused => "ConnectionRefused",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Client → server: the compiler invocation and its dependency set
    Argument(ArgumentMessage),
    /// Server → client: please send the content with this hash
    DependencyRequest(DependencyRequestMessage),
    /// Client → server: content answering the outstanding request
    DependencyReply(DependencyReplyMessage),
    /// Server → client: outcome of the compilation
    CompilationResult(CompilationResultMessage),
    /// Server → client: the server will not serve this connection
    ConnectionRefused(ConnectionRefusedMessage),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Argument(_) => MessageKind::Argument,
            Message::DependencyRequest(_) => MessageKind::DependencyRequest,
            Message::DependencyReply(_) => MessageKind::DependencyReply,
            Message::CompilationResult(_) => MessageKind::CompilationResult,
            Message::ConnectionRefused(_) => MessageKind::ConnectionRefused,
        }
    }
}

impl From<ArgumentMessage> for Message {
    fn from(message: ArgumentMessage) -> Self {
        Message::Argument(message)
    }
}

impl From<DependencyRequestMessage> for Message {
    fn from(message: DependencyRequestMessage) -> Self {
        Message::DependencyRequest(message)
    }
}

impl From<DependencyReplyMessage> for Message {
    fn from(message: DependencyReplyMessage) -> Self {
        Message::DependencyReply(message)
    }
}

impl From<CompilationResultMessage> for Message {
    fn from(message: CompilationResultMessage) -> Self {
        Message::CompilationResult(message)
    }
}

impl From<ConnectionRefusedMessage> for Message {
    fn from(message: ConnectionRefusedMessage) -> Self {
        Message::ConnectionRefused(message)
    }
}

/// Compiler invocation sent by the client to start a compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentMessage {
    /// Full argument vector, compiler first (`["gcc", "-c", "main.c"]`)
    pub args: Vec<String>,

    /// Client working directory (absolute)
    pub cwd: String,

    /// Every file the compilation reads, client path → content hash
    pub dependencies: BTreeMap<String, ContentHash>,

    /// Explicit target triple requested by the client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Named chroot-style sandbox profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schroot_profile: Option<String>,

    /// Named container to compile in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_container: Option<String>,

    #[serde(default)]
    pub compression: Compression,
}

impl ArgumentMessage {
    pub fn new(args: Vec<String>, cwd: impl Into<String>) -> Self {
        Self {
            args,
            cwd: cwd.into(),
            dependencies: BTreeMap::new(),
            target: None,
            schroot_profile: None,
            docker_container: None,
            compression: Compression::None,
        }
    }

    #[must_use]
    pub fn with_dependency(mut self, path: impl Into<String>, hash: ContentHash) -> Self {
        self.dependencies.insert(path.into(), hash);
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    #[must_use]
    pub fn with_schroot_profile(mut self, profile: impl Into<String>) -> Self {
        self.schroot_profile = Some(profile.into());
        self
    }

    #[must_use]
    pub fn with_docker_container(mut self, container: impl Into<String>) -> Self {
        self.docker_container = Some(container.into());
        self
    }

    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRequestMessage {
    pub hash: ContentHash,
}

impl DependencyRequestMessage {
    pub fn new(hash: ContentHash) -> Self {
        Self { hash }
    }
}

/// Content of one dependency.
///
/// Carries no identifier: it answers whichever request is outstanding.
/// `content` is always the uncompressed bytes; `compression` only governs
/// how it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyReplyMessage {
    pub content: Vec<u8>,
    pub compression: Compression,
}

impl DependencyReplyMessage {
    pub fn new(content: Vec<u8>, compression: Compression) -> Self {
        Self {
            content,
            compression,
        }
    }
}

/// A file produced by the compiler, named by its client-side path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    pub file_name: String,
    pub content: Vec<u8>,
}

impl ArtifactFile {
    pub fn new(file_name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            content,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationResultMessage {
    pub object_files: Vec<ArtifactFile>,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub compression: Compression,
    /// Split debug info (`.dwo`) produced next to the object files
    pub dwarf_files: Vec<ArtifactFile>,
}

impl CompilationResultMessage {
    /// A result that carries no artifacts, only diagnostics and a code.
    pub fn failure(stderr: impl Into<String>, return_code: i32, compression: Compression) -> Self {
        Self {
            object_files: Vec::new(),
            stdout: String::new(),
            stderr: stderr.into(),
            return_code,
            compression,
            dwarf_files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRefusedMessage {
    /// Human-readable reason
    pub info: String,
}

impl ConnectionRefusedMessage {
    pub fn new(info: impl Into<String>) -> Self {
        Self { info: info.into() }
    }
}
