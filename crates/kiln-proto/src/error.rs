//! Error types for kiln-proto.

use thiserror::Error;

use crate::compression::Compression;

/// Errors raised while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("message header of {size} bytes exceeds the maximum of {max} bytes")]
    HeaderTooLarge { size: usize, max: usize },

    #[error("message payload of {size} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("decompressed payload exceeds the maximum of {max} bytes")]
    DecompressedTooLarge { max: u64 },

    #[error("malformed message header: {0}")]
    MalformedHeader(#[source] serde_json::Error),

    #[error("failed to encode message header: {0}")]
    EncodeHeader(#[source] serde_json::Error),

    #[error("failed to {operation} payload with {compression}: {source}")]
    Compression {
        compression: Compression,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
