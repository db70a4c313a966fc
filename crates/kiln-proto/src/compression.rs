//! Payload compression negotiated per compilation.

use std::io::Read as _;

use serde::{Deserialize, Serialize};

use crate::codec::MAX_PAYLOAD_SIZE;
use crate::error::{ProtoError, Result};

/// xz preset used when compressing outgoing payloads.
const LZMA_PRESET: u32 = 6;

/// Compression applied to dependency contents and compilation artifacts.
///
/// The client picks it in the `Argument` message; the server decompresses
/// dependency replies with it and compresses result artifacts with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Lzma,
}

impl Compression {
    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lzma => "lzma",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Compression::None)
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lzma => {
                let mut encoder = xz2::read::XzEncoder::new(data, LZMA_PRESET);
                let mut out = Vec::new();
                encoder
                    .read_to_end(&mut out)
                    .map_err(|source| ProtoError::Compression {
                        compression: *self,
                        operation: "compress",
                        source,
                    })?;
                Ok(out)
            }
        }
    }

    /// Decompress a payload of at most [`MAX_PAYLOAD_SIZE`] bytes.
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.decompress_limited(data, MAX_PAYLOAD_SIZE)
    }

    /// Decompress, failing once the output would exceed `limit` bytes.
    /// Nothing beyond `limit + 1` bytes is ever buffered.
    pub fn decompress_limited(&self, data: &[u8], limit: u64) -> Result<Vec<u8>> {
        match self {
            Compression::None => {
                if data.len() as u64 > limit {
                    return Err(ProtoError::DecompressedTooLarge { max: limit });
                }
                Ok(data.to_vec())
            }
            Compression::Lzma => {
                let decoder = xz2::read::XzDecoder::new(data);
                let mut out = Vec::new();
                decoder
                    .take(limit.saturating_add(1))
                    .read_to_end(&mut out)
                    .map_err(|source| ProtoError::Compression {
                        compression: *self,
                        operation: "decompress",
                        source,
                    })?;
                if out.len() as u64 > limit {
                    return Err(ProtoError::DecompressedTooLarge { max: limit });
                }
                Ok(out)
            }
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
