//! Framing codec.
//!
//! Every message is framed as:
//!
//! ```text
//! +----------------------------+------------------+--------------------+
//! | Header length (4 bytes, BE)| JSON header      | Binary payload     |
//! +----------------------------+------------------+--------------------+
//! ```
//!
//! The header names the message kind and, for kinds that carry file
//! contents, the payload sizes. Sizes are validated before anything is
//! allocated for the payload.
//!
//! [`Message::from_bytes`] reports progress as a signed "bytes needed"
//! value:
//!
//! - `> 0`: the buffer holds an incomplete message; at least that many more
//!   bytes are needed before anything can be parsed
//! - `< 0`: one message was parsed and `|n|` trailing bytes were not consumed
//! - `0`: one message was parsed and the buffer was consumed exactly

use serde::{Deserialize, Serialize};

use crate::compression::Compression;
use crate::error::{ProtoError, Result};
use crate::message::{
    ArgumentMessage, ArtifactFile, CompilationResultMessage, ConnectionRefusedMessage,
    DependencyReplyMessage, DependencyRequestMessage, Message,
};

/// Size of the big-endian header length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Smallest buffer that can make any parsing progress.
pub const MINIMUM_SIZE_BYTES: usize = LENGTH_PREFIX_SIZE;

/// Largest accepted JSON header.
pub const MAX_HEADER_SIZE: usize = 16 * 1024 * 1024;

/// Largest accepted binary payload.
pub const MAX_PAYLOAD_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "message_type")]
enum WireHeader {
    Argument(ArgumentMessage),
    DependencyRequest(DependencyRequestMessage),
    DependencyReply {
        size: u64,
        #[serde(default)]
        compression: Compression,
    },
    CompilationResult {
        object_files: Vec<WireFile>,
        stdout: String,
        stderr: String,
        return_code: i32,
        #[serde(default)]
        compression: Compression,
        #[serde(default)]
        dwarf_files: Vec<WireFile>,
    },
    ConnectionRefused(ConnectionRefusedMessage),
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFile {
    file_name: String,
    size: u64,
}

impl WireHeader {
    fn payload_len(&self) -> Result<u64> {
        let len = match self {
            WireHeader::DependencyReply { size, .. } => *size,
            WireHeader::CompilationResult {
                object_files,
                dwarf_files,
                ..
            } => object_files
                .iter()
                .chain(dwarf_files)
                .try_fold(0u64, |acc, file| acc.checked_add(file.size))
                .unwrap_or(u64::MAX),
            _ => 0,
        };

        if len > MAX_PAYLOAD_SIZE {
            return Err(ProtoError::PayloadTooLarge {
                size: len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(len)
    }

    fn into_message(self, payload: &[u8]) -> Result<Message> {
        let message = match self {
            WireHeader::Argument(message) => Message::Argument(message),
            WireHeader::DependencyRequest(message) => Message::DependencyRequest(message),
            WireHeader::ConnectionRefused(message) => Message::ConnectionRefused(message),
            WireHeader::DependencyReply { compression, .. } => {
                Message::DependencyReply(DependencyReplyMessage {
                    content: compression.decompress(payload)?,
                    compression,
                })
            }
            WireHeader::CompilationResult {
                object_files,
                stdout,
                stderr,
                return_code,
                compression,
                dwarf_files,
            } => {
                let mut rest = payload;
                let object_files = split_files(object_files, &mut rest, compression)?;
                let dwarf_files = split_files(dwarf_files, &mut rest, compression)?;
                Message::CompilationResult(CompilationResultMessage {
                    object_files,
                    stdout,
                    stderr,
                    return_code,
                    compression,
                    dwarf_files,
                })
            }
        };
        Ok(message)
    }
}

/// Cut `files.len()` consecutive chunks off the front of `rest`.
/// Sizes were already validated against the payload length.
fn split_files(
    files: Vec<WireFile>,
    rest: &mut &[u8],
    compression: Compression,
) -> Result<Vec<ArtifactFile>> {
    files
        .into_iter()
        .map(|file| {
            let (chunk, tail) = rest.split_at(file.size as usize);
            *rest = tail;
            Ok(ArtifactFile {
                file_name: file.file_name,
                content: compression.decompress(chunk)?,
            })
        })
        .collect()
}

/// Compress each file and append its bytes to `payload`.
fn append_files(
    files: &[ArtifactFile],
    payload: &mut Vec<u8>,
    compression: Compression,
) -> Result<Vec<WireFile>> {
    files
        .iter()
        .map(|file| {
            let compressed = compression.compress(&file.content)?;
            payload.extend_from_slice(&compressed);
            Ok(WireFile {
                file_name: file.file_name.clone(),
                size: compressed.len() as u64,
            })
        })
        .collect()
}

impl Message {
    /// Try to parse one message from the front of `buf`.
    ///
    /// Returns the signed bytes-needed indicator described in the module
    /// docs, and the parsed message whenever one was completed.
    pub fn from_bytes(buf: &[u8]) -> Result<(i64, Option<Message>)> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(((LENGTH_PREFIX_SIZE - buf.len()) as i64, None));
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&buf[..LENGTH_PREFIX_SIZE]);
        let header_len = u32::from_be_bytes(prefix) as usize;
        if header_len > MAX_HEADER_SIZE {
            return Err(ProtoError::HeaderTooLarge {
                size: header_len,
                max: MAX_HEADER_SIZE,
            });
        }

        let header_end = LENGTH_PREFIX_SIZE + header_len;
        if buf.len() < header_end {
            return Ok(((header_end - buf.len()) as i64, None));
        }

        let header: WireHeader = serde_json::from_slice(&buf[LENGTH_PREFIX_SIZE..header_end])
            .map_err(ProtoError::MalformedHeader)?;

        let frame_end = header_end + header.payload_len()? as usize;
        if buf.len() < frame_end {
            return Ok(((frame_end - buf.len()) as i64, None));
        }

        let message = header.into_message(&buf[header_end..frame_end])?;
        let trailing = buf.len() - frame_end;
        Ok((-(trailing as i64), Some(message)))
    }

    /// Encode this message into a single frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();

        let header = match self {
            Message::Argument(message) => WireHeader::Argument(message.clone()),
            Message::DependencyRequest(message) => WireHeader::DependencyRequest(message.clone()),
            Message::ConnectionRefused(message) => WireHeader::ConnectionRefused(message.clone()),
            Message::DependencyReply(message) => {
                payload = message.compression.compress(&message.content)?;
                WireHeader::DependencyReply {
                    size: payload.len() as u64,
                    compression: message.compression,
                }
            }
            Message::CompilationResult(message) => WireHeader::CompilationResult {
                object_files: append_files(&message.object_files, &mut payload, message.compression)?,
                dwarf_files: append_files(&message.dwarf_files, &mut payload, message.compression)?,
                stdout: message.stdout.clone(),
                stderr: message.stderr.clone(),
                return_code: message.return_code,
                compression: message.compression,
            },
        };

        let header = serde_json::to_vec(&header).map_err(ProtoError::EncodeHeader)?;
        if header.len() > MAX_HEADER_SIZE {
            return Err(ProtoError::HeaderTooLarge {
                size: header.len(),
                max: MAX_HEADER_SIZE,
            });
        }

        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + header.len() + payload.len());
        frame.extend_from_slice(&(header.len() as u32).to_be_bytes());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }
}
