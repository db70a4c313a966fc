//! The refusal / close handshake.
//!
//! 1. send `ConnectionRefused` with the reason
//! 2. half-close our write side
//! 3. read until the peer closes its side (or errors, or the drain times out)
//! 4. drop the socket
//!
//! Closing right after step 1 can reset the connection before the peer has
//! read the refusal.

use std::time::Duration;

use kiln_proto::{ConnectionRefusedMessage, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::Result;

/// How long we wait for the peer to close after our half-close
pub const REFUSAL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Refuse the connection with `reason`. The caller drops the socket
/// afterwards; nothing else may be written to it.
pub async fn refuse(stream: &mut TcpStream, reason: &str) -> Result<()> {
    let result = send_refusal(stream, reason).await;
    drain(stream).await;
    result
}

async fn send_refusal(stream: &mut TcpStream, reason: &str) -> Result<()> {
    let frame = Message::from(ConnectionRefusedMessage::new(reason)).to_bytes()?;
    stream.write_all(&frame).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn drain(stream: &mut TcpStream) {
    let mut buf = [0u8; 4096];
    let wait_for_eof = async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!(error = %e, "error while waiting for peer to close");
                    break;
                }
            }
        }
    };

    if tokio::time::timeout(REFUSAL_DRAIN_TIMEOUT, wait_for_eof)
        .await
        .is_err()
    {
        debug!("peer did not close after refusal");
    }
}
