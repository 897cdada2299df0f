//! File transfer over a bound KTP connection.
//!
//! Every KTP message has the same fixed size, so a file is cut into chunks of
//! at most `message_size - 2` bytes and each chunk is framed with a 2-byte
//! big-endian length:
//!
//! ```text
//!  0       2                              message_size
//!  ┌───────┬───────────────┬─────────────────┐
//!  │ len   │ chunk (len B) │ zero padding    │
//!  └───────┴───────────────┴─────────────────┘
//! ```
//!
//! A frame with `len == 0` ends the transfer.  These helpers only use the
//! public facade, exactly like any other client of the service.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::KtpError;
use crate::retry::{recv_with_retry, send_with_retry, RetryPolicy};
use crate::stack::KtpStack;
use crate::table::SocketHandle;

/// Bytes taken by the length prefix of every frame.
pub const FRAME_HEADER_LEN: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Ktp(#[from] KtpError),

    #[error("file I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("message size {0} leaves no room for file data")]
    MessageTooSmall(usize),

    #[error("frame announces {len} bytes but only {capacity} fit in a message")]
    BadFrame { len: usize, capacity: usize },

    #[error("{in_flight} segments still unacknowledged when the transfer gave up")]
    Undelivered { in_flight: usize },
}

/// Totals for one completed transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes: u64,
    /// Data messages, the end-of-transfer marker excluded.
    pub messages: u64,
}

/// Largest chunk carried by one message.
pub fn chunk_capacity(message_size: usize) -> Result<usize, TransferError> {
    match message_size.checked_sub(FRAME_HEADER_LEN) {
        Some(capacity) if capacity > 0 && capacity <= u16::MAX as usize => Ok(capacity),
        _ => Err(TransferError::MessageTooSmall(message_size)),
    }
}

fn frame(chunk: &[u8], message_size: usize) -> Vec<u8> {
    let mut message = vec![0u8; message_size];
    // chunk.len() <= chunk_capacity(), which fits in a u16
    message[..FRAME_HEADER_LEN].copy_from_slice(&(chunk.len() as u16).to_be_bytes());
    message[FRAME_HEADER_LEN..FRAME_HEADER_LEN + chunk.len()].copy_from_slice(chunk);
    message
}

fn unframe(message: &[u8]) -> Result<&[u8], TransferError> {
    let capacity = message.len().saturating_sub(FRAME_HEADER_LEN);
    if message.len() < FRAME_HEADER_LEN {
        return Err(TransferError::BadFrame { len: 0, capacity });
    }
    let len = u16::from_be_bytes([message[0], message[1]]) as usize;
    if len > capacity {
        return Err(TransferError::BadFrame { len, capacity });
    }
    Ok(&message[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len])
}

/// Stream `reader` to `dest`, then wait until the peer has acknowledged
/// every message.
pub async fn send_file<R>(
    stack: &KtpStack,
    handle: SocketHandle,
    dest: SocketAddr,
    reader: &mut R,
    policy: &RetryPolicy,
) -> Result<TransferReport, TransferError>
where
    R: AsyncRead + Unpin,
{
    let message_size = stack.config().message_size;
    let mut chunk = vec![0u8; chunk_capacity(message_size)?];
    let mut report = TransferReport::default();

    loop {
        let n = reader.read(&mut chunk).await?;
        send_with_retry(stack, handle, &frame(&chunk[..n], message_size), dest, policy).await?;
        if n == 0 {
            break;
        }
        report.bytes += n as u64;
        report.messages += 1;
        log::debug!("[ktp] {handle}: queued message {} ({n} bytes)", report.messages);
    }

    wait_drained(stack, handle, policy).await?;
    log::info!(
        "[ktp] {handle}: sent {} bytes in {} messages",
        report.bytes,
        report.messages
    );
    Ok(report)
}

/// Write every chunk received on `handle` to `writer` until the
/// end-of-transfer marker arrives.
pub async fn receive_file<W>(
    stack: &KtpStack,
    handle: SocketHandle,
    writer: &mut W,
    policy: &RetryPolicy,
) -> Result<TransferReport, TransferError>
where
    W: AsyncWrite + Unpin,
{
    let mut message = vec![0u8; stack.config().message_size];
    let mut report = TransferReport::default();

    loop {
        let (n, _) = recv_with_retry(stack, handle, &mut message, policy).await?;
        let chunk = unframe(&message[..n])?;
        if chunk.is_empty() {
            break;
        }
        writer.write_all(chunk).await?;
        report.bytes += chunk.len() as u64;
        report.messages += 1;
    }

    writer.flush().await?;
    log::info!(
        "[ktp] {handle}: received {} bytes in {} messages",
        report.bytes,
        report.messages
    );
    Ok(report)
}

/// Poll until nothing is queued or in flight on `handle`.
async fn wait_drained(
    stack: &KtpStack,
    handle: SocketHandle,
    policy: &RetryPolicy,
) -> Result<(), TransferError> {
    let attempts = policy.attempts.max(1);
    let mut in_flight = 0;
    for attempt in 0..attempts {
        let status = stack.status(handle)?;
        in_flight = status.in_flight + status.queued_outbound;
        if in_flight == 0 {
            return Ok(());
        }
        tokio::time::sleep(policy.backoff(attempt)).await;
    }
    Err(TransferError::Undelivered { in_flight })
}
