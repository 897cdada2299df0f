//! Wire-format definitions for KTP segments.
//!
//! Every datagram exchanged between peers is a [`Segment`]: a fixed 4-byte
//! header followed by a payload region of exactly `message_size` bytes.
//! This module only transforms bytes; no I/O happens here.
//!
//! # Wire format
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Sequence   |    Window     |      ACK      |   No-space    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Payload (message_size bytes) ...              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! There is no length field: the payload is always padded (or truncated) to
//! the configured message size, and applications that send shorter logical
//! messages frame them themselves.

use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 4;

const OFF_SEQ: usize = 0;
const OFF_WINDOW: usize = 1;
const OFF_ACK: usize = 2;
const OFF_NO_SPACE: usize = 3;

/// Fixed-size segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sequence number (modulo 256).  On an ACK, the sequence being acknowledged.
    pub seq: u8,
    /// Receive credit advertised by the sender of this segment.
    pub window: u8,
    /// `true` for acknowledgments, `false` for data.
    pub ack: bool,
    /// Receiver ran out of buffer space and owes a follow-up ACK.
    pub no_space: bool,
}

/// A complete KTP datagram: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Segment {
    /// Data segment carrying `payload` under sequence number `seq`.
    pub fn data(seq: u8, window: u8, payload: Vec<u8>) -> Self {
        Self {
            header: Header {
                seq,
                window,
                ack: false,
                no_space: false,
            },
            payload,
        }
    }

    /// Acknowledgment of `seq` advertising `window` credit.
    pub fn ack(seq: u8, window: u8, no_space: bool) -> Self {
        Self {
            header: Header {
                seq,
                window,
                ack: true,
                no_space,
            },
            payload: Vec::new(),
        }
    }

    /// Serialise into a buffer of exactly `HEADER_LEN + message_size` bytes.
    ///
    /// Payloads shorter than `message_size` are zero-padded; longer ones are
    /// truncated (the facade never hands the codec an oversized payload).
    pub fn encode(&self, message_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + message_size];
        buf[OFF_SEQ] = self.header.seq;
        buf[OFF_WINDOW] = self.header.window;
        buf[OFF_ACK] = u8::from(self.header.ack);
        buf[OFF_NO_SPACE] = u8::from(self.header.no_space);

        let n = self.payload.len().min(message_size);
        buf[HEADER_LEN..HEADER_LEN + n].copy_from_slice(&self.payload[..n]);
        buf
    }

    /// Parse a [`Segment`] from a raw datagram.
    ///
    /// Payload bytes are never inspected; everything after the header is
    /// returned as-is.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::BufferTooShort(buf.len()));
        }

        Ok(Segment {
            header: Header {
                seq: buf[OFF_SEQ],
                window: buf[OFF_WINDOW],
                ack: decode_flag(buf, OFF_ACK)?,
                no_space: decode_flag(buf, OFF_NO_SPACE)?,
            },
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

fn decode_flag(buf: &[u8], offset: usize) -> Result<bool, WireError> {
    match buf[offset] {
        0 => Ok(false),
        1 => Ok(true),
        value => Err(WireError::InvalidFlag { offset, value }),
    }
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("datagram of {0} bytes is shorter than the {HEADER_LEN}-byte header")]
    BufferTooShort(usize),
    #[error("flag byte at offset {offset} holds {value}, expected 0 or 1")]
    InvalidFlag { offset: usize, value: u8 },
}
