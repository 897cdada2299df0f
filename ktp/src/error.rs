//! Caller-visible error kinds.
//!
//! Only conditions the application can act on are surfaced here.  Protocol
//! anomalies (duplicates, unknown ACKs, simulated loss) are absorbed by the
//! engines and reported through logs and [`crate::connection::ConnectionStats`].

use std::io;

use thiserror::Error;

/// Errors returned by the socket facade.
#[derive(Debug, Error)]
pub enum KtpError {
    /// Handle out of range, or the slot is free.
    #[error("invalid KTP socket handle")]
    InvalidHandle,
    /// Every connection slot is in use.
    #[error("no free KTP socket slot")]
    NoCapacity,
    /// The underlying datagram channel could not be allocated or bound.
    #[error("datagram channel error: {0}")]
    Channel(#[from] io::Error),
    /// Send destination does not match the connection's bound remote endpoint.
    #[error("destination does not match the bound remote endpoint")]
    NotBound,
    /// Outbound queue is full; retry later.
    #[error("send buffer full")]
    NoSpace,
    /// Nothing buffered for the application; retry later.
    #[error("no message available")]
    NoMessage,
    /// `create` was asked for a socket type other than KTP.
    #[error("unsupported socket type {0:?}")]
    UnsupportedType(crate::stack::SocketType),
    /// The service was started with invalid constants.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Invalid protocol constants.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("message size must be non-zero")]
    MessageSize,
    #[error("window capacity {0} outside 1..=127")]
    WindowCapacity(usize),
    #[error("retransmission interval must be non-zero")]
    RetransmitInterval,
    #[error("loss probability {0} outside [0, 1]")]
    LossProbability(f64),
    #[error("connection table needs at least one slot")]
    MaxConnections,
}
