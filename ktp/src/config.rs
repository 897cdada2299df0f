//! Process-wide protocol constants.
//!
//! A [`KtpConfig`] is fixed when the service starts ([`crate::stack::KtpStack::start`])
//! and never changes afterwards.  The defaults reproduce the classic KTP
//! parameters: 512-byte messages, a window of 10, `T` = 5 s, `P` = 0.05 and
//! room for 100 concurrent connections.

use std::time::Duration;

use crate::error::ConfigError;

/// Largest window the 8-bit sequence space supports.
///
/// The receiver compares sequence numbers in modulo-256 half space, so every
/// offset inside its window must stay below 128.  The sender additionally
/// keeps its in-flight span under 128 (see [`crate::window::SendWindow::can_send`]),
/// which selective ACKs could otherwise stretch to `2 * capacity - 1`.
pub const MAX_WINDOW_CAPACITY: usize = 127;

/// Protocol constants shared by every connection of one service instance.
#[derive(Debug, Clone, PartialEq)]
pub struct KtpConfig {
    /// Payload bytes carried by every segment.
    pub message_size: usize,
    /// Send-window size and depth of both per-connection queues.
    pub window_capacity: usize,
    /// Retransmission interval `T`.
    pub retransmit_interval: Duration,
    /// Probability `P` that the inbound path discards a received segment.
    pub loss_probability: f64,
    /// Maximum number of concurrent connections `N`.
    pub max_connections: usize,
    /// Seed for the loss simulator; `None` seeds from the OS.
    pub loss_seed: Option<u64>,
}

impl Default for KtpConfig {
    fn default() -> Self {
        Self {
            message_size: 512,
            window_capacity: 10,
            retransmit_interval: Duration::from_secs(5),
            loss_probability: 0.05,
            max_connections: 100,
            loss_seed: None,
        }
    }
}

impl KtpConfig {
    /// Reject constants the protocol cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.message_size == 0 {
            return Err(ConfigError::MessageSize);
        }
        if self.window_capacity == 0 || self.window_capacity > MAX_WINDOW_CAPACITY {
            return Err(ConfigError::WindowCapacity(self.window_capacity));
        }
        if self.retransmit_interval.is_zero() {
            return Err(ConfigError::RetransmitInterval);
        }
        if !(0.0..=1.0).contains(&self.loss_probability) {
            return Err(ConfigError::LossProbability(self.loss_probability));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::MaxConnections);
        }
        Ok(())
    }

    /// Period of the outbound engine (`T/2`).
    pub fn sender_tick(&self) -> Duration {
        self.retransmit_interval / 2
    }

    /// Size of every encoded segment on the wire.
    pub fn segment_len(&self) -> usize {
        crate::segment::HEADER_LEN + self.message_size
    }
}
