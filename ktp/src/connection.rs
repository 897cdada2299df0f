//! Per-connection protocol state.
//!
//! A [`Connection`] is one occupied slot of the connection table.  It owns the
//! datagram [`Channel`], the fixed endpoint pair, both message queues and the
//! sliding-window state.  Its responsibilities are:
//! - Accepting application messages ([`enqueue`](Connection::enqueue)) and
//!   handing delivered ones back ([`dequeue`](Connection::dequeue)).
//! - Applying inbound segments and producing the ACK to send in reply
//!   ([`on_segment`](Connection::on_segment)).
//! - Producing retransmissions and newly admitted data on each outbound tick
//!   ([`poll_transmit`](Connection::poll_transmit)).
//! - Producing the unsolicited window update owed after a no-space signal
//!   ([`window_update`](Connection::window_update)).
//!
//! Apart from [`transmit`](Connection::transmit), nothing here touches the
//! network; the engines decide when to call what.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;

use crate::channel::Channel;
use crate::config::KtpConfig;
use crate::error::KtpError;
use crate::queue::BoundedQueue;
use crate::segment::Segment;
use crate::window::{Arrival, ReceiveWindow, SendWindow};

/// Identity of the process (or other client) that owns a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u32);

impl OwnerId {
    /// The calling OS process.
    pub fn current() -> Self {
        Self(std::process::id())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// Diagnostic counters; protocol anomalies are visible only here and in logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Data segments transmitted for the first time.
    pub segments_sent: u64,
    pub retransmissions: u64,
    pub acks_received: u64,
    /// ACKs naming a sequence number that was not in flight.
    pub unknown_acks: u64,
    /// Messages appended to the inbound queue.
    pub delivered: u64,
    pub duplicates: u64,
    pub simulated_drops: u64,
    pub no_space_signals: u64,
    pub window_updates: u64,
    /// Segments admitted despite zero peer credit to probe a stalled peer.
    pub window_probes: u64,
    pub transmit_failures: u64,
}

impl ConnectionStats {
    /// Average number of transmissions per data segment sent so far.
    pub fn transmissions_per_message(&self) -> Option<f64> {
        if self.segments_sent == 0 {
            return None;
        }
        Some((self.segments_sent + self.retransmissions) as f64 / self.segments_sent as f64)
    }
}

/// Point-in-time view of a connection's queues and windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub owner: OwnerId,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub in_flight: usize,
    pub queued_outbound: usize,
    pub queued_inbound: usize,
    /// Out-of-order segments waiting for a gap to fill.
    pub held: usize,
    pub receive_credit: u8,
    /// Credit last advertised by the peer, minus segments admitted since.
    pub peer_credit: u8,
    pub peer_no_space: bool,
    pub no_space_pending: bool,
    pub next_send_seq: u8,
}

/// State of one live KTP connection.
#[derive(Debug)]
pub struct Connection {
    owner: OwnerId,
    channel: Channel,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    message_size: usize,

    /// Application messages not yet admitted to the send window.
    outbound: BoundedQueue<Vec<u8>>,
    send_window: SendWindow,
    receiver: ReceiveWindow,

    next_send_seq: u8,
    peer_credit: u8,
    peer_no_space: bool,
    /// Since when the peer's credit has blocked queued data with nothing in
    /// flight.
    stalled_since: Option<Instant>,

    stats: ConnectionStats,
}

impl Connection {
    /// Fresh connection state around an unbound channel.
    pub fn new(owner: OwnerId, channel: Channel, config: &KtpConfig) -> Self {
        let capacity = config.window_capacity;
        Self {
            owner,
            channel,
            local: None,
            remote: None,
            message_size: config.message_size,
            outbound: BoundedQueue::new(capacity),
            send_window: SendWindow::new(capacity),
            receiver: ReceiveWindow::new(capacity),
            next_send_seq: 0,
            // capacity <= MAX_WINDOW_CAPACITY
            peer_credit: capacity as u8,
            peer_no_space: false,
            stalled_since: None,
            stats: ConnectionStats::default(),
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            owner: self.owner,
            local: self.local,
            remote: self.remote,
            in_flight: self.send_window.len(),
            queued_outbound: self.outbound.len(),
            queued_inbound: self.receiver.queued(),
            held: self.receiver.held(),
            receive_credit: self.receiver.credit(),
            peer_credit: self.peer_credit,
            peer_no_space: self.peer_no_space,
            no_space_pending: self.receiver.no_space_pending(),
            next_send_seq: self.next_send_seq,
        }
    }

    /// Fix the endpoint pair and bind the channel to `local`.
    ///
    /// Returns the address actually bound.
    pub fn bind(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        runtime: &Handle,
    ) -> io::Result<SocketAddr> {
        let bound = self.channel.bind(local, runtime)?;
        self.local = Some(bound);
        self.remote = Some(remote);
        Ok(bound)
    }

    // -----------------------------------------------------------------------
    // Application side
    // -----------------------------------------------------------------------

    /// Queue `message` for transmission to `dest`.
    ///
    /// The message is truncated or zero-padded to the fixed message size.
    /// Returns the number of logical bytes accepted.
    pub fn enqueue(&mut self, message: &[u8], dest: SocketAddr) -> Result<usize, KtpError> {
        if self.remote != Some(dest) {
            return Err(KtpError::NotBound);
        }
        if self.outbound.is_full() {
            return Err(KtpError::NoSpace);
        }

        let accepted = message.len().min(self.message_size);
        let mut payload = vec![0u8; self.message_size];
        payload[..accepted].copy_from_slice(&message[..accepted]);
        self.outbound
            .push(payload)
            .map_err(|_| KtpError::NoSpace)?;
        Ok(accepted)
    }

    /// Copy the oldest delivered message into `buf`.
    ///
    /// Returns the copied length and the remote endpoint it came from.
    pub fn dequeue(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr), KtpError> {
        if self.receiver.queued() == 0 {
            return Err(KtpError::NoMessage);
        }
        let remote = self.remote.ok_or(KtpError::NotBound)?;
        let message = self.receiver.read().ok_or(KtpError::NoMessage)?;

        let n = buf.len().min(message.len());
        buf[..n].copy_from_slice(&message[..n]);
        Ok((n, remote))
    }

    // -----------------------------------------------------------------------
    // Inbound side
    // -----------------------------------------------------------------------

    /// Apply one received segment and return the ACK to send back, if any.
    pub fn on_segment(&mut self, segment: Segment) -> Option<Segment> {
        let h = segment.header;

        if h.ack {
            self.stats.acks_received += 1;
            match self.send_window.acknowledge(h.seq) {
                Some(entry) => log::debug!(
                    "[ktp:in] ← ACK seq={} window={} in_flight={} tx={}",
                    h.seq,
                    h.window,
                    self.send_window.len(),
                    entry.tx_count
                ),
                None => {
                    self.stats.unknown_acks += 1;
                    log::debug!("[ktp:in] ← ACK for unknown seq={}", h.seq);
                }
            }
            self.peer_credit = h.window;
            self.peer_no_space = h.no_space;
            return None;
        }

        let mut payload = segment.payload;
        payload.resize(self.message_size, 0);

        match self.receiver.on_segment(h.seq, payload) {
            Arrival::Delivered { delivered } => {
                self.stats.delivered += delivered as u64;
                log::debug!(
                    "[ktp:in] ← DATA seq={} delivered={} queued={}",
                    h.seq,
                    delivered,
                    self.receiver.queued()
                );
                Some(Segment::ack(h.seq, self.receiver.advertise(), false))
            }
            Arrival::Held => {
                log::debug!("[ktp:in] ← DATA seq={} held out of order", h.seq);
                Some(Segment::ack(h.seq, self.receiver.advertise(), false))
            }
            Arrival::Duplicate => {
                self.stats.duplicates += 1;
                log::debug!("[ktp:in] ← DATA seq={} duplicate, re-ACK", h.seq);
                Some(Segment::ack(h.seq, self.receiver.advertise(), false))
            }
            Arrival::NoSpace => {
                self.stats.no_space_signals += 1;
                log::info!(
                    "[ktp:in] ← DATA seq={} no buffer space; → NOSPACE ack={}",
                    h.seq,
                    self.receiver.last_delivered()
                );
                Some(Segment::ack(self.receiver.last_delivered(), 0, true))
            }
            Arrival::Deferred | Arrival::OutOfWindow => {
                log::debug!("[ktp:in] ← DATA seq={} outside usable window, dropped", h.seq);
                None
            }
        }
    }

    /// The unsolicited ACK owed to a peer stalled by a no-space signal, once
    /// buffer space is available again.
    pub fn window_update(&mut self) -> Option<Segment> {
        if !self.receiver.take_window_update() {
            return None;
        }
        self.stats.window_updates += 1;
        Some(Segment::ack(
            self.receiver.last_delivered(),
            self.receiver.credit(),
            false,
        ))
    }

    pub fn record_simulated_drop(&mut self) {
        self.stats.simulated_drops += 1;
    }

    // -----------------------------------------------------------------------
    // Outbound side
    // -----------------------------------------------------------------------

    /// Segments to put on the wire this tick, retransmissions first.
    ///
    /// Every send-window entry last sent at least `rto` ago is re-sent
    /// verbatim.  Then queued messages are admitted while the window has room
    /// and the peer's advertised credit lasts; each admission consumes one
    /// unit of that credit until the next ACK refreshes it.  Admission also
    /// pauses while the next sequence number would be half the sequence
    /// space ahead of the oldest unacknowledged segment, so the peer can never
    /// mistake new data for a duplicate.
    ///
    /// A peer that advertised zero credit owes us a window update.  If that
    /// update is lost the connection would stall forever, so once data has
    /// been blocked for `rto` with nothing in flight, one segment is admitted
    /// regardless as a probe.
    pub fn poll_transmit(&mut self, now: Instant, rto: Duration) -> Vec<Segment> {
        if self.remote.is_none() {
            return Vec::new();
        }

        let credit = self.receiver.credit();
        let mut out: Vec<Segment> = self
            .send_window
            .take_expired(now, rto)
            .into_iter()
            .map(|(seq, payload)| Segment::data(seq, credit, payload))
            .collect();
        self.stats.retransmissions += out.len() as u64;

        while self.send_window.has_room() && self.peer_credit > 0 {
            let Some(segment) = self.admit(now, credit) else {
                break;
            };
            self.peer_credit -= 1;
            out.push(segment);
        }

        if self.peer_credit > 0 || !self.send_window.is_empty() || self.outbound.is_empty() {
            self.stalled_since = None;
        } else {
            let since = *self.stalled_since.get_or_insert(now);
            if now.duration_since(since) >= rto {
                if let Some(probe) = self.admit(now, credit) {
                    self.stats.window_probes += 1;
                    log::debug!("[ktp:out] zero window for {rto:?}, probing with seq={}", probe.header.seq);
                    out.push(probe);
                }
                self.stalled_since = None;
            }
        }
        out
    }

    /// Move the oldest queued message into the send window.
    fn admit(&mut self, now: Instant, credit: u8) -> Option<Segment> {
        let seq = self.next_send_seq;
        if !self.send_window.can_send(seq) {
            return None;
        }
        let payload = self.outbound.pop()?;
        self.send_window.record_sent(seq, payload.clone(), now);
        self.next_send_seq = seq.wrapping_add(1);
        self.stats.segments_sent += 1;
        Some(Segment::data(seq, credit, payload))
    }

    /// Send `segment` to the remote endpoint without blocking.
    ///
    /// Failures are counted; the retransmission machinery recovers from them.
    pub fn transmit(&mut self, segment: &Segment) -> io::Result<()> {
        let result = match self.remote {
            Some(remote) => self.channel.transmit(segment, remote, self.message_size),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection has no remote endpoint",
            )),
        };
        if result.is_err() {
            self.stats.transmit_failures += 1;
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
