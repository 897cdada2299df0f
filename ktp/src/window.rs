//! Sliding-window state for one connection.
//!
//! [`SendWindow`] holds the segments transmitted but not yet acknowledged.
//! Unlike Go-Back-N, KTP acknowledges every segment individually: an ACK
//! removes exactly the entry carrying its sequence number, and each entry
//! carries its own retransmission timestamp.
//!
//! [`ReceiveWindow`] holds what the peer sent us: the in-order messages
//! waiting for the application, plus any segments that arrived ahead of a
//! gap.  It decides duplicates and computes the credit advertised in ACKs.
//!
//! Sequence numbers are 8-bit and wrap modulo 256.  The receiver compares
//! them in half-space: an offset of 128 or more from the expected sequence
//! number is "behind" it.  Because ACKs are selective, a sender limited only
//! by its window could run up to `2 * capacity - 1` numbers past a lost
//! segment, so [`SendWindow::can_send`] also keeps every in-flight sequence
//! number within 128 of the oldest one.  Together with
//! [`crate::config::MAX_WINDOW_CAPACITY`] that keeps the comparison
//! unambiguous.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::queue::BoundedQueue;

/// Offsets at or beyond this value lie behind the expected sequence number.
const SEQ_HALF: usize = 128;

// ---------------------------------------------------------------------------
// SendWindow
// ---------------------------------------------------------------------------

/// A single in-flight segment occupying one slot of the send window.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub seq: u8,
    /// Payload exactly as first transmitted; retransmissions reuse it verbatim.
    pub payload: Vec<u8>,
    /// Time of the most recent transmission.
    pub sent_at: Instant,
    /// Total number of times this segment has been transmitted.
    pub tx_count: u32,
}

/// Send-side window for one connection, ordered oldest first.
#[derive(Debug)]
pub struct SendWindow {
    entries: VecDeque<InFlight>,
    capacity: usize,
}

impl SendWindow {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "window capacity must be at least 1");
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// `true` when there is room for at least one more in-flight segment.
    pub fn has_room(&self) -> bool {
        self.entries.len() < self.capacity
    }

    /// `true` when `seq` may be transmitted next: the window has room and
    /// `seq` stays less than half the sequence space ahead of the oldest
    /// unacknowledged segment.
    pub fn can_send(&self, seq: u8) -> bool {
        self.has_room()
            && match self.entries.front() {
                Some(oldest) => usize::from(seq.wrapping_sub(oldest.seq)) < SEQ_HALF,
                None => true,
            }
    }

    /// Number of segments currently awaiting acknowledgement.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Place a just-transmitted segment into the window.
    ///
    /// # Panics
    ///
    /// Panics in debug mode if the window is already full.  Check
    /// [`has_room`](Self::has_room) before calling.
    pub fn record_sent(&mut self, seq: u8, payload: Vec<u8>, now: Instant) {
        debug_assert!(
            self.has_room(),
            "record_sent called on a full send window ({} / {})",
            self.entries.len(),
            self.capacity
        );
        debug_assert!(
            !self.contains(seq),
            "sequence number {seq} already in flight"
        );
        self.entries.push_back(InFlight {
            seq,
            payload,
            sent_at: now,
            tx_count: 1,
        });
    }

    pub fn contains(&self, seq: u8) -> bool {
        self.entries.iter().any(|e| e.seq == seq)
    }

    /// Remove the entry for `seq`, keeping the remaining entries in order.
    ///
    /// Returns `None` for an ACK of a sequence number not in flight (already
    /// acknowledged, or never sent by this connection).
    pub fn acknowledge(&mut self, seq: u8) -> Option<InFlight> {
        let index = self.entries.iter().position(|e| e.seq == seq)?;
        self.entries.remove(index)
    }

    /// Entries whose last transmission is at least `rto` old.
    ///
    /// Each returned entry is stamped as re-sent at `now`; the caller must
    /// put every one of them back on the wire.
    pub fn take_expired(&mut self, now: Instant, rto: Duration) -> Vec<(u8, Vec<u8>)> {
        self.entries
            .iter_mut()
            .filter(|e| now.saturating_duration_since(e.sent_at) >= rto)
            .map(|e| {
                e.sent_at = now;
                e.tx_count += 1;
                (e.seq, e.payload.clone())
            })
            .collect()
    }

    /// Iterate over all in-flight segments from oldest to newest.
    pub fn entries(&self) -> impl Iterator<Item = &InFlight> {
        self.entries.iter()
    }
}

// ---------------------------------------------------------------------------
// ReceiveWindow
// ---------------------------------------------------------------------------

/// What happened to an inbound data segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// In-order segment appended to the inbound queue, releasing
    /// `delivered` messages in total (itself plus any held successors).
    Delivered { delivered: usize },
    /// Ahead of a gap; held until the missing segment arrives.
    Held,
    /// Already buffered, held, or consumed.
    Duplicate,
    /// In-order segment arrived with no buffer space left.
    NoSpace,
    /// Ahead of a gap but only the reserved slot is left; dropped.
    Deferred,
    /// Further ahead than the window allows; dropped.
    OutOfWindow,
}

/// Receive-side state for one connection.
///
/// # Sequence-number layout
///
/// ```text
///   last_delivered  expected
///          │           │
///  ────────┼───────────┼──────────────────────▶ seq space
///  consumed / queued   │ <── held (gaps) ──▶│
///                      │ <──── capacity ───▶│
/// ```
#[derive(Debug)]
pub struct ReceiveWindow {
    /// In-order messages waiting for the application.
    inbound: BoundedQueue<Vec<u8>>,
    /// Out-of-order segments; index `i` holds sequence `expected + i`.
    held: VecDeque<Option<Vec<u8>>>,
    held_count: usize,
    /// Next in-order sequence number.
    expected: u8,
    /// Most recent sequence number appended to the inbound queue.
    last_delivered: u8,
    /// The peer was told there is no space; a follow-up ACK is owed once
    /// space frees.
    no_space_pending: bool,
}

impl ReceiveWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            inbound: BoundedQueue::new(capacity),
            held: VecDeque::new(),
            held_count: 0,
            expected: 0,
            last_delivered: 0,
            no_space_pending: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.inbound.capacity()
    }

    /// Messages buffered for the application.
    pub fn queued(&self) -> usize {
        self.inbound.len()
    }

    /// Out-of-order segments waiting for a gap to fill.
    pub fn held(&self) -> usize {
        self.held_count
    }

    /// Additional data segments this side is willing to buffer.
    pub fn credit(&self) -> u8 {
        // capacity <= MAX_WINDOW_CAPACITY, so this always fits.
        (self.capacity() - self.occupancy()) as u8
    }

    /// Credit to put in an ACK.  Advertising zero stalls the peer, so it
    /// also records the debt of a later window update.
    pub fn advertise(&mut self) -> u8 {
        let credit = self.credit();
        if credit == 0 {
            self.no_space_pending = true;
        }
        credit
    }

    pub fn last_delivered(&self) -> u8 {
        self.last_delivered
    }

    pub fn no_space_pending(&self) -> bool {
        self.no_space_pending
    }

    fn occupancy(&self) -> usize {
        self.inbound.len() + self.held_count
    }

    /// Classify and store an inbound data segment.
    pub fn on_segment(&mut self, seq: u8, payload: Vec<u8>) -> Arrival {
        let offset = usize::from(seq.wrapping_sub(self.expected));
        if offset >= SEQ_HALF {
            return Arrival::Duplicate;
        }
        if offset >= self.capacity() {
            return Arrival::OutOfWindow;
        }

        if offset > 0 {
            if matches!(self.held.get(offset), Some(Some(_))) {
                return Arrival::Duplicate;
            }
            // The last free slot stays reserved for the in-order segment.
            if self.occupancy() + 1 >= self.capacity() {
                return Arrival::Deferred;
            }
            if self.held.len() <= offset {
                self.held.resize(offset + 1, None);
            }
            self.held[offset] = Some(payload);
            self.held_count += 1;
            return Arrival::Held;
        }

        if self.occupancy() >= self.capacity() {
            self.no_space_pending = true;
            return Arrival::NoSpace;
        }

        self.held.pop_front();
        self.append_in_order(payload);
        let mut delivered = 1;
        while let Some(Some(_)) = self.held.front() {
            if let Some(Some(next)) = self.held.pop_front() {
                self.held_count -= 1;
                self.append_in_order(next);
                delivered += 1;
            }
        }
        Arrival::Delivered { delivered }
    }

    fn append_in_order(&mut self, payload: Vec<u8>) {
        let pushed = self.inbound.push(payload);
        debug_assert!(pushed.is_ok(), "occupancy check admitted a message into a full queue");
        self.last_delivered = self.expected;
        self.expected = self.expected.wrapping_add(1);
    }

    /// Hand the oldest buffered message to the application.
    pub fn read(&mut self) -> Option<Vec<u8>> {
        self.inbound.pop()
    }

    /// Clear the pending no-space debt if space has freed up.
    ///
    /// Returns `true` when the caller must now send the owed ACK.
    pub fn take_window_update(&mut self) -> bool {
        if self.no_space_pending && self.credit() > 0 {
            self.no_space_pending = false;
            return true;
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
