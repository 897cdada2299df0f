//! Inbound engine: the receive loop shared by every connection.
//!
//! One long-lived task waits for readiness on the channel of every bound
//! member of the readiness set.  For each ready channel it takes one
//! datagram, decodes it, gives the loss model a chance to discard it, and
//! applies it to the owning connection under the service lock, replying with
//! an ACK where the connection asks for one.
//!
//! ```text
//!   ┌──────── snapshot readiness set ◀──────────────┐
//!   │                                               │
//!   ▼                                               │
//!  select! ── channel readable ──▶ receive one ─────┤
//!         ├─ membership changed ────────────────────┤
//!         └─ sweep deadline (T) ──▶ window updates ─┘
//! ```
//!
//! The sweep emits the unsolicited ACK owed to a peer stalled by a no-space
//! signal once buffer space is back.  It runs when the wait times out, and is
//! also forced whenever a full `T` has passed without one, so a steady stream
//! of retransmissions from a stalled peer cannot starve it.

use std::future::poll_fn;
use std::sync::Arc;
use std::task::Poll;

use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::channel;
use crate::connection::Connection;
use crate::segment::Segment;
use crate::stack::{Shared, State};
use crate::table::SocketHandle;

type Member = (SocketHandle, Arc<UdpSocket>);

pub(crate) async fn run(shared: Arc<Shared>) {
    let interval = shared.config.retransmit_interval;
    let mut next_sweep = Instant::now() + interval;
    log::debug!("[ktp:in] engine running, sweep every {interval:?}");

    loop {
        // Register for membership changes before taking the snapshot so that
        // a bind racing with the snapshot still wakes us.
        let changed = shared.membership.notified();
        tokio::pin!(changed);
        changed.as_mut().enable();
        let members = shared.lock().table.readiness_snapshot();

        tokio::select! {
            ready = wait_readable(&members) => {
                for index in ready {
                    let (handle, udp) = &members[index];
                    receive_one(&shared, *handle, udp);
                }
            }
            () = &mut changed => {
                log::trace!("[ktp:in] readiness set changed");
            }
            () = tokio::time::sleep_until(next_sweep) => {}
        }

        if Instant::now() >= next_sweep {
            sweep(&shared);
            next_sweep = Instant::now() + interval;
        }
    }
}

/// Resolve with the indices of every member whose channel is readable.
/// Never resolves for an empty set.
async fn wait_readable(members: &[Member]) -> Vec<usize> {
    poll_fn(|cx| {
        let ready: Vec<usize> = members
            .iter()
            .enumerate()
            .filter_map(|(i, (_, udp))| match udp.poll_recv_ready(cx) {
                // Errors are reported by the receive that follows.
                Poll::Ready(_) => Some(i),
                Poll::Pending => None,
            })
            .collect();
        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(ready)
        }
    })
    .await
}

fn receive_one(shared: &Shared, handle: SocketHandle, udp: &Arc<UdpSocket>) {
    let (bytes, from) = match channel::try_receive(udp, shared.config.segment_len()) {
        Ok(Some(datagram)) => datagram,
        Ok(None) => return,
        Err(e) => {
            log::warn!("[ktp:in] {handle}: receive failed: {e}");
            return;
        }
    };

    let segment = match Segment::decode(&bytes) {
        Ok(segment) => segment,
        Err(e) => {
            log::debug!("[ktp:in] {handle}: discarding datagram from {from}: {e}");
            return;
        }
    };

    let mut state = shared.lock();
    let State { table, loss } = &mut *state;
    // The slot may have been closed or reused since the snapshot.
    let Some(conn) = table.get_if_socket(handle, udp) else {
        log::trace!("[ktp:in] {handle}: connection gone, datagram discarded");
        return;
    };
    if conn.remote() != Some(from) {
        log::debug!("[ktp:in] {handle}: ignoring datagram from foreign endpoint {from}");
        return;
    }

    if loss.should_drop(&segment) {
        conn.record_simulated_drop();
        log::debug!(
            "[ktp:in] {handle}: simulated loss of {} seq={}",
            kind(&segment),
            segment.header.seq
        );
        return;
    }

    if let Some(reply) = conn.on_segment(segment) {
        send_reply(handle, conn, &reply);
    }
}

fn sweep(shared: &Shared) {
    let mut state = shared.lock();
    for (handle, conn) in state.table.iter_mut() {
        if let Some(update) = conn.window_update() {
            log::info!(
                "[ktp:in] {handle}: buffer space back, → window update ack={} window={}",
                update.header.seq,
                update.header.window
            );
            send_reply(handle, conn, &update);
        }
    }
}

fn send_reply(handle: SocketHandle, conn: &mut Connection, reply: &Segment) {
    match conn.transmit(reply) {
        Ok(()) => log::trace!(
            "[ktp:in] {handle}: → ACK seq={} window={} no_space={}",
            reply.header.seq,
            reply.header.window,
            reply.header.no_space
        ),
        Err(e) => log::warn!("[ktp:in] {handle}: ACK seq={} failed: {e}", reply.header.seq),
    }
}

fn kind(segment: &Segment) -> &'static str {
    if segment.header.ack {
        "ACK"
    } else {
        "DATA"
    }
}
