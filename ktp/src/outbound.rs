//! Outbound engine: retransmission and admission on a fixed tick.
//!
//! Every `T/2` the engine locks the service state and, for each connection,
//! re-sends the in-flight segments whose last transmission is at least `T`
//! old, then admits queued messages while both the send window and the
//! peer's advertised credit allow.  Send failures are logged and left to the
//! next retransmission.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;

use crate::stack::Shared;

pub(crate) async fn run(shared: Arc<Shared>) {
    let rto = shared.config.retransmit_interval;
    let mut ticker = tokio::time::interval(shared.config.sender_tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    log::debug!("[ktp:out] engine running, tick every {:?}", shared.config.sender_tick());

    loop {
        ticker.tick().await;
        tick(&shared, Instant::now(), rto);
    }
}

fn tick(shared: &Shared, now: Instant, rto: Duration) {
    let mut state = shared.lock();
    for (handle, conn) in state.table.iter_mut() {
        for segment in conn.poll_transmit(now, rto) {
            match conn.transmit(&segment) {
                Ok(()) => log::debug!(
                    "[ktp:out] {handle}: → DATA seq={} in_flight={}",
                    segment.header.seq,
                    conn.status().in_flight
                ),
                Err(e) => log::warn!(
                    "[ktp:out] {handle}: DATA seq={} not sent: {e}",
                    segment.header.seq
                ),
            }
        }
    }
}
