//! Datagram channel underlying one KTP connection.
//!
//! A [`Channel`] is allocated unbound when the connection is created (so that
//! descriptor exhaustion surfaces at `create`, as with a BSD `socket()` call)
//! and becomes a `tokio::net::UdpSocket` once bound.  All I/O here is
//! non-blocking so it can run while the connection table lock is held.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;

use crate::segment::Segment;

#[derive(Debug)]
enum State {
    Open(Socket),
    Bound(Arc<UdpSocket>),
    /// Registration with the reactor failed after the OS bind; the
    /// descriptor is gone and only closing the connection remains.
    Failed { kind: io::ErrorKind, reason: String },
}

/// An unreliable, unordered datagram endpoint.
#[derive(Debug)]
pub struct Channel {
    state: State,
}

impl Channel {
    /// Allocate an unbound UDP socket in `domain`.
    pub fn open(domain: Domain, protocol: Option<Protocol>) -> io::Result<Self> {
        let socket = Socket::new(domain, Type::DGRAM, protocol.or(Some(Protocol::UDP)))?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            state: State::Open(socket),
        })
    }

    /// Bind to `local` and register the socket with the reactor of `runtime`.
    ///
    /// Returns the address actually bound (port 0 resolves to an ephemeral
    /// port).  A channel can be bound only once.  A failed OS bind leaves it
    /// open for another attempt; a failed reactor registration leaves it
    /// unusable, and later attempts report that original failure.
    pub fn bind(&mut self, local: SocketAddr, runtime: &Handle) -> io::Result<SocketAddr> {
        let socket = match &self.state {
            State::Open(socket) => socket,
            State::Bound(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "channel can only be bound once",
                ))
            }
            State::Failed { kind, reason } => {
                return Err(io::Error::new(
                    *kind,
                    format!("channel unusable after failed bind: {reason}"),
                ))
            }
        };
        socket.bind(&local.into())?;

        let placeholder = State::Failed {
            kind: io::ErrorKind::Other,
            reason: String::from("bind interrupted"),
        };
        let State::Open(socket) = std::mem::replace(&mut self.state, placeholder) else {
            return Err(io::Error::other("channel state changed during bind"));
        };

        let _guard = runtime.enter();
        let registered = UdpSocket::from_std(socket.into())
            .and_then(|udp| Ok((udp.local_addr()?, udp)));
        match registered {
            Ok((bound, udp)) => {
                self.state = State::Bound(Arc::new(udp));
                Ok(bound)
            }
            Err(e) => {
                log::warn!("[ktp] channel bound to {local} but not registered: {e}");
                self.state = State::Failed {
                    kind: e.kind(),
                    reason: e.to_string(),
                };
                Err(e)
            }
        }
    }

    /// The bound socket, or `None` before [`bind`](Self::bind).
    pub fn socket(&self) -> Option<&Arc<UdpSocket>> {
        match &self.state {
            State::Bound(udp) => Some(udp),
            State::Open(_) | State::Failed { .. } => None,
        }
    }

    /// Encode `segment` and send it as a single datagram to `dest`.
    ///
    /// Never blocks: a full socket buffer surfaces as `WouldBlock`, which the
    /// engines treat like channel loss.
    pub fn transmit(&self, segment: &Segment, dest: SocketAddr, message_size: usize) -> io::Result<()> {
        let udp = self.socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "channel is not bound")
        })?;
        let bytes = segment.encode(message_size);
        udp.try_send_to(&bytes, dest)?;
        Ok(())
    }
}

/// Receive one pending datagram from `udp` without blocking.
///
/// Returns `Ok(None)` when readiness turned out to be spurious.
pub fn try_receive(udp: &UdpSocket, segment_len: usize) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
    let mut buf = vec![0u8; segment_len];
    match udp.try_recv_from(&mut buf) {
        Ok((n, from)) => {
            buf.truncate(n);
            Ok(Some((buf, from)))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}
