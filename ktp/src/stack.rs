//! The KTP service and its socket facade.
//!
//! A [`KtpStack`] is the host-wide singleton: it owns the connection table,
//! the loss simulator and the two background engines.  Any number of clients
//! (threads, tasks, or logical processes identified by [`OwnerId`]) share one
//! stack and call the facade operations concurrently:
//!
//! ```text
//!   client A ─┐                        ┌── inbound engine  (readiness wait, ACKs)
//!   client B ─┼─▶ socket/bind/send/ ──▶│
//!   client C ─┘   recv/close           └── outbound engine (T/2 tick, retransmit)
//!                      │                         │
//!                      └──── Mutex<State> ◀──────┘
//!                     (table + readiness + loss)
//! ```
//!
//! Every facade call and every engine pass serialises on the same lock.  No
//! call holds it across a blocking operation: channel I/O under the lock is
//! non-blocking, and binding a channel is a local system call.
//!
//! # Sharing across OS processes
//!
//! The table is shared by every client of one `KtpStack` instance.  It is not
//! placed in OS shared memory: a table mapped into several processes would
//! need a process-shared lock to be consistent, and a per-process mutex over
//! such a table only excludes the threads of the process holding it.  Hosts
//! that need several OS processes to share connections run one stack (the
//! daemon) and give each process its own [`OwnerId`].
//!
//! # Reclamation
//!
//! [`KtpStack::reclaim`] releases the connections of an owner that went away
//! without closing them.  It is an ordinary lock-disciplined call meant for a
//! shutdown path or a supervising watchdog, not for a signal handler.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use socket2::{Domain, Protocol};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::channel::Channel;
use crate::config::KtpConfig;
use crate::connection::{Connection, ConnectionStats, ConnectionStatus, OwnerId};
use crate::error::KtpError;
use crate::simulator::{LossModel, LossSimulator};
use crate::table::{ConnectionTable, SocketHandle};
use crate::{inbound, outbound};

/// Socket type requested at creation.  Only [`SocketType::Ktp`] is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Ktp,
    Datagram,
    Stream,
}

/// Everything guarded by the service lock.
pub(crate) struct State {
    pub(crate) table: ConnectionTable,
    pub(crate) loss: Box<dyn LossModel>,
}

pub(crate) struct Shared {
    pub(crate) config: KtpConfig,
    state: Mutex<State>,
    /// Signalled whenever the set of pollable sockets changes.
    pub(crate) membership: Notify,
    runtime: Handle,
}

impl Shared {
    /// Acquire the service lock.
    ///
    /// Every critical section leaves the table consistent between statements,
    /// so a lock poisoned by a panicking client is still safe to use.
    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Engines {
    inbound: JoinHandle<()>,
    outbound: JoinHandle<()>,
}

impl Drop for Engines {
    fn drop(&mut self) {
        self.inbound.abort();
        self.outbound.abort();
    }
}

/// Handle to a running KTP service.  Cheap to clone; the engines stop when
/// the last clone is dropped or [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct KtpStack {
    shared: Arc<Shared>,
    engines: Arc<Engines>,
}

impl KtpStack {
    /// Start the service with the Bernoulli loss simulator configured by
    /// `config.loss_probability`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn start(config: KtpConfig) -> Result<Self, KtpError> {
        config.validate()?;
        let loss = LossSimulator::new(config.loss_probability, config.loss_seed)?;
        Self::start_with_loss_model(config, Box::new(loss))
    }

    /// Start the service with a custom [`LossModel`] on the inbound path.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn start_with_loss_model(
        config: KtpConfig,
        loss: Box<dyn LossModel>,
    ) -> Result<Self, KtpError> {
        config.validate()?;
        let runtime = Handle::current();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                table: ConnectionTable::new(config.max_connections),
                loss,
            }),
            config,
            membership: Notify::new(),
            runtime: runtime.clone(),
        });

        let engines = Engines {
            inbound: runtime.spawn(inbound::run(Arc::clone(&shared))),
            outbound: runtime.spawn(outbound::run(Arc::clone(&shared))),
        };
        log::info!(
            "[ktp] service started: message_size={} window={} T={:?} P={} N={}",
            shared.config.message_size,
            shared.config.window_capacity,
            shared.config.retransmit_interval,
            shared.config.loss_probability,
            shared.config.max_connections
        );

        Ok(Self {
            shared,
            engines: Arc::new(engines),
        })
    }

    pub fn config(&self) -> &KtpConfig {
        &self.shared.config
    }

    // -----------------------------------------------------------------------
    // Socket facade
    // -----------------------------------------------------------------------

    /// Create a connection owned by the calling process.
    pub fn socket(
        &self,
        domain: Domain,
        ty: SocketType,
        protocol: Option<Protocol>,
    ) -> Result<SocketHandle, KtpError> {
        self.socket_as(OwnerId::current(), domain, ty, protocol)
    }

    /// Create a connection on behalf of `owner`.
    ///
    /// Allocates the first free slot and an unbound datagram channel, resets
    /// all per-connection state and registers the slot with the inbound
    /// engine.
    pub fn socket_as(
        &self,
        owner: OwnerId,
        domain: Domain,
        ty: SocketType,
        protocol: Option<Protocol>,
    ) -> Result<SocketHandle, KtpError> {
        if ty != SocketType::Ktp {
            return Err(KtpError::UnsupportedType(ty));
        }

        let mut state = self.shared.lock();
        if state.table.free_slot().is_none() {
            return Err(KtpError::NoCapacity);
        }
        let channel = Channel::open(domain, protocol)?;
        let handle = state
            .table
            .insert(Connection::new(owner, channel, &self.shared.config))?;
        drop(state);

        self.shared.membership.notify_waiters();
        log::info!("[ktp] {handle} created for {owner}");
        Ok(handle)
    }

    /// Fix the endpoint pair of `handle` and bind its channel to `local`.
    pub fn bind(
        &self,
        handle: SocketHandle,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<(), KtpError> {
        let mut state = self.shared.lock();
        let conn = state.table.get_mut(handle)?;
        let bound = conn.bind(local, remote, &self.shared.runtime)?;
        drop(state);

        self.shared.membership.notify_waiters();
        log::info!("[ktp] {handle} bound {bound} -> {remote}");
        Ok(())
    }

    /// Queue `message` for delivery to `dest`, which must be the bound
    /// remote endpoint.  Never blocks.
    ///
    /// Returns the number of bytes accepted (at most the message size).
    pub fn send_to(
        &self,
        handle: SocketHandle,
        message: &[u8],
        dest: SocketAddr,
    ) -> Result<usize, KtpError> {
        let mut state = self.shared.lock();
        state.table.get_mut(handle)?.enqueue(message, dest)
    }

    /// Take the oldest delivered message into `buf`.  Never blocks.
    ///
    /// Returns the copied length and the remote endpoint.
    pub fn recv_from(
        &self,
        handle: SocketHandle,
        buf: &mut [u8],
    ) -> Result<(usize, SocketAddr), KtpError> {
        let mut state = self.shared.lock();
        state.table.get_mut(handle)?.dequeue(buf)
    }

    /// Release the connection and its channel.
    pub fn close(&self, handle: SocketHandle) -> Result<(), KtpError> {
        let conn = self.shared.lock().table.remove(handle)?;
        self.shared.membership.notify_waiters();
        log::info!(
            "[ktp] {handle} closed ({} unacked, {} undelivered)",
            conn.status().in_flight,
            conn.status().queued_inbound
        );
        Ok(())
    }

    /// Address the channel of `handle` is actually bound to.
    pub fn local_addr(&self, handle: SocketHandle) -> Result<SocketAddr, KtpError> {
        self.shared
            .lock()
            .table
            .get(handle)?
            .local()
            .ok_or(KtpError::NotBound)
    }

    pub fn status(&self, handle: SocketHandle) -> Result<ConnectionStatus, KtpError> {
        Ok(self.shared.lock().table.get(handle)?.status())
    }

    pub fn stats(&self, handle: SocketHandle) -> Result<ConnectionStats, KtpError> {
        Ok(self.shared.lock().table.get(handle)?.stats())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Release every connection owned by `owner`; returns the freed handles.
    pub fn reclaim(&self, owner: OwnerId) -> Vec<SocketHandle> {
        let mut state = self.shared.lock();
        let handles = state.table.owned_by(owner);
        for &handle in &handles {
            if state.table.remove(handle).is_ok() {
                log::info!("[ktp] {handle} reclaimed from {owner}");
            }
        }
        drop(state);

        if !handles.is_empty() {
            self.shared.membership.notify_waiters();
        }
        handles
    }

    /// Release every connection and stop both engines.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        let handles: Vec<SocketHandle> = state.table.iter().map(|(h, _)| h).collect();
        for handle in handles {
            let _ = state.table.remove(handle);
        }
        drop(state);

        self.engines.inbound.abort();
        self.engines.outbound.abort();
        log::info!("[ktp] service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> KtpConfig {
        KtpConfig {
            max_connections: 2,
            retransmit_interval: Duration::from_millis(200),
            loss_probability: 0.0,
            ..KtpConfig::default()
        }
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = KtpConfig {
            window_capacity: 0,
            ..test_config()
        };
        assert!(matches!(KtpStack::start(config), Err(KtpError::Config(_))));
    }

    #[tokio::test]
    async fn only_ktp_sockets_are_served() {
        let stack = KtpStack::start(test_config()).unwrap();
        let err = stack
            .socket(Domain::IPV4, SocketType::Datagram, None)
            .unwrap_err();
        assert!(matches!(err, KtpError::UnsupportedType(SocketType::Datagram)));
    }

    #[tokio::test]
    async fn table_exhaustion_and_reuse() {
        let stack = KtpStack::start(test_config()).unwrap();
        let a = stack.socket(Domain::IPV4, SocketType::Ktp, None).unwrap();
        let _b = stack.socket(Domain::IPV4, SocketType::Ktp, None).unwrap();
        assert!(matches!(
            stack.socket(Domain::IPV4, SocketType::Ktp, None),
            Err(KtpError::NoCapacity)
        ));

        stack.close(a).unwrap();
        assert!(matches!(stack.close(a), Err(KtpError::InvalidHandle)));
        assert_eq!(stack.socket(Domain::IPV4, SocketType::Ktp, None).unwrap(), a);
    }

    #[tokio::test]
    async fn reclaim_releases_all_slots_of_the_owner() {
        let stack = KtpStack::start(test_config()).unwrap();
        let a = stack
            .socket_as(OwnerId(7), Domain::IPV4, SocketType::Ktp, None)
            .unwrap();
        let b = stack
            .socket_as(OwnerId(7), Domain::IPV4, SocketType::Ktp, None)
            .unwrap();

        assert!(stack.reclaim(OwnerId(8)).is_empty());
        assert_eq!(stack.reclaim(OwnerId(7)), vec![a, b]);
        assert!(matches!(stack.status(a), Err(KtpError::InvalidHandle)));
        assert!(matches!(stack.status(b), Err(KtpError::InvalidHandle)));
    }

    #[tokio::test]
    async fn shutdown_releases_everything() {
        let stack = KtpStack::start(test_config()).unwrap();
        let a = stack.socket(Domain::IPV4, SocketType::Ktp, None).unwrap();
        stack.shutdown();
        assert!(matches!(stack.close(a), Err(KtpError::InvalidHandle)));
    }
}
