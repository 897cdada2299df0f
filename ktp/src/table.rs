//! The shared connection table.
//!
//! A fixed-capacity arena of [`Connection`] slots addressed by
//! [`SocketHandle`] (the slot index).  A free slot is `None`, so it cannot
//! hold channel resources.  The table also carries the readiness set: the
//! handles the inbound engine waits on.
//!
//! The table itself is not synchronised; [`crate::stack`] keeps it behind the
//! single service lock together with the loss simulator.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::connection::{Connection, OwnerId};
use crate::error::KtpError;

/// Stable handle to a connection: the index of its table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketHandle(pub usize);

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ktp#{}", self.0)
    }
}

#[derive(Debug)]
pub struct ConnectionTable {
    slots: Vec<Option<Connection>>,
    readiness: BTreeSet<SocketHandle>,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            readiness: BTreeSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// First free slot, if any.
    pub fn free_slot(&self) -> Option<SocketHandle> {
        self.slots.iter().position(Option::is_none).map(SocketHandle)
    }

    /// Occupy the first free slot with `conn` and register it for readiness.
    pub fn insert(&mut self, conn: Connection) -> Result<SocketHandle, KtpError> {
        let handle = self.free_slot().ok_or(KtpError::NoCapacity)?;
        self.slots[handle.0] = Some(conn);
        self.readiness.insert(handle);
        Ok(handle)
    }

    pub fn get(&self, handle: SocketHandle) -> Result<&Connection, KtpError> {
        self.slots
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(KtpError::InvalidHandle)
    }

    pub fn get_mut(&mut self, handle: SocketHandle) -> Result<&mut Connection, KtpError> {
        self.slots
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(KtpError::InvalidHandle)
    }

    /// The connection in `handle` if it still uses `socket`.
    ///
    /// Engines observe sockets outside the lock; by the time they act, the
    /// slot may have been closed or even reallocated to a new connection.
    pub fn get_if_socket(
        &mut self,
        handle: SocketHandle,
        socket: &Arc<UdpSocket>,
    ) -> Option<&mut Connection> {
        let conn = self.slots.get_mut(handle.0)?.as_mut()?;
        let same = Arc::ptr_eq(conn.channel().socket()?, socket);
        same.then_some(conn)
    }

    /// Free the slot, dropping its channel, and deregister it.
    pub fn remove(&mut self, handle: SocketHandle) -> Result<Connection, KtpError> {
        let conn = self
            .slots
            .get_mut(handle.0)
            .and_then(Option::take)
            .ok_or(KtpError::InvalidHandle)?;
        self.readiness.remove(&handle);
        Ok(conn)
    }

    /// Handles of every slot owned by `owner`, lowest first.
    pub fn owned_by(&self, owner: OwnerId) -> Vec<SocketHandle> {
        self.iter()
            .filter(|(_, conn)| conn.owner() == owner)
            .map(|(handle, _)| handle)
            .collect()
    }

    /// Bound sockets of the readiness set, for the inbound engine to wait on.
    pub fn readiness_snapshot(&self) -> Vec<(SocketHandle, Arc<UdpSocket>)> {
        self.readiness
            .iter()
            .filter_map(|&handle| {
                let socket = self.get(handle).ok()?.channel().socket()?;
                Some((handle, Arc::clone(socket)))
            })
            .collect()
    }

    pub fn is_registered(&self, handle: SocketHandle) -> bool {
        self.readiness.contains(&handle)
    }

    /// Occupied slots.
    pub fn iter(&self) -> impl Iterator<Item = (SocketHandle, &Connection)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|conn| (SocketHandle(i), conn)))
    }

    /// Occupied slots, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SocketHandle, &mut Connection)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|conn| (SocketHandle(i), conn)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::config::KtpConfig;
    use socket2::Domain;
    use tokio::runtime::Handle;

    fn conn(owner: u32) -> Connection {
        let channel = Channel::open(Domain::IPV4, None).unwrap();
        Connection::new(OwnerId(owner), channel, &KtpConfig::default())
    }

    #[test]
    fn slots_are_reused_lowest_first() {
        let mut table = ConnectionTable::new(3);
        let a = table.insert(conn(1)).unwrap();
        let b = table.insert(conn(1)).unwrap();
        let c = table.insert(conn(2)).unwrap();
        assert_eq!((a, b, c), (SocketHandle(0), SocketHandle(1), SocketHandle(2)));
        assert!(matches!(table.insert(conn(3)), Err(KtpError::NoCapacity)));

        table.remove(b).unwrap();
        assert!(!table.is_registered(b));
        assert_eq!(table.insert(conn(3)).unwrap(), SocketHandle(1));
        assert!(table.is_registered(SocketHandle(1)));
    }

    #[test]
    fn free_or_out_of_range_handles_are_invalid() {
        let mut table = ConnectionTable::new(2);
        assert!(matches!(table.get(SocketHandle(0)), Err(KtpError::InvalidHandle)));
        assert!(matches!(table.get_mut(SocketHandle(7)), Err(KtpError::InvalidHandle)));

        let h = table.insert(conn(1)).unwrap();
        table.remove(h).unwrap();
        assert!(matches!(table.remove(h), Err(KtpError::InvalidHandle)));
        assert!(table.is_empty());
    }

    #[test]
    fn owned_by_filters_on_owner() {
        let mut table = ConnectionTable::new(4);
        table.insert(conn(1)).unwrap();
        table.insert(conn(2)).unwrap();
        table.insert(conn(1)).unwrap();
        assert_eq!(
            table.owned_by(OwnerId(1)),
            vec![SocketHandle(0), SocketHandle(2)]
        );
        assert!(table.owned_by(OwnerId(9)).is_empty());
        assert_eq!(table.len(), 3);
    }

    #[tokio::test]
    async fn snapshot_lists_only_bound_members() {
        let mut table = ConnectionTable::new(4);
        let unbound = table.insert(conn(1)).unwrap();
        let h = table.insert(conn(1)).unwrap();
        table
            .get_mut(h)
            .unwrap()
            .bind(
                "127.0.0.1:0".parse().unwrap(),
                "127.0.0.1:9".parse().unwrap(),
                &Handle::current(),
            )
            .unwrap();

        let snapshot = table.readiness_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, h);
        assert!(table.is_registered(unbound));

        let socket = Arc::clone(&snapshot[0].1);
        assert!(table.get_if_socket(h, &socket).is_some());

        // A reallocated slot no longer matches the observed socket.
        table.remove(h).unwrap();
        assert!(table.get_if_socket(h, &socket).is_none());
        let reused = table.insert(conn(2)).unwrap();
        assert_eq!(reused, h);
        assert!(table.get_if_socket(h, &socket).is_none());
    }
}
