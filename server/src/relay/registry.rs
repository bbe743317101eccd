//! Identity → connection map owned by the coordinator.
//!
//! Holds at most one handle per identity. There is no locking here; the
//! coordinator is the only code that ever sees this type.

use std::collections::HashMap;

use super::{ConnectionHandle, ConnectionId, UserId};

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<UserId, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle under its identity, returning the one it replaced.
    pub fn insert(&mut self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.connections.insert(handle.user_id(), handle)
    }

    pub fn get(&self, user_id: UserId) -> Option<&ConnectionHandle> {
        self.connections.get(&user_id)
    }

    pub fn remove(&mut self, user_id: UserId) -> Option<ConnectionHandle> {
        self.connections.remove(&user_id)
    }

    /// Remove the entry only if it is still the connection `conn_id`.
    /// A session that was already superseded must not evict its successor.
    pub fn remove_if(&mut self, user_id: UserId, conn_id: ConnectionId) -> Option<ConnectionHandle> {
        match self.connections.get(&user_id) {
            Some(handle) if handle.conn_id() == conn_id => self.connections.remove(&user_id),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, user_id: UserId) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Registered identities in ascending order.
    pub fn user_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Take every handle out of the registry.
    pub fn drain(&mut self) -> Vec<ConnectionHandle> {
        self.connections.drain().map(|(_, handle)| handle).collect()
    }
}
