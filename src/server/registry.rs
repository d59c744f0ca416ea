//! Connection registry
//!
//! Tracks the set of currently open connections, keyed by stable
//! connection id. A connection is a member exactly between its
//! `client_connected` and `client_disconnected` notifications.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::transport::{Connection, ConnectionId};

/// Set of open connections
///
/// All mutation normally happens on the server's run loop; the lock is
/// there so applications can snapshot or broadcast from other tasks.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a connection. Returns false if the id was already present.
    pub fn add(&self, connection: Connection) -> bool {
        let mut inner = self.write();
        if inner.contains_key(&connection.id()) {
            return false;
        }
        inner.insert(connection.id(), connection);
        true
    }

    /// Remove a connection by id. Removing an absent id is a no-op.
    pub fn remove(&self, id: ConnectionId) -> Option<Connection> {
        self.write().remove(&id)
    }

    /// Whether the connection is currently registered
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.read().contains_key(&id)
    }

    /// Look up a registered connection by id
    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.read().get(&id).cloned()
    }

    /// Number of open connections
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drop all members. The server calls this when it starts listening.
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Clones of all current members
    pub fn snapshot(&self) -> Vec<Connection> {
        self.read().values().cloned().collect()
    }

    /// Queue a text frame to every member; returns how many accepted it
    pub fn broadcast_text(&self, text: &str) -> usize {
        let inner = self.read();
        let mut delivered = 0;
        for connection in inner.values() {
            if connection.send_text(text).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ConnectionId, Connection>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ConnectionId, Connection>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
