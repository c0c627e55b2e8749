//! Registry of live connections keyed by connection id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use super::Connection;
use crate::error::{Error, Result};

/// Connection registry shared by the server and its connections.
///
/// Safe for concurrent add/remove from many connections.
#[derive(Debug, Default)]
pub struct ConnManager {
    connections: RwLock<HashMap<u32, Arc<Connection>>>,
}

impl ConnManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its id.
    pub fn add(&self, conn: Arc<Connection>) {
        let conn_id = conn.conn_id();
        let mut connections = self.connections.write().unwrap_or_else(|p| p.into_inner());
        if connections.insert(conn_id, conn).is_some() {
            warn!(conn_id, "Connection id registered twice, previous entry replaced");
        }
        debug!(conn_id, total = connections.len(), "Connection added");
    }

    /// Deregister a connection, returning it if it was present.
    pub fn remove(&self, conn_id: u32) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write().unwrap_or_else(|p| p.into_inner());
        let removed = connections.remove(&conn_id);
        debug!(conn_id, total = connections.len(), "Connection removed");
        removed
    }

    /// Deregister `conn` only if the entry under its id is this connection.
    ///
    /// A reused id may already belong to a newer connection, which stays.
    pub fn remove_conn(&self, conn: &Arc<Connection>) -> bool {
        let conn_id = conn.conn_id();
        let mut connections = self.connections.write().unwrap_or_else(|p| p.into_inner());
        let owned = connections
            .get(&conn_id)
            .is_some_and(|current| Arc::ptr_eq(current, conn));
        if owned {
            connections.remove(&conn_id);
            debug!(conn_id, total = connections.len(), "Connection removed");
        }
        owned
    }

    pub fn contains(&self, conn_id: u32) -> bool {
        self.connections
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&conn_id)
    }

    pub fn get(&self, conn_id: u32) -> Result<Arc<Connection>> {
        let connections = self.connections.read().unwrap_or_else(|p| p.into_inner());
        connections
            .get(&conn_id)
            .cloned()
            .ok_or(Error::ConnectionNotFound(conn_id))
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every registered connection.
    pub fn clear_conn(&self) {
        // Stop re-enters `remove`, so collect first and release the lock
        let connections: Vec<Arc<Connection>> = {
            let connections = self.connections.read().unwrap_or_else(|p| p.into_inner());
            connections.values().cloned().collect()
        };

        let count = connections.len();
        for conn in connections {
            conn.stop();
        }
        info!(count, "All connections cleared");
    }
}
