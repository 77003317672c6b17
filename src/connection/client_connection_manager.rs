use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::connection::client_connection::ClientConnectionContext;


/// Registry of the virtual connections currently hosted by this server, across all physical
///  connections. At most one entry per connection id: adding replaces.
pub struct ClientConnectionManager {
    connections: RwLock<FxHashMap<String, Arc<ClientConnectionContext>>>,
}

impl ClientConnectionManager {
    pub fn new() -> ClientConnectionManager {
        ClientConnectionManager {
            connections: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn add(&self, connection: Arc<ClientConnectionContext>) {
        let previous = self.connections.write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(connection.connection_id().to_string(), connection);
        if let Some(previous) = previous {
            warn!(connection_id = %previous.connection_id(), "replacing registered client connection");
        }
    }

    pub fn remove(&self, connection_id: &str) -> Option<Arc<ClientConnectionContext>> {
        self.connections.write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(connection_id)
    }

    /// Removes the entry only if it is this very context, so a late cleanup can not remove a
    ///  newer connection with the same id
    pub fn remove_if_same(&self, connection: &ClientConnectionContext) -> bool {
        let mut connections = self.connections.write()
            .unwrap_or_else(|e| e.into_inner());
        let is_same = connections.get(connection.connection_id())
            .map(|existing| std::ptr::eq(Arc::as_ptr(existing), connection))
            .unwrap_or(false);
        if is_same {
            connections.remove(connection.connection_id());
            debug!(connection_id = %connection.connection_id(), "removed client connection");
        }
        is_same
    }

    pub fn try_get(&self, connection_id: &str) -> Option<Arc<ClientConnectionContext>> {
        self.connections.read()
            .unwrap_or_else(|e| e.into_inner())
            .get(connection_id)
            .cloned()
    }

    pub fn connections(&self) -> Vec<Arc<ClientConnectionContext>> {
        self.connections.read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.connections.read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Resolves once every connection registered at the time of the call has completed. Each
    ///  connection's completion is tracked on the connection itself, so removals racing with
    ///  this call do not matter.
    pub async fn when_all_completed(&self) {
        for connection in self.connections() {
            connection.completed().await;
        }
    }
}

impl Default for ClientConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
