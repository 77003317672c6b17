use std::sync::{Arc, Mutex};

use rustc_hash::FxHashSet;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::connection::service_connection::{ServiceConnectionStatus, ServiceEventHandler};
use crate::endpoint::service_endpoint::HubServiceEndpoint;
use crate::protocol::service_messages::PingMessage;


/// Aggregated view of all physical connections of a pool: how many are connected, whether the
///  service reports active clients for the hub, and which application servers it sees.
///
/// Everything is kept in `watch` channels so that late observers see the current level rather
///  than having to catch an edge.
pub struct EndpointStatus {
    endpoint: Arc<HubServiceEndpoint>,
    connected_ids: Mutex<FxHashSet<String>>,
    connected_count: watch::Sender<usize>,
    active: watch::Sender<bool>,
    servers: watch::Sender<Option<Vec<String>>>,
}

impl EndpointStatus {
    pub fn new(endpoint: Arc<HubServiceEndpoint>) -> EndpointStatus {
        EndpointStatus {
            endpoint,
            connected_ids: Default::default(),
            connected_count: watch::channel(0).0,
            // until the service says otherwise, assume there are clients
            active: watch::channel(true).0,
            servers: watch::channel(None).0,
        }
    }

    pub fn endpoint(&self) -> &Arc<HubServiceEndpoint> {
        &self.endpoint
    }

    pub fn connected_count(&self) -> usize {
        *self.connected_count.borrow()
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// the most recent server list reported by the service, if any
    pub fn servers(&self) -> Option<Vec<String>> {
        self.servers.borrow().clone()
    }

    pub fn subscribe_connected_count(&self) -> watch::Receiver<usize> {
        self.connected_count.subscribe()
    }

    pub async fn wait_inactive(&self) {
        let mut receiver = self.active.subscribe();
        let _ = receiver.wait_for(|active| !*active).await;
    }

    /// resolves with the first non-empty server list the service reports
    pub async fn wait_servers(&self) -> Vec<String> {
        let mut receiver = self.servers.subscribe();
        let servers = receiver.wait_for(|s| s.as_ref().map(|s| !s.is_empty()).unwrap_or(false)).await
            .map(|servers| servers.clone().unwrap_or_default())
            .unwrap_or_default();
        servers
    }
}

impl ServiceEventHandler for EndpointStatus {
    fn on_status_changed(&self, connection_id: &str, _old: ServiceConnectionStatus, new: ServiceConnectionStatus) {
        let count = {
            let mut connected_ids = self.connected_ids.lock()
                .unwrap_or_else(|e| e.into_inner());
            if new == ServiceConnectionStatus::Connected {
                connected_ids.insert(connection_id.to_string());
            }
            else {
                connected_ids.remove(connection_id);
            }
            connected_ids.len()
        };

        let old_count = self.connected_count.send_replace(count);
        if (old_count == 0) != (count == 0) {
            info!(endpoint = %self.endpoint, "service endpoint is {}", if count > 0 { "online" } else { "offline" });
        }
        self.endpoint.set_online(count > 0);
    }

    fn on_ping(&self, _connection_id: &str, ping: &PingMessage) {
        if let Some(active) = ping.active_status() {
            if self.active.send_replace(active) != active {
                debug!(endpoint = %self.endpoint, active, "endpoint client status changed");
            }
        }
        if let Some(servers) = ping.server_ids() {
            debug!(endpoint = %self.endpoint, ?servers, "received server list");
            self.servers.send_replace(Some(servers));
        }
        if let Some(metrics) = ping.endpoint_metrics() {
            self.endpoint.endpoint().update_metrics(metrics);
        }
    }
}
