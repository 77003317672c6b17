use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rustc_hash::FxHasher;
use tokio::sync::Notify;
use tokio::time::{self, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GracefulShutdownMode;
use crate::connection::service_connection::{ServiceConnection, ServiceConnectionDeps};
use crate::container::endpoint_status::EndpointStatus;
use crate::endpoint::service_endpoint::HubServiceEndpoint;
use crate::protocol::service_messages::{PingMessage, ServiceMessage};
use crate::util::backoff::ReconnectBackoff;
use crate::util::random::Random;


struct ConnectionSlot {
    connection: Arc<ServiceConnection>,
    /// consecutive sessions that ended without a successful handshake
    failed_attempts: u32,
    not_before: Instant,
}

/// A fixed number of physical connections to one endpoint for one hub.
///
/// Each slot holds exactly one connection. When a connection's session ends, a fresh unstarted
///  connection takes its place, and the pool's restart loop starts it once its reconnect backoff
///  has passed. Stopping the pool ends the restart loop first so that nothing is restarted
///  during shutdown.
pub struct ServiceConnectionContainer {
    hub_endpoint: Arc<HubServiceEndpoint>,
    deps: Arc<ServiceConnectionDeps>,
    status: Arc<EndpointStatus>,
    random: Arc<dyn Random>,
    backoff: ReconnectBackoff,

    slots: Vec<Mutex<ConnectionSlot>>,
    initial_connections: Vec<Arc<ServiceConnection>>,
    restart_needed: Arc<Notify>,
    terminated: CancellationToken,
    started: AtomicBool,
}

impl ServiceConnectionContainer {
    pub fn new(hub_endpoint: Arc<HubServiceEndpoint>, deps: Arc<ServiceConnectionDeps>, random: Arc<dyn Random>) -> Arc<ServiceConnectionContainer> {
        let status = Arc::new(EndpointStatus::new(hub_endpoint.clone()));
        let config = &deps.config;
        let backoff = ReconnectBackoff::new(config.reconnect_initial_interval, config.reconnect_max_interval);

        let initial_connections = (0..config.connection_count.max(1))
            .map(|_| ServiceConnection::new(hub_endpoint.clone(), deps.clone(), status.clone()))
            .collect::<Vec<_>>();
        let now = Instant::now();
        let slots = initial_connections.iter()
            .map(|connection| Mutex::new(ConnectionSlot {
                connection: connection.clone(),
                failed_attempts: 0,
                not_before: now,
            }))
            .collect();

        Arc::new(ServiceConnectionContainer {
            hub_endpoint,
            deps,
            status,
            random,
            backoff,
            slots,
            initial_connections,
            restart_needed: Arc::new(Notify::new()),
            terminated: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn hub_endpoint(&self) -> &Arc<HubServiceEndpoint> {
        &self.hub_endpoint
    }

    pub fn endpoint_status(&self) -> &Arc<EndpointStatus> {
        &self.status
    }

    /// Starts all connections concurrently and the loop that restarts dropped ones. Calling this
    ///  a second time has no effect.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) || self.terminated.is_cancelled() {
            return;
        }
        info!(endpoint = %self.hub_endpoint, "starting {} service connections", self.slots.len());

        for index in 0..self.slots.len() {
            let connection = self.slot(index).connection.clone();
            self.start_connection(index, &connection);
        }
        tokio::spawn(Self::restart_loop(Arc::downgrade(self), self.restart_needed.clone(), self.terminated.clone()));
    }

    fn slot(&self, index: usize) -> std::sync::MutexGuard<'_, ConnectionSlot> {
        self.slots[index].lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn start_connection(self: &Arc<Self>, index: usize, connection: &Arc<ServiceConnection>) {
        if connection.start().is_some() {
            tokio::spawn(Self::monitor(Arc::downgrade(self), index, connection.clone()));
        }
    }

    /// Replaces the connection in its slot once its session is over. The replacement is left
    ///  unstarted for the restart loop.
    async fn monitor(container: Weak<ServiceConnectionContainer>, index: usize, connection: Arc<ServiceConnection>) {
        connection.wait_finished().await;

        let Some(container) = container.upgrade() else {
            return;
        };
        if container.terminated.is_cancelled() {
            return;
        }

        let delay = {
            let mut slot = container.slot(index);
            // checked under the slot lock so that `stop` sees whatever ends up in the slot
            if container.terminated.is_cancelled() || !Arc::ptr_eq(&slot.connection, &connection) {
                return;
            }
            slot.failed_attempts = if connection.was_connected() { 0 } else { slot.failed_attempts.saturating_add(1) };
            let delay = container.backoff.delay(slot.failed_attempts, container.random.as_ref());
            slot.not_before = Instant::now() + delay;
            slot.connection = ServiceConnection::new(container.hub_endpoint.clone(), container.deps.clone(), container.status.clone());
            delay
        };

        debug!(endpoint = %container.hub_endpoint, slot = index, ?delay, "service connection dropped, reconnecting after backoff");
        container.restart_needed.notify_one();
    }

    async fn restart_loop(container: Weak<ServiceConnectionContainer>, restart_needed: Arc<Notify>, terminated: CancellationToken) {
        loop {
            let next_due = {
                let Some(container) = container.upgrade() else {
                    return;
                };
                container.restart_due_connections()
            };

            let sleep = async {
                match next_due {
                    Some(when) => time::sleep_until(when).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = terminated.cancelled() => return,
                _ = restart_needed.notified() => {}
                _ = sleep => {}
            }
        }
    }

    /// starts every unstarted connection whose backoff has passed, returning the earliest time
    ///  another one becomes due
    fn restart_due_connections(self: &Arc<Self>) -> Option<Instant> {
        let now = Instant::now();
        let mut next_due: Option<Instant> = None;

        for index in 0..self.slots.len() {
            // starting under the slot lock: `stop` either sees the started connection or prevents
            //  the start
            let slot = self.slot(index);
            if self.terminated.is_cancelled() {
                return None;
            }
            if slot.connection.is_started() {
                continue;
            }
            if slot.not_before <= now {
                debug!(endpoint = %self.hub_endpoint, slot = index, "restarting service connection");
                self.start_connection(index, &slot.connection);
            }
            else {
                next_due = Some(next_due.map_or(slot.not_before, |n| n.min(slot.not_before)));
            }
        }
        next_due
    }

    /// the current connection of every slot, started or not
    pub fn connections(&self) -> Vec<Arc<ServiceConnection>> {
        (0..self.slots.len())
            .map(|index| self.slot(index).connection.clone())
            .collect()
    }

    fn connected_connections(&self) -> Vec<Arc<ServiceConnection>> {
        self.connections().into_iter()
            .filter(|c| c.is_connected())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.status.connected_count()
    }

    pub fn has_connected(&self) -> bool {
        self.connected_count() > 0
    }

    /// Resolves with `true` as soon as any connection is connected, or with `false` if every
    ///  slot's first connect attempt failed
    pub async fn wait_first_connected(&self) -> bool {
        let mut connected = self.status.subscribe_connected_count();
        tokio::select! {
            result = connected.wait_for(|count| *count > 0) => result.is_ok(),
            _ = self.wait_all_initialized() => self.has_connected(),
        }
    }

    /// Resolves once every slot's first connection made its initial connect attempt. Returns
    ///  the number of successful ones.
    pub async fn wait_all_initialized(&self) -> usize {
        let mut num_connected = 0;
        for connection in &self.initial_connections {
            if connection.wait_initialized().await {
                num_connected += 1;
            }
        }
        num_connected
    }

    fn pick_random(&self) -> Option<Arc<ServiceConnection>> {
        let mut connected = self.connected_connections();
        if connected.is_empty() {
            return None;
        }
        let index = self.random.gen_usize_range(0..connected.len());
        Some(connected.swap_remove(index))
    }

    /// The slot for a key is fixed. If its connection is down, the next connected slot in ring
    ///  order takes over, so a key sticks to one connection while the pool is stable.
    fn pick_for_key(&self, key: &str) -> Option<Arc<ServiceConnection>> {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        let num_slots = self.slots.len();
        let start = (hasher.finish() % num_slots as u64) as usize;

        (0..num_slots)
            .map(|offset| self.slot((start + offset) % num_slots).connection.clone())
            .find(|c| c.is_connected())
    }

    async fn send_on(&self, connection: Option<Arc<ServiceConnection>>, message: ServiceMessage) -> bool {
        let Some(connection) = connection else {
            return false;
        };
        match connection.write(message).await {
            Ok(()) => true,
            Err(e) => {
                debug!(endpoint = %self.hub_endpoint, connection_id = %connection.connection_id(), "write failed: {:#}", e);
                false
            }
        }
    }

    /// Writes the message to a connected connection, honoring the message's partition key.
    ///  Returns `false` if it could not be sent.
    pub async fn try_write(&self, message: ServiceMessage) -> bool {
        let connection = match message.partition_key() {
            Some(key) => self.pick_for_key(key),
            None => self.pick_random(),
        };
        self.send_on(connection, message).await
    }

    /// Fire-and-forget write. If no connection is connected, the message is dropped with a
    ///  warning.
    pub async fn write(&self, message: ServiceMessage) -> anyhow::Result<()> {
        let kind = message.name();
        if !self.try_write(message).await {
            warn!(endpoint = %self.hub_endpoint, "no connected service connection, dropping {} message", kind);
        }
        Ok(())
    }

    pub async fn write_with_partition_key(&self, partition_key: &str, message: ServiceMessage) -> anyhow::Result<()> {
        let kind = message.name();
        let connection = self.pick_for_key(partition_key);
        if !self.send_on(connection, message).await {
            warn!(endpoint = %self.hub_endpoint, "no connected service connection, dropping {} message", kind);
        }
        Ok(())
    }

    /// Sends an ackable message and waits for the service's verdict: `true` for `Ok`, `false`
    ///  for `NotFound` or if the message could not be sent at all.
    pub async fn write_ackable_message(&self, mut message: ServiceMessage, cancel: &CancellationToken) -> anyhow::Result<bool> {
        let ack_handler = &self.deps.ack_handler;
        let waiter = ack_handler.create_multi_ack();
        let ack_id = waiter.ack_id();
        if let Err(e) = message.set_ack_id(ack_id) {
            ack_handler.discard(ack_id);
            return Err(e);
        }

        let kind = message.name();
        if !self.try_write(message).await {
            ack_handler.discard(ack_id);
            warn!(endpoint = %self.hub_endpoint, "no connected service connection for {} message", kind);
            return Ok(false);
        }

        ack_handler.set_expected_count(ack_id, 1)?;
        waiter.wait_for_write_result(cancel).await
    }

    /// asks the service for the application servers connected to this endpoint; the answer
    ///  arrives as a ping and shows up in [EndpointStatus::servers]
    pub async fn request_servers(&self) -> bool {
        self.try_write(ServiceMessage::Ping(PingMessage::servers_request())).await
    }

    /// Asks the service to take every connected connection offline, and waits until all of them
    ///  acknowledged or the graceful shutdown timeout elapsed
    pub async fn offline(&self, mode: GracefulShutdownMode) {
        let mut fin_sent = Vec::new();
        for connection in self.connected_connections() {
            match connection.send_fin(mode).await {
                Ok(()) => fin_sent.push(connection),
                Err(e) => debug!(endpoint = %self.hub_endpoint, connection_id = %connection.connection_id(), "could not send offline request: {:#}", e),
            }
        }
        if fin_sent.is_empty() {
            return;
        }

        info!(endpoint = %self.hub_endpoint, ?mode, "waiting for {} connections to go offline", fin_sent.len());
        let all_acked = async {
            for connection in &fin_sent {
                tokio::select! {
                    _ = connection.wait_fin_ack() => {}
                    _ = connection.wait_finished() => {}
                }
            }
        };
        if timeout(self.deps.config.graceful_shutdown.timeout, all_acked).await.is_err() {
            warn!(endpoint = %self.hub_endpoint, "service did not acknowledge the offline request in time");
        }
    }

    /// Stops all connections for good and waits for their sessions to end
    pub async fn stop(&self) {
        self.terminated.cancel();

        let connections = self.connections();
        for connection in &connections {
            connection.stop();
        }
        for connection in &connections {
            connection.wait_finished().await;
        }
        debug!(endpoint = %self.hub_endpoint, "service connections stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.terminated.is_cancelled()
    }
}
