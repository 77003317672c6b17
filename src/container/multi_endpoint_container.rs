use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use rustc_hash::FxHashSet;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio::time::{self, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GracefulShutdownMode;
use crate::connection::service_connection::ServiceConnectionDeps;
use crate::container::service_connection_container::ServiceConnectionContainer;
use crate::endpoint::endpoint_manager::{EndpointEvent, ServiceEndpointManager};
use crate::endpoint::endpoint_router::EndpointRouter;
use crate::endpoint::service_endpoint::{EndpointId, HubServiceEndpoint, ServiceEndpoint};
use crate::error::RelayError;
use crate::protocol::service_messages::ServiceMessage;
use crate::util::atomic_map::AtomicMap;
use crate::util::random::Random;


#[derive(Clone)]
struct PoolEntry {
    endpoint: Arc<ServiceEndpoint>,
    container: Arc<ServiceConnectionContainer>,
    /// removed from the endpoint set, serving existing clients until they are gone
    draining: bool,
}

/// All physical connections of one hub: a [ServiceConnectionContainer] per service endpoint.
///
/// Outbound messages are routed to endpoints by the [EndpointRouter]. The container follows the
///  endpoint set of the [ServiceEndpointManager]: pools for added endpoints are started right
///  away and the endpoint is promoted for negotiation after a grace period, while pools of
///  removed endpoints keep serving until the service reports no more active clients.
///
/// Pools are keyed by [EndpointId], so renaming an endpoint or changing its type leaves its pool
///  untouched.
pub struct MultiEndpointContainer {
    hub: String,
    deps: Arc<ServiceConnectionDeps>,
    endpoint_manager: Arc<ServiceEndpointManager>,
    router: Arc<dyn EndpointRouter>,
    random: Arc<dyn Random>,

    pools: AtomicMap<EndpointId, PoolEntry>,
    terminated: CancellationToken,
    started: AtomicBool,
}

impl MultiEndpointContainer {
    pub fn new(hub: &str, deps: Arc<ServiceConnectionDeps>, endpoint_manager: Arc<ServiceEndpointManager>, router: Arc<dyn EndpointRouter>, random: Arc<dyn Random>) -> Arc<MultiEndpointContainer> {
        let container = Arc::new(MultiEndpointContainer {
            hub: hub.to_string(),
            deps,
            endpoint_manager,
            router,
            random,
            pools: AtomicMap::new(),
            terminated: CancellationToken::new(),
            started: AtomicBool::new(false),
        });

        container.pools.update(|pools| {
            for endpoint in container.endpoint_manager.endpoints().iter() {
                pools.insert(endpoint.id(), container.new_pool_entry(endpoint));
            }
        });
        container
    }

    pub fn hub(&self) -> &str {
        &self.hub
    }

    fn new_pool_entry(&self, endpoint: &Arc<ServiceEndpoint>) -> PoolEntry {
        let hub_endpoint = Arc::new(HubServiceEndpoint::new(&self.hub, endpoint.clone()));
        PoolEntry {
            endpoint: endpoint.clone(),
            container: ServiceConnectionContainer::new(hub_endpoint, self.deps.clone(), self.random.clone()),
            draining: false,
        }
    }

    /// Starts the pools of all current endpoints and begins following changes to the endpoint
    ///  set
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) || self.terminated.is_cancelled() {
            return;
        }

        info!(hub = %self.hub, "starting service connections to {} endpoints", self.pools.load().len());
        let events = self.endpoint_manager.subscribe();
        for entry in self.pools.load().values() {
            entry.container.start();
        }
        // catch up on anything that changed between construction and subscription
        self.sync_pools();

        tokio::spawn(Self::endpoint_event_loop(Arc::downgrade(self), events, self.terminated.clone()));
    }

    /// Resolves once every pool made its first connect attempts; returns the number of pools
    ///  with at least one connection
    pub async fn wait_initialized(&self) -> usize {
        let mut num_connected = 0;
        for entry in self.pools.load().values() {
            if entry.container.wait_all_initialized().await > 0 {
                num_connected += 1;
            }
        }
        num_connected
    }

    async fn endpoint_event_loop(container: Weak<MultiEndpointContainer>, mut events: tokio::sync::broadcast::Receiver<EndpointEvent>, terminated: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = terminated.cancelled() => return,
                event = events.recv() => event,
            };

            let Some(container) = container.upgrade() else {
                return;
            };
            match event {
                Ok(event) => container.on_endpoint_event(event),
                Err(RecvError::Lagged(num_skipped)) => {
                    warn!(hub = %container.hub, "missed {} endpoint events, resynchronizing", num_skipped);
                    container.sync_pools();
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    fn on_endpoint_event(self: &Arc<Self>, event: EndpointEvent) {
        match &event {
            EndpointEvent::Added(endpoint) => info!(hub = %self.hub, "service endpoint {} added", endpoint),
            EndpointEvent::Removed(endpoint) => info!(hub = %self.hub, "service endpoint {} removed", endpoint),
            EndpointEvent::Updated(data) => info!(hub = %self.hub, "service endpoint {} updated, was {} ({:?})", data.endpoint, data.old_name, data.old_type),
            EndpointEvent::Promoted(endpoint) => debug!(hub = %self.hub, "service endpoint {} promoted", endpoint),
        }
        self.sync_pools();
    }

    /// Brings the pool table in line with the endpoint manager's current set: starts pools for
    ///  new endpoints and starts draining pools of endpoints that are gone
    fn sync_pools(self: &Arc<Self>) {
        let current = self.endpoint_manager.endpoints();
        let current_ids = current.iter()
            .map(|e| e.id())
            .collect::<FxHashSet<_>>();

        let (added, removed) = self.pools.update(|pools| {
            let mut added = Vec::new();
            for endpoint in current.iter() {
                if !pools.contains_key(&endpoint.id()) {
                    let entry = self.new_pool_entry(endpoint);
                    pools.insert(endpoint.id(), entry.clone());
                    added.push(entry);
                }
            }

            let mut removed = Vec::new();
            for (id, entry) in pools.iter_mut() {
                if !entry.draining && !current_ids.contains(id) {
                    entry.draining = true;
                    removed.push((*id, entry.clone()));
                }
            }
            (added, removed)
        });

        for entry in added {
            entry.container.start();
            if entry.endpoint.is_staging() {
                tokio::spawn(self.clone().promote_when_ready(entry));
            }
        }
        for (id, entry) in removed {
            tokio::spawn(self.clone().drain_pool(id, entry));
        }
    }

    /// Promotes a newly added endpoint once the grace period passed and, if so configured, the
    ///  service reported application servers using it
    async fn promote_when_ready(self: Arc<Self>, entry: PoolEntry) {
        let config = &self.deps.config;
        tokio::select! {
            _ = self.terminated.cancelled() => return,
            _ = time::sleep(config.endpoint_promotion_grace_period) => {}
        }

        if config.require_servers_for_promotion {
            let status = entry.container.endpoint_status();
            loop {
                if !entry.container.request_servers().await {
                    debug!(endpoint = %entry.endpoint, "no connection to ask for servers yet");
                }
                tokio::select! {
                    _ = self.terminated.cancelled() => return,
                    servers = status.wait_servers() => {
                        debug!(endpoint = %entry.endpoint, ?servers, "application servers use the new endpoint");
                        break;
                    }
                    _ = time::sleep(config.servers_ping_interval) => {}
                }
            }
        }

        if !self.endpoint_manager.promote(&entry.endpoint) {
            debug!(endpoint = %entry.endpoint, "endpoint was not promoted, it is no longer staging or was removed");
        }
    }

    /// Keeps a removed endpoint's pool serving until the service reports no more active clients
    ///  (or the reload timeout elapsed), then takes it down
    async fn drain_pool(self: Arc<Self>, id: EndpointId, entry: PoolEntry) {
        let reload_timeout = self.deps.config.endpoint_reload_timeout;
        tokio::select! {
            _ = self.terminated.cancelled() => return,
            drained = timeout(reload_timeout, entry.container.endpoint_status().wait_inactive()) => {
                if drained.is_err() {
                    warn!(endpoint = %entry.endpoint, "clients of removed endpoint did not drain within {:?}, removing it anyway", reload_timeout);
                }
            }
        }

        entry.container.offline(GracefulShutdownMode::Off).await;
        entry.container.stop().await;
        self.pools.update(|pools| {
            if matches!(pools.get(&id), Some(e) if Arc::ptr_eq(&e.container, &entry.container)) {
                pools.remove(&id);
            }
        });
        info!(hub = %self.hub, endpoint = %entry.endpoint, "removed service endpoint");
    }

    /// endpoints this container currently has pools for, including draining ones
    pub fn endpoints(&self) -> Vec<Arc<ServiceEndpoint>> {
        self.pools.load().values()
            .map(|e| e.endpoint.clone())
            .collect()
    }

    pub fn pool_for(&self, endpoint: &ServiceEndpoint) -> Option<Arc<ServiceConnectionContainer>> {
        self.pools.get(&endpoint.id())
            .map(|e| e.container)
    }

    /// this hub's view of its endpoints, including draining ones
    pub fn hub_endpoints(&self) -> Vec<Arc<HubServiceEndpoint>> {
        self.pools.load().values()
            .map(|e| e.container.hub_endpoint().clone())
            .collect()
    }

    /// The endpoint a new client of this hub should connect to, as chosen by the router among
    ///  the negotiable endpoints. Whether an endpoint is online is judged by this hub's own pool.
    pub fn negotiate_endpoint(&self) -> anyhow::Result<Option<Arc<HubServiceEndpoint>>> {
        let pools = self.pools.load();
        let candidates = self.endpoint_manager.negotiate_endpoints().iter()
            .filter_map(|e| pools.get(&e.id()))
            .map(|entry| entry.container.hub_endpoint().clone())
            .collect::<Vec<_>>();
        self.router.get_negotiate_endpoint(&candidates)
    }

    fn union(lists: impl IntoIterator<Item = anyhow::Result<Vec<Arc<ServiceEndpoint>>>>) -> anyhow::Result<Vec<Arc<ServiceEndpoint>>> {
        let mut seen = FxHashSet::default();
        let mut result = Vec::new();
        for list in lists {
            for endpoint in list? {
                if seen.insert(endpoint.id()) {
                    result.push(endpoint);
                }
            }
        }
        Ok(result)
    }

    fn route(&self, message: &ServiceMessage) -> anyhow::Result<Vec<Arc<ServiceEndpoint>>> {
        let endpoints = self.endpoints();
        let router = &self.router;
        match message {
            ServiceMessage::BroadcastData(_) | ServiceMessage::Ping(_) => router.get_endpoints_for_broadcast(&endpoints),
            ServiceMessage::GroupBroadcastData(m) => router.get_endpoints_for_group(&m.group_name, &endpoints),
            ServiceMessage::MultiGroupBroadcastData(m) => Self::union(m.group_names.iter()
                .map(|g| router.get_endpoints_for_group(g, &endpoints))),
            ServiceMessage::UserData(m) => router.get_endpoints_for_user(&m.user_id, &endpoints),
            ServiceMessage::MultiUserData(m) => Self::union(m.user_ids.iter()
                .map(|u| router.get_endpoints_for_user(u, &endpoints))),
            ServiceMessage::ConnectionData(m) => router.get_endpoints_for_connection(&m.connection_id, &endpoints),
            ServiceMessage::CloseConnection(m) => router.get_endpoints_for_connection(&m.connection_id, &endpoints),
            ServiceMessage::MultiConnectionData(m) => Self::union(m.connection_ids.iter()
                .map(|c| router.get_endpoints_for_connection(c, &endpoints))),
            ServiceMessage::JoinGroup(m) | ServiceMessage::LeaveGroup(m) => router.get_endpoints_for_connection(&m.connection_id, &endpoints),
            ServiceMessage::JoinGroupWithAck(m) | ServiceMessage::LeaveGroupWithAck(m) => router.get_endpoints_for_connection(&m.connection_id, &endpoints),
            ServiceMessage::Handshake(_)
            | ServiceMessage::HandshakeResponse(_)
            | ServiceMessage::OpenConnection(_)
            | ServiceMessage::Ack(_)
            | ServiceMessage::ServiceError(_) => Err(RelayError::UnroutableMessage(message.name()).into()),
        }
    }

    /// Messages for a client connected to this server go through the physical connection
    ///  carrying it. Returns the message back if that is not possible.
    async fn try_write_to_owner(&self, message: ServiceMessage) -> Option<ServiceMessage> {
        let context = match &message {
            ServiceMessage::ConnectionData(m) => self.deps.client_connections.try_get(&m.connection_id),
            ServiceMessage::CloseConnection(m) => self.deps.client_connections.try_get(&m.connection_id),
            _ => None,
        };
        let Some(context) = context else {
            return Some(message);
        };

        match context.owner().send(message.clone()).await {
            Ok(()) => None,
            Err(_) => {
                debug!(client_connection_id = %context.connection_id(), "owning service connection is gone, routing instead");
                Some(message)
            }
        }
    }

    /// pools of the target endpoints that have a live connection; offline ones are logged and
    ///  skipped
    fn connected_pools(&self, targets: &[Arc<ServiceEndpoint>], kind: &str) -> Vec<Arc<ServiceConnectionContainer>> {
        let pools = self.pools.load();
        targets.iter()
            .filter_map(|endpoint| {
                let Some(entry) = pools.get(&endpoint.id()) else {
                    debug!(hub = %self.hub, endpoint = %endpoint, "no connections to routed endpoint");
                    return None;
                };
                if !entry.container.has_connected() {
                    warn!(hub = %self.hub, endpoint = %endpoint, "service endpoint is offline, dropping {} message for it", kind);
                    return None;
                }
                Some(entry.container.clone())
            })
            .collect()
    }

    /// Fire-and-forget write to every endpoint the router selects. Router errors are returned
    ///  unchanged.
    pub async fn write(&self, message: ServiceMessage) -> anyhow::Result<()> {
        let Some(message) = self.try_write_to_owner(message).await else {
            return Ok(());
        };

        let targets = self.route(&message)?;
        for pool in self.connected_pools(&targets, message.name()) {
            pool.write(message.clone()).await?;
        }
        Ok(())
    }

    /// Like [MultiEndpointContainer::write], but every pool sends through the connection that
    ///  `partition_key` maps to, preserving the order of messages with the same key
    pub async fn write_with_partition_key(&self, partition_key: &str, message: ServiceMessage) -> anyhow::Result<()> {
        let targets = self.route(&message)?;
        for pool in self.connected_pools(&targets, message.name()) {
            pool.write_with_partition_key(partition_key, message.clone()).await?;
        }
        Ok(())
    }

    /// Sends an ackable message to every selected endpoint and waits for their acks. The result
    ///  is `true` if any endpoint applied the operation and `false` if all of them reported
    ///  `NotFound` or none could be reached.
    pub async fn write_ackable_message(&self, mut message: ServiceMessage, cancel: &CancellationToken) -> anyhow::Result<bool> {
        if message.ack_id().is_none() {
            return Err(RelayError::NotAckable(message.name()).into());
        }
        let targets = self.route(&message)?;

        let ack_handler = &self.deps.ack_handler;
        let waiter = ack_handler.create_multi_ack();
        let ack_id = waiter.ack_id();
        if let Err(e) = message.set_ack_id(ack_id) {
            ack_handler.discard(ack_id);
            return Err(e);
        }

        let mut num_sent = 0;
        for pool in self.connected_pools(&targets, message.name()) {
            if pool.try_write(message.clone()).await {
                num_sent += 1;
            }
        }

        if num_sent == 0 {
            ack_handler.discard(ack_id);
            warn!(hub = %self.hub, "{} message could not be sent to any service endpoint", message.name());
            return Ok(false);
        }

        ack_handler.set_expected_count(ack_id, num_sent)?;
        waiter.wait_for_write_result(cancel).await
    }

    /// sends a fin ping with the given mode through all pools and waits for the service to
    ///  acknowledge, bounded by the graceful shutdown timeout
    pub async fn offline(&self, mode: GracefulShutdownMode) {
        let mut pending = JoinSet::new();
        for entry in self.pools.load().values() {
            let pool = entry.container.clone();
            pending.spawn(async move { pool.offline(mode).await });
        }
        while pending.join_next().await.is_some() {}
    }

    /// Stops all pools for good. Endpoint changes are ignored from here on.
    pub async fn stop(&self) {
        self.terminated.cancel();

        let mut pending = JoinSet::new();
        for entry in self.pools.load().values() {
            let pool = entry.container.clone();
            pending.spawn(async move { pool.stop().await });
        }
        while pending.join_next().await.is_some() {}
        info!(hub = %self.hub, "service connections stopped");
    }

    /// Shuts down according to the configured graceful shutdown mode: with `Off` the pools are
    ///  stopped right away, otherwise the service is asked to take this server offline and client
    ///  connections get up to the graceful shutdown timeout to close or be migrated away.
    pub async fn shutdown(&self) {
        let graceful = &self.deps.config.graceful_shutdown;
        match graceful.mode {
            GracefulShutdownMode::Off => {}
            mode => {
                info!(hub = %self.hub, ?mode, "shutting down gracefully");
                let clients_gone = async {
                    self.offline(mode).await;
                    self.deps.client_connections.when_all_completed().await;
                };
                if timeout(graceful.timeout, clients_gone).await.is_err() {
                    warn!(hub = %self.hub, "{} client connections still open after {:?}, closing them", self.deps.client_connections.count(), graceful.timeout);
                }
            }
        }
        self.stop().await;
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time::Instant;

    use crate::config::ServiceOptions;
    use crate::endpoint::endpoint_router::{DefaultEndpointRouter, MockEndpointRouter};
    use crate::endpoint::service_endpoint::EndpointType;
    use crate::error::relay_error;
    use crate::protocol::service_messages::*;
    use crate::test_util::handler::{HandlerBehavior, HandlerEvent, TestConnectionHandler};
    use crate::test_util::service::{SimulatedService, TestConnectionFactory};
    use crate::util::random::SeededRandom;
    use super::*;

    struct Fixture {
        container: Arc<MultiEndpointContainer>,
        manager: Arc<ServiceEndpointManager>,
        handler: Arc<TestConnectionHandler>,
        factory: Arc<TestConnectionFactory>,
        service: SimulatedService,
    }

    fn endpoint(name: &str, endpoint_type: EndpointType) -> ServiceEndpoint {
        ServiceEndpoint::new(&format!("Endpoint=https://{}.example", name), endpoint_type, name).unwrap()
    }

    fn fixture_with_router(endpoints: &[(&str, EndpointType)], router: Arc<dyn EndpointRouter>, configure: impl FnOnce(&mut ServiceOptions)) -> Fixture {
        build_fixture(endpoints, router, HandlerBehavior::ReadUntilClosed, configure)
    }

    fn build_fixture(endpoints: &[(&str, EndpointType)], router: Arc<dyn EndpointRouter>, behavior: HandlerBehavior, configure: impl FnOnce(&mut ServiceOptions)) -> Fixture {
        let mut options = ServiceOptions::new();
        options.connection_count = 2;
        configure(&mut options);

        let (factory, service_sides) = TestConnectionFactory::new();
        let service = SimulatedService::start(service_sides);
        let handler = TestConnectionHandler::new(behavior);
        let deps = ServiceConnectionDeps::new(Arc::new(options), factory.clone(), handler.clone());

        let manager = Arc::new(ServiceEndpointManager::new(endpoints.iter()
            .map(|(name, t)| endpoint(name, *t))
            .collect()).unwrap());
        let container = MultiEndpointContainer::new("chat", deps, manager.clone(), router, Arc::new(SeededRandom::new(5)));
        Fixture { container, manager, handler, factory, service }
    }

    fn default_router() -> Arc<dyn EndpointRouter> {
        Arc::new(DefaultEndpointRouter::with_random(Arc::new(SeededRandom::new(9))))
    }

    fn fixture(endpoints: &[(&str, EndpointType)], configure: impl FnOnce(&mut ServiceOptions)) -> Fixture {
        fixture_with_router(endpoints, default_router(), configure)
    }

    async fn started(f: &Fixture) {
        f.container.start();
        f.container.wait_initialized().await;
    }

    fn current(f: &Fixture, name: &str) -> Arc<ServiceEndpoint> {
        f.container.endpoints().into_iter()
            .find(|e| e.name() == name)
            .unwrap()
    }

    fn payloads() -> BTreeMap<String, Bytes> {
        [("json".to_string(), Bytes::from_static(b"{\"x\":1}"))].into_iter().collect()
    }

    fn join_with_ack(connection_id: &str, group_name: &str) -> ServiceMessage {
        ServiceMessage::JoinGroupWithAck(GroupMembershipWithAckMessage {
            connection_id: connection_id.to_string(),
            group_name: group_name.to_string(),
            ack_id: 0,
        })
    }

    async fn open_client(f: &Fixture, endpoint_name: &str, client_id: &str) {
        f.service.open_client(endpoint_name, client_id).unwrap();
        f.handler.wait_for(|events| events.iter().any(|e| matches!(e, HandlerEvent::Connected { connection_id, .. } if connection_id == client_id))).await;
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        let waiting = async {
            while !condition() {
                time::sleep(Duration::from_millis(10)).await;
            }
        };
        if timeout(Duration::from_secs(10), waiting).await.is_err() {
            panic!("timed out waiting for {}", what);
        }
    }

    #[tokio::test]
    async fn test_broadcast_honors_exclusion_list() {
        let f = fixture(&[("a", EndpointType::Primary)], |_| {});
        started(&f).await;
        open_client(&f, "a", "c1").await;
        open_client(&f, "a", "c2").await;

        f.container.write(ServiceMessage::BroadcastData(BroadcastDataMessage {
            excluded_list: Some(vec!["c2".to_string()]),
            payloads: payloads(),
        })).await.unwrap();

        eventually("delivery to c1", || f.service.deliveries("c1") == 1).await;
        assert_eq!(f.service.deliveries("c2"), 0);
        f.container.stop().await;
    }

    #[tokio::test]
    async fn test_group_broadcast_reaches_members_only() {
        let f = fixture(&[("a", EndpointType::Primary)], |_| {});
        started(&f).await;
        open_client(&f, "a", "c1").await;
        open_client(&f, "a", "c2").await;

        f.container.write(ServiceMessage::JoinGroup(GroupMembershipMessage { connection_id: "c1".to_string(), group_name: "g1".to_string() })).await.unwrap();
        eventually("group membership", || f.service.group_members("g1").contains("c1")).await;

        f.container.write(ServiceMessage::GroupBroadcastData(GroupBroadcastDataMessage {
            group_name: "g1".to_string(),
            excluded_list: None,
            payloads: payloads(),
        })).await.unwrap();
        eventually("delivery to c1", || f.service.deliveries("c1") == 1).await;
        assert_eq!(f.service.deliveries("c2"), 0);
        f.container.stop().await;
    }

    #[tokio::test]
    async fn test_join_group_with_ack_while_disconnected() {
        let f = fixture(&[("a", EndpointType::Primary)], |_| {});
        f.factory.refuse("a", true);
        started(&f).await;

        let result = f.container.write_ackable_message(join_with_ack("c1", "g1"), &CancellationToken::new()).await;
        assert!(!result.unwrap());
        assert_eq!(f.container.deps.ack_handler.pending_count(), 0);
        f.container.stop().await;
    }

    #[tokio::test]
    async fn test_join_group_with_ack() {
        let f = fixture(&[("a", EndpointType::Primary)], |_| {});
        started(&f).await;
        open_client(&f, "a", "c1").await;

        assert!(f.container.write_ackable_message(join_with_ack("c1", "g1"), &CancellationToken::new()).await.unwrap());
        assert!(f.service.group_members("g1").contains("c1"));

        // unknown to the service
        assert!(!f.container.write_ackable_message(join_with_ack("c9", "g1"), &CancellationToken::new()).await.unwrap());
        f.container.stop().await;
    }

    #[rstest::rstest]
    #[case::any_ok_wins(AckStatus::NotFound, AckStatus::Ok, true)]
    #[case::ok_first(AckStatus::Ok, AckStatus::NotFound, true)]
    #[case::all_not_found(AckStatus::NotFound, AckStatus::NotFound, false)]
    #[tokio::test]
    async fn test_ack_fan_out_across_endpoints(#[case] status_a: AckStatus, #[case] status_b: AckStatus, #[case] expected: bool) {
        let f = fixture(&[("a", EndpointType::Primary), ("b", EndpointType::Secondary)], |_| {});
        started(&f).await;
        f.service.set_ack_status("a", Some(status_a));
        f.service.set_ack_status("b", Some(status_b));

        let result = f.container.write_ackable_message(join_with_ack("c1", "g1"), &CancellationToken::new()).await.unwrap();
        assert_eq!(result, expected);

        let num_sent = f.service.received_messages("a").len() + f.service.received_messages("b").len();
        assert_eq!(num_sent, 2);
        f.container.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_fan_out_times_out_if_an_endpoint_is_silent() {
        let f = fixture(&[("a", EndpointType::Primary), ("b", EndpointType::Primary)], |o| o.ack_timeout = Duration::from_secs(3));
        started(&f).await;
        f.service.set_ack_status("a", Some(AckStatus::NotFound));
        f.service.set_ack_status("b", None);

        let err = f.container.write_ackable_message(join_with_ack("c1", "g1"), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(relay_error(&err), Some(RelayError::AckTimeout(_))));
        f.container.stop().await;
    }

    #[tokio::test]
    async fn test_data_for_local_client_goes_through_owning_connection() {
        let mut router = MockEndpointRouter::new();
        router.expect_get_endpoints_for_connection().never();
        let f = fixture_with_router(&[("a", EndpointType::Primary)], Arc::new(router), |_| {});
        started(&f).await;
        open_client(&f, "a", "c1").await;

        f.container.write(ServiceMessage::ConnectionData(ConnectionDataMessage {
            connection_id: "c1".to_string(),
            payload: Bytes::from_static(b"hi"),
        })).await.unwrap();
        eventually("delivery to c1", || f.service.deliveries("c1") == 1).await;
        f.container.stop().await;
    }

    #[derive(Debug, thiserror::Error)]
    #[error("router is misconfigured")]
    struct BrokenRouter;

    #[tokio::test]
    async fn test_router_error_is_propagated_unchanged() {
        let mut router = MockEndpointRouter::new();
        router.expect_get_endpoints_for_broadcast()
            .returning(|_| Err(BrokenRouter.into()));
        router.expect_get_endpoints_for_connection()
            .returning(|_, _| Err(BrokenRouter.into()));
        let f = fixture_with_router(&[("a", EndpointType::Primary)], Arc::new(router), |_| {});

        let err = f.container.write(ServiceMessage::BroadcastData(BroadcastDataMessage { excluded_list: None, payloads: payloads() })).await.unwrap_err();
        assert!(err.downcast_ref::<BrokenRouter>().is_some());

        let err = f.container.write_ackable_message(join_with_ack("c1", "g1"), &CancellationToken::new()).await.unwrap_err();
        assert!(err.downcast_ref::<BrokenRouter>().is_some());
        assert_eq!(f.container.deps.ack_handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unroutable_message() {
        let f = fixture(&[("a", EndpointType::Primary)], |_| {});
        let err = f.container.write(ServiceMessage::Ack(AckMessage { ack_id: 1, status: AckStatus::Ok, message: None })).await.unwrap_err();
        assert_eq!(relay_error(&err), Some(&RelayError::UnroutableMessage("Ack")));
    }

    #[tokio::test]
    async fn test_negotiate_only_online_primary() {
        let f = fixture(&[("a", EndpointType::Secondary), ("b", EndpointType::Primary)], |_| {});
        assert!(f.container.negotiate_endpoint().unwrap().is_none());

        started(&f).await;
        for _ in 0..20 {
            assert_eq!(f.container.negotiate_endpoint().unwrap().unwrap().endpoint().name(), "b");
        }
        f.container.stop().await;
    }

    #[tokio::test]
    async fn test_online_state_is_per_hub() {
        let f = fixture(&[("a", EndpointType::Primary)], |_| {});
        let mut options = ServiceOptions::new();
        options.connection_count = 2;
        let news_deps = ServiceConnectionDeps::new(Arc::new(options), f.factory.clone(), f.handler.clone());
        let news = MultiEndpointContainer::new("news", news_deps, f.manager.clone(), default_router(), Arc::new(SeededRandom::new(6)));

        started(&f).await;
        news.start();
        news.wait_initialized().await;
        assert_eq!(news.negotiate_endpoint().unwrap().unwrap().hub(), "news");

        news.stop().await;
        assert!(news.negotiate_endpoint().unwrap().is_none());
        assert!(news.hub_endpoints().iter().all(|e| !e.is_online()));

        let selected = f.container.negotiate_endpoint().unwrap().unwrap();
        assert_eq!(selected.hub(), "chat");
        assert_eq!(selected.endpoint().name(), "a");
        assert!(selected.is_online());
        assert!(f.container.pool_for(selected.endpoint()).unwrap().has_connected());
        f.container.stop().await;
    }

    #[tokio::test]
    async fn test_stalled_client_does_not_hold_up_other_traffic() {
        let f = build_fixture(&[("a", EndpointType::Primary)], default_router(), HandlerBehavior::Stall("c1"), |o| {
            o.connection_count = 1;
            o.client_pipe_capacity = 4;
        });
        started(&f).await;
        open_client(&f, "a", "c1").await;
        open_client(&f, "a", "c2").await;

        for _ in 0..100 {
            f.service.send_to_endpoint("a", ServiceMessage::ConnectionData(ConnectionDataMessage {
                connection_id: "c1".to_string(),
                payload: Bytes::from_static(b"unread"),
            })).unwrap();
        }
        f.service.send_to_endpoint("a", ServiceMessage::ConnectionData(ConnectionDataMessage {
            connection_id: "c2".to_string(),
            payload: Bytes::from_static(b"hello"),
        })).unwrap();

        let cancel = CancellationToken::new();
        let joined = timeout(Duration::from_secs(5), f.container.write_ackable_message(join_with_ack("c2", "g1"), &cancel)).await
            .expect("ack held up by a stalled client");
        assert!(joined.unwrap());
        f.handler.wait_for(|events| events.contains(&HandlerEvent::Data { connection_id: "c2".to_string(), payload: Bytes::from_static(b"hello") })).await;

        eventually("close of the stalled client", || f.service.received_messages("a").iter()
            .any(|m| matches!(m, ServiceMessage::CloseConnection(c) if c.connection_id == "c1"))).await;
        f.container.stop().await;
    }

    #[tokio::test]
    async fn test_rename_and_retype_keep_pool() {
        let f = fixture(&[("a", EndpointType::Primary), ("b", EndpointType::Secondary)], |_| {});
        started(&f).await;
        let a = current(&f, "a");
        let b = current(&f, "b");
        let pool_a = f.container.pool_for(&a).unwrap();
        let pool_b = f.container.pool_for(&b).unwrap();

        f.manager.reload(vec![
            ServiceEndpoint::new("Endpoint=https://a.example", EndpointType::Primary, "a2").unwrap(),
            endpoint("b", EndpointType::Primary),
        ]).unwrap();
        tokio::task::yield_now().await;

        assert_eq!(a.name(), "a2");
        assert_eq!(b.endpoint_type(), EndpointType::Primary);
        assert!(Arc::ptr_eq(&pool_a, &f.container.pool_for(&a).unwrap()));
        assert!(Arc::ptr_eq(&pool_b, &f.container.pool_for(&b).unwrap()));
        assert_eq!(f.container.endpoints().len(), 2);
        assert!(pool_a.has_connected());
        f.container.stop().await;
    }

    #[tokio::test]
    async fn test_removed_endpoint_drains_until_inactive() {
        let f = fixture(&[("a", EndpointType::Primary), ("b", EndpointType::Primary)], |_| {});
        started(&f).await;
        let b = current(&f, "b");
        let pool_b = f.container.pool_for(&b).unwrap();

        f.manager.reload(vec![endpoint("a", EndpointType::Primary)]).unwrap();
        assert!(f.manager.negotiate_endpoints().iter().all(|e| e.id() != b.id()));

        // still serving its clients
        time::sleep(Duration::from_millis(200)).await;
        assert!(f.container.pool_for(&b).is_some());
        assert!(pool_b.has_connected());

        f.service.send_to_all("b", ServiceMessage::Ping(PingMessage::status(false)));
        eventually("removal of endpoint b", || f.container.pool_for(&b).is_none()).await;
        assert!(pool_b.is_stopped());
        assert_eq!(f.container.endpoints().len(), 1);
        f.container.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_endpoint_is_dropped_after_reload_timeout() {
        let f = fixture(&[("a", EndpointType::Primary), ("b", EndpointType::Primary)], |o| o.endpoint_reload_timeout = Duration::from_secs(20));
        started(&f).await;
        let b = current(&f, "b");

        let reloaded = Instant::now();
        f.manager.reload(vec![endpoint("a", EndpointType::Primary)]).unwrap();
        time::sleep(Duration::from_secs(19)).await;
        assert!(f.container.pool_for(&b).is_some());

        eventually("removal of endpoint b", || f.container.pool_for(&b).is_none()).await;
        assert!(reloaded.elapsed() >= Duration::from_secs(20));
        f.container.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_added_endpoint_is_promoted_after_grace_period() {
        let f = fixture(&[("a", EndpointType::Primary)], |o| o.endpoint_promotion_grace_period = Duration::from_secs(30));
        started(&f).await;

        f.manager.reload(vec![endpoint("a", EndpointType::Primary), endpoint("b", EndpointType::Primary)]).unwrap();
        let b = f.manager.endpoints().iter().find(|e| e.name() == "b").unwrap().clone();
        assert!(b.is_staging());

        eventually("pool for endpoint b", || f.container.pool_for(&b).map(|p| p.has_connected()).unwrap_or(false)).await;
        assert!(f.manager.negotiate_endpoints().iter().all(|e| e.id() != b.id()));

        time::sleep(Duration::from_secs(31)).await;
        assert!(!b.is_staging());
        assert!(f.manager.negotiate_endpoints().iter().any(|e| e.id() == b.id()));
        f.container.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotion_waits_for_servers() {
        let f = fixture(&[("a", EndpointType::Primary)], |o| {
            o.endpoint_promotion_grace_period = Duration::from_secs(10);
            o.require_servers_for_promotion = true;
            o.servers_ping_interval = Duration::from_secs(5);
        });
        started(&f).await;

        f.manager.reload(vec![endpoint("a", EndpointType::Primary), endpoint("b", EndpointType::Primary)]).unwrap();
        let b = f.manager.endpoints().iter().find(|e| e.name() == "b").unwrap().clone();

        time::sleep(Duration::from_secs(30)).await;
        assert!(b.is_staging());

        f.service.set_servers("b", &["server-1"]);
        time::sleep(Duration::from_secs(6)).await;
        assert!(!b.is_staging());
        f.container.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_clients_bounded_by_timeout() {
        let f = fixture(&[("a", EndpointType::Primary)], |o| {
            o.graceful_shutdown.mode = GracefulShutdownMode::WaitForClientsClose;
            o.graceful_shutdown.timeout = Duration::from_secs(8);
        });
        started(&f).await;
        open_client(&f, "a", "c1").await;

        let started_at = Instant::now();
        f.container.shutdown().await;
        assert!(started_at.elapsed() >= Duration::from_secs(8));
        assert_eq!(f.container.deps.client_connections.count(), 0);

        let fins = f.service.received().into_iter()
            .filter(|(_, m)| matches!(m, ServiceMessage::Ping(p) if p.fin_mode() == Some(GracefulShutdownMode::WaitForClientsClose)))
            .count();
        assert_eq!(fins, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_with_migration_completes_when_clients_migrated() {
        let f = fixture(&[("a", EndpointType::Primary)], |o| {
            o.graceful_shutdown.mode = GracefulShutdownMode::MigrateClients;
            o.graceful_shutdown.timeout = Duration::from_secs(30);
        });
        started(&f).await;
        open_client(&f, "a", "c1").await;

        let container = f.container.clone();
        let started_at = Instant::now();
        let shutdown = tokio::spawn(async move { container.shutdown().await });

        eventually("fin ping", || f.service.received().iter()
            .any(|(_, m)| matches!(m, ServiceMessage::Ping(p) if p.fin_mode().is_some()))).await;
        f.service.send_to_all("a", ServiceMessage::CloseConnection(CloseConnectionMessage {
            connection_id: "c1".to_string(),
            error_message: None,
            headers: [(MIGRATE_TO_HEADER.to_string(), "server-2".to_string())].into_iter().collect(),
        }));

        shutdown.await.unwrap();
        assert!(started_at.elapsed() < Duration::from_secs(30));
        assert!(!f.handler.events().iter().any(|e| matches!(e, HandlerEvent::Closed { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_off_stops_immediately() {
        let f = fixture(&[("a", EndpointType::Primary)], |_| {});
        started(&f).await;
        f.container.shutdown().await;
        assert!(f.container.hub_endpoints().iter().all(|e| !e.is_online()));
        assert!(f.service.received().iter().all(|(_, m)| !matches!(m, ServiceMessage::Ping(p) if p.fin_mode().is_some())));
    }
}
