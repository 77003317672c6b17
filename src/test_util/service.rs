use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connection::connection_factory::{ConnectionFactory, ServiceStream};
use crate::endpoint::service_endpoint::HubServiceEndpoint;
use crate::protocol::service_messages::*;
use crate::protocol::service_protocol::{encode, try_decode};

const DUPLEX_BUFFER_SIZE: usize = 64 * 1024;


/// [ConnectionFactory] backed by in-memory streams. The service end of every stream it opens
///  is handed out through the receiver returned by [TestConnectionFactory::new].
pub struct TestConnectionFactory {
    service_sides: mpsc::UnboundedSender<ServiceSide>,
    refused: Mutex<FxHashSet<String>>,
}

impl TestConnectionFactory {
    pub fn new() -> (Arc<TestConnectionFactory>, mpsc::UnboundedReceiver<ServiceSide>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let factory = Arc::new(TestConnectionFactory {
            service_sides: sender,
            refused: Mutex::new(FxHashSet::default()),
        });
        (factory, receiver)
    }

    /// make connects to the endpoint with the given name fail (or succeed again)
    pub fn refuse(&self, endpoint_name: &str, refuse: bool) {
        let mut refused = self.refused.lock().unwrap_or_else(|e| e.into_inner());
        if refuse {
            refused.insert(endpoint_name.to_string());
        }
        else {
            refused.remove(endpoint_name);
        }
    }
}

#[async_trait]
impl ConnectionFactory for TestConnectionFactory {
    async fn connect(&self, endpoint: &HubServiceEndpoint, connection_id: &str) -> anyhow::Result<Box<dyn ServiceStream>> {
        let endpoint_name = endpoint.endpoint().name();
        if self.refused.lock().unwrap_or_else(|e| e.into_inner()).contains(&endpoint_name) {
            return Err(anyhow!("connection to {} refused", endpoint_name));
        }

        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
        self.service_sides.send(ServiceSide::new(&endpoint_name, connection_id, remote))
            .map_err(|_| anyhow!("no service listening"))?;
        Ok(Box::new(local))
    }
}

/// The service's end of one physical connection, for scripting the service in tests
pub struct ServiceSide {
    pub endpoint_name: String,
    pub connection_id: String,
    stream: DuplexStream,
    buf: BytesMut,
}

impl ServiceSide {
    fn new(endpoint_name: &str, connection_id: &str, stream: DuplexStream) -> ServiceSide {
        ServiceSide {
            endpoint_name: endpoint_name.to_string(),
            connection_id: connection_id.to_string(),
            stream,
            buf: BytesMut::new(),
        }
    }

    /// next message from the server, `None` when the stream is closed
    pub async fn read_message(&mut self) -> anyhow::Result<Option<ServiceMessage>> {
        loop {
            if let Some((message, consumed)) = try_decode(&self.buf)? {
                self.buf.advance(consumed);
                return Ok(Some(message));
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Ok(None);
            }
        }
    }

    /// next message that is not a keep-alive ping
    pub async fn read_non_ping(&mut self) -> anyhow::Result<Option<ServiceMessage>> {
        loop {
            match self.read_message().await? {
                Some(ServiceMessage::Ping(ping)) if ping.is_keep_alive() => continue,
                other => return Ok(other),
            }
        }
    }

    pub async fn write_message(&mut self, message: &ServiceMessage) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        encode(message, &mut buf);
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    async fn read_handshake(&mut self) -> anyhow::Result<HandshakeRequest> {
        match self.read_message().await? {
            Some(ServiceMessage::Handshake(request)) => Ok(request),
            other => Err(anyhow!("expected handshake, got {:?}", other)),
        }
    }

    pub async fn accept_handshake(&mut self) -> anyhow::Result<HandshakeRequest> {
        let request = self.read_handshake().await?;
        self.write_message(&ServiceMessage::HandshakeResponse(HandshakeResponse {
            error_message: String::new(),
            connection_id: Some(self.connection_id.clone()),
        })).await?;
        Ok(request)
    }

    pub async fn reject_handshake(&mut self, error_message: &str) -> anyhow::Result<HandshakeRequest> {
        let request = self.read_handshake().await?;
        self.write_message(&ServiceMessage::HandshakeResponse(HandshakeResponse {
            error_message: error_message.to_string(),
            connection_id: None,
        })).await?;
        Ok(request)
    }
}

struct SimulatedConnection {
    endpoint_name: String,
    connection_id: String,
    outbound: mpsc::UnboundedSender<ServiceMessage>,
    closed: CancellationToken,
}

#[derive(Default)]
struct SimulatedState {
    connections: Vec<SimulatedConnection>,
    /// (endpoint name, connection id, message)
    received: Vec<(String, String, ServiceMessage)>,
    /// client connection id -> endpoint name
    clients: BTreeMap<String, String>,
    groups: BTreeMap<String, BTreeSet<String>>,
    deliveries: BTreeMap<String, usize>,
    /// `None` means acks are not answered at all
    ack_statuses: FxHashMap<String, Option<AckStatus>>,
    servers: FxHashMap<String, Vec<String>>,
    silent_fin: FxHashSet<String>,
}

impl SimulatedState {
    fn deliver_to(&mut self, client_ids: impl IntoIterator<Item=String>) {
        for client_id in client_ids {
            *self.deliveries.entry(client_id).or_default() += 1;
        }
    }

    /// clients of an endpoint minus the excluded ones
    fn endpoint_clients(&self, endpoint_name: &str, candidates: Option<&BTreeSet<String>>, excluded: Option<&Vec<String>>) -> Vec<String> {
        self.clients.iter()
            .filter(|(_, e)| e.as_str() == endpoint_name)
            .map(|(c, _)| c)
            .filter(|c| candidates.map(|cs| cs.contains(*c)).unwrap_or(true))
            .filter(|c| !excluded.map(|ex| ex.contains(*c)).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// updates the simulated client state and returns the reply, if any
    fn on_message(&mut self, endpoint_name: &str, message: &ServiceMessage) -> Option<ServiceMessage> {
        match message {
            ServiceMessage::Ping(ping) => {
                if ping.fin_mode().is_some() && !self.silent_fin.contains(endpoint_name) {
                    return Some(ServiceMessage::Ping(PingMessage::fin_ack()));
                }
                if ping.is_servers_request() {
                    let servers = self.servers.get(endpoint_name).cloned().unwrap_or_default();
                    let servers = servers.iter().map(String::as_str).collect::<Vec<_>>();
                    return Some(ServiceMessage::Ping(PingMessage::servers(&servers)));
                }
            }
            ServiceMessage::ConnectionData(m) => {
                if self.clients.contains_key(&m.connection_id) {
                    self.deliver_to([m.connection_id.clone()]);
                }
            }
            ServiceMessage::BroadcastData(m) => {
                let targets = self.endpoint_clients(endpoint_name, None, m.excluded_list.as_ref());
                self.deliver_to(targets);
            }
            ServiceMessage::GroupBroadcastData(m) => {
                let members = self.groups.get(&m.group_name).cloned().unwrap_or_default();
                let targets = self.endpoint_clients(endpoint_name, Some(&members), m.excluded_list.as_ref());
                self.deliver_to(targets);
            }
            ServiceMessage::CloseConnection(m) => {
                self.clients.remove(&m.connection_id);
            }
            ServiceMessage::JoinGroup(m) => {
                self.groups.entry(m.group_name.clone()).or_default().insert(m.connection_id.clone());
            }
            ServiceMessage::LeaveGroup(m) => {
                if let Some(members) = self.groups.get_mut(&m.group_name) {
                    members.remove(&m.connection_id);
                }
            }
            ServiceMessage::JoinGroupWithAck(m) | ServiceMessage::LeaveGroupWithAck(m) => {
                let status = match self.ack_statuses.get(endpoint_name) {
                    Some(None) => return None,
                    Some(Some(status)) => *status,
                    None if self.clients.get(&m.connection_id).map(|e| e == endpoint_name).unwrap_or(false) => AckStatus::Ok,
                    None => AckStatus::NotFound,
                };
                if status == AckStatus::Ok {
                    let members = self.groups.entry(m.group_name.clone()).or_default();
                    if matches!(message, ServiceMessage::JoinGroupWithAck(_)) {
                        members.insert(m.connection_id.clone());
                    }
                    else {
                        members.remove(&m.connection_id);
                    }
                }
                return Some(ServiceMessage::Ack(AckMessage { ack_id: m.ack_id, status, message: None }));
            }
            _ => {}
        }
        None
    }
}

/// Plays the relay service for all streams opened through a [TestConnectionFactory]: accepts
///  handshakes, sends keep-alives, answers acks, fin and servers pings, and keeps track of
///  simulated clients so tests can observe what reached which client.
pub struct SimulatedService {
    state: Arc<Mutex<SimulatedState>>,
    acceptor: JoinHandle<()>,
}

impl SimulatedService {
    const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

    pub fn start(mut service_sides: mpsc::UnboundedReceiver<ServiceSide>) -> SimulatedService {
        let state = Arc::new(Mutex::new(SimulatedState::default()));

        let acceptor = tokio::spawn({
            let state = state.clone();
            async move {
                while let Some(side) = service_sides.recv().await {
                    let (outbound, receiver) = mpsc::unbounded_channel();
                    let closed = CancellationToken::new();
                    Self::lock_state(&state).connections.push(SimulatedConnection {
                        endpoint_name: side.endpoint_name.clone(),
                        connection_id: side.connection_id.clone(),
                        outbound,
                        closed: closed.clone(),
                    });
                    tokio::spawn(Self::serve(state.clone(), side, receiver, closed));
                }
            }
        });

        SimulatedService {
            state,
            acceptor,
        }
    }

    fn lock_state(state: &Mutex<SimulatedState>) -> std::sync::MutexGuard<'_, SimulatedState> {
        state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        Self::lock_state(&self.state)
    }

    async fn serve(state: Arc<Mutex<SimulatedState>>, mut side: ServiceSide, mut outbound: mpsc::UnboundedReceiver<ServiceMessage>, closed: CancellationToken) {
        if side.accept_handshake().await.is_err() {
            closed.cancel();
            return;
        }
        let endpoint_name = side.endpoint_name.clone();
        let connection_id = side.connection_id.clone();
        let mut keep_alive = time::interval(Self::KEEP_ALIVE_INTERVAL);

        loop {
            let reply = tokio::select! {
                _ = closed.cancelled() => break,
                _ = keep_alive.tick() => Some(ServiceMessage::Ping(PingMessage::keep_alive())),
                message = outbound.recv() => message,
                message = side.read_message() => match message {
                    Ok(Some(message)) => {
                        trace!(endpoint = %endpoint_name, message = message.name(), "simulated service received message");
                        let mut state = Self::lock_state(&state);
                        let reply = state.on_message(&endpoint_name, &message);
                        state.received.push((endpoint_name.clone(), connection_id.clone(), message));
                        reply
                    }
                    _ => break,
                },
            };
            if let Some(reply) = reply {
                if side.write_message(&reply).await.is_err() {
                    break;
                }
            }
        }

        debug!(endpoint = %endpoint_name, connection_id = %side.connection_id, "simulated service connection closed");
        closed.cancel();
    }

    fn open_connections(&self, endpoint_name: &str) -> Vec<(String, mpsc::UnboundedSender<ServiceMessage>)> {
        self.state().connections.iter()
            .filter(|c| c.endpoint_name == endpoint_name && !c.closed.is_cancelled())
            .map(|c| (c.connection_id.clone(), c.outbound.clone()))
            .collect()
    }

    /// number of live physical connections to the endpoint
    pub fn connection_count(&self, endpoint_name: &str) -> usize {
        self.open_connections(endpoint_name).len()
    }

    /// total number of physical connections ever opened to the endpoint
    pub fn total_connection_count(&self, endpoint_name: &str) -> usize {
        self.state().connections.iter()
            .filter(|c| c.endpoint_name == endpoint_name)
            .count()
    }

    /// Waits until the endpoint has at least `count` live connections, panicking after ten
    ///  seconds
    pub async fn wait_for_connections(&self, endpoint_name: &str, count: usize) {
        let waiting = async {
            while self.connection_count(endpoint_name) < count {
                time::sleep(Duration::from_millis(10)).await;
            }
        };
        if time::timeout(Duration::from_secs(10), waiting).await.is_err() {
            panic!("expected {} connections to {}, got {}", count, endpoint_name, self.connection_count(endpoint_name));
        }
    }

    /// sends a message through the first live connection to the endpoint
    pub fn send_to_endpoint(&self, endpoint_name: &str, message: ServiceMessage) -> anyhow::Result<()> {
        let (_, outbound) = self.open_connections(endpoint_name).into_iter().next()
            .ok_or_else(|| anyhow!("no connection to {}", endpoint_name))?;
        outbound.send(message)
            .map_err(|_| anyhow!("connection to {} closed", endpoint_name))
    }

    /// sends a message through every live connection to the endpoint
    pub fn send_to_all(&self, endpoint_name: &str, message: ServiceMessage) {
        for (_, outbound) in self.open_connections(endpoint_name) {
            let _ = outbound.send(message.clone());
        }
    }

    /// Simulates a client connecting through the endpoint
    pub fn open_client(&self, endpoint_name: &str, client_id: &str) -> anyhow::Result<()> {
        self.send_to_endpoint(endpoint_name, ServiceMessage::OpenConnection(OpenConnectionMessage {
            connection_id: client_id.to_string(),
            claims: vec![],
            headers: BTreeMap::new(),
            query_string: None,
        }))?;
        self.state().clients.insert(client_id.to_string(), endpoint_name.to_string());
        Ok(())
    }

    /// `None` makes the endpoint swallow ackable messages without answering. Without an
    ///  explicit status the endpoint answers `Ok` for its own clients and `NotFound` otherwise.
    pub fn set_ack_status(&self, endpoint_name: &str, status: Option<AckStatus>) {
        self.state().ack_statuses.insert(endpoint_name.to_string(), status);
    }

    pub fn set_servers(&self, endpoint_name: &str, servers: &[&str]) {
        self.state().servers.insert(endpoint_name.to_string(), servers.iter().map(|s| s.to_string()).collect());
    }

    /// stop answering fin pings for the endpoint
    pub fn ignore_fin(&self, endpoint_name: &str) {
        self.state().silent_fin.insert(endpoint_name.to_string());
    }

    /// closes all live connections to the endpoint from the service side
    pub fn drop_connections(&self, endpoint_name: &str) {
        for c in self.state().connections.iter().filter(|c| c.endpoint_name == endpoint_name) {
            c.closed.cancel();
        }
    }

    /// everything received so far with the name of the endpoint it was sent to
    pub fn received(&self) -> Vec<(String, ServiceMessage)> {
        self.state().received.iter()
            .map(|(e, _, m)| (e.clone(), m.clone()))
            .collect()
    }

    /// received messages other than pings
    pub fn received_messages(&self, endpoint_name: &str) -> Vec<ServiceMessage> {
        self.state().received.iter()
            .filter(|(e, _, m)| e == endpoint_name && !matches!(m, ServiceMessage::Ping(_)))
            .map(|(_, _, m)| m.clone())
            .collect()
    }

    /// ids of the physical connections that carried messages other than pings
    pub fn data_connection_ids(&self, endpoint_name: &str) -> BTreeSet<String> {
        self.state().received.iter()
            .filter(|(e, _, m)| e == endpoint_name && !matches!(m, ServiceMessage::Ping(_)))
            .map(|(_, c, _)| c.clone())
            .collect()
    }

    pub fn deliveries(&self, client_id: &str) -> usize {
        self.state().deliveries.get(client_id).copied().unwrap_or(0)
    }

    pub fn group_members(&self, group_name: &str) -> BTreeSet<String> {
        self.state().groups.get(group_name).cloned().unwrap_or_default()
    }
}

impl Drop for SimulatedService {
    fn drop(&mut self) {
        self.acceptor.abort();
        for c in &self.state().connections {
            c.closed.cancel();
        }
    }
}
