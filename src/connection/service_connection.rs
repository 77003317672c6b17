use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::ack::ack_handler::AckHandler;
use crate::config::{GracefulShutdownMode, ServiceOptions};
use crate::connection::client_connection::{ClientConnectionContext, Delivery, ServiceConnectionHandle};
use crate::connection::client_connection_manager::ClientConnectionManager;
use crate::connection::connection_factory::ConnectionFactory;
use crate::connection::connection_handler::ConnectionHandler;
use crate::endpoint::service_endpoint::HubServiceEndpoint;
use crate::error::RelayError;
use crate::protocol::service_messages::*;
use crate::protocol::service_protocol::{encode, try_decode};

const OUTBOUND_CAPACITY: usize = 1024;
const READ_BUFFER_CAPACITY: usize = 16 * 1024;


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ServiceConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Observer of a physical connection, implemented by whatever aggregates the status of an
///  endpoint
#[cfg_attr(test, mockall::automock)]
pub trait ServiceEventHandler: Send + Sync + 'static {
    fn on_status_changed(&self, connection_id: &str, old: ServiceConnectionStatus, new: ServiceConnectionStatus);
    fn on_ping(&self, connection_id: &str, ping: &PingMessage);
}

/// Everything the physical connections of a hub share
pub struct ServiceConnectionDeps {
    pub config: Arc<ServiceOptions>,
    pub factory: Arc<dyn ConnectionFactory>,
    pub handler: Arc<dyn ConnectionHandler>,
    pub client_connections: Arc<ClientConnectionManager>,
    pub ack_handler: Arc<AckHandler>,
}

impl ServiceConnectionDeps {
    /// Wires up a fresh registry and ack handler. Spawns the ack handler's sweeper, so this
    ///  needs a tokio runtime.
    pub fn new(config: Arc<ServiceOptions>, factory: Arc<dyn ConnectionFactory>, handler: Arc<dyn ConnectionHandler>) -> Arc<ServiceConnectionDeps> {
        let ack_handler = AckHandler::new(config.ack_timeout);
        Arc::new(ServiceConnectionDeps {
            config,
            factory,
            handler,
            client_connections: Arc::new(ClientConnectionManager::new()),
            ack_handler,
        })
    }
}

/// One physical connection to a service endpoint, carrying any number of client connections.
///
/// A `ServiceConnection` runs a single session: connect, handshake, then read and write loops
///  until the stream ends, fails or the connection is stopped. Reconnecting means creating a
///  new instance, which is the pool's business.
pub struct ServiceConnection {
    connection_id: String,
    hub_endpoint: Arc<HubServiceEndpoint>,
    deps: Arc<ServiceConnectionDeps>,
    events: Arc<dyn ServiceEventHandler>,

    status: watch::Sender<ServiceConnectionStatus>,
    initialized: watch::Sender<Option<bool>>,
    finished: watch::Sender<bool>,
    fin_acked: watch::Sender<bool>,

    outbound: Mutex<Option<mpsc::Sender<ServiceMessage>>>,
    stop: CancellationToken,
    started: AtomicBool,
    was_connected: AtomicBool,
}

impl ServiceConnection {
    pub fn new(hub_endpoint: Arc<HubServiceEndpoint>, deps: Arc<ServiceConnectionDeps>, events: Arc<dyn ServiceEventHandler>) -> Arc<ServiceConnection> {
        Arc::new(ServiceConnection {
            connection_id: Uuid::new_v4().to_string(),
            hub_endpoint,
            deps,
            events,
            status: watch::channel(ServiceConnectionStatus::Disconnected).0,
            initialized: watch::channel(None).0,
            finished: watch::channel(false).0,
            fin_acked: watch::channel(false).0,
            outbound: Mutex::new(None),
            stop: CancellationToken::new(),
            started: AtomicBool::new(false),
            was_connected: AtomicBool::new(false),
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn hub_endpoint(&self) -> &Arc<HubServiceEndpoint> {
        &self.hub_endpoint
    }

    pub fn status(&self) -> ServiceConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ServiceConnectionStatus::Connected
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// the handshake succeeded at some point
    pub fn was_connected(&self) -> bool {
        self.was_connected.load(Ordering::Acquire)
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ServiceConnectionStatus> {
        self.status.subscribe()
    }

    /// Starts the session. Returns `None` if it was started before: an instance runs once.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(tokio::spawn(self.clone().run()))
    }

    /// Requests the session to end. No-op if it is not running.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves with `true` once the handshake succeeded, or `false` once the first connect
    ///  attempt failed for good
    pub async fn wait_initialized(&self) -> bool {
        let mut receiver = self.initialized.subscribe();
        let initialized = receiver.wait_for(|v| v.is_some()).await
            .map(|v| v.unwrap_or(false))
            .unwrap_or(false);
        initialized
    }

    /// resolves once the session is over (or immediately if it never started and was stopped)
    pub async fn wait_finished(&self) {
        if !self.is_started() && self.is_stopped() {
            return;
        }
        let mut receiver = self.finished.subscribe();
        let _ = receiver.wait_for(|finished| *finished).await;
    }

    /// resolves once the service acknowledged a fin ping on this connection
    pub async fn wait_fin_ack(&self) {
        let mut receiver = self.fin_acked.subscribe();
        let _ = receiver.wait_for(|acked| *acked).await;
    }

    pub fn handle(&self) -> Option<ServiceConnectionHandle> {
        self.outbound.lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|sender| ServiceConnectionHandle::new(&self.connection_id, sender.clone()))
    }

    pub async fn write(&self, message: ServiceMessage) -> anyhow::Result<()> {
        match self.handle() {
            Some(handle) => handle.send(message).await,
            None => Err(RelayError::NotConnected.into()),
        }
    }

    /// asks the service to take this connection offline
    pub async fn send_fin(&self, mode: GracefulShutdownMode) -> anyhow::Result<()> {
        self.fin_acked.send_replace(false);
        self.write(ServiceMessage::Ping(PingMessage::fin(mode))).await
    }

    fn set_status(&self, new: ServiceConnectionStatus) {
        let old = self.status.send_replace(new);
        if old != new {
            trace!(connection_id = %self.connection_id, ?old, ?new, "status changed");
            self.events.on_status_changed(&self.connection_id, old, new);
        }
    }

    async fn run(self: Arc<Self>) {
        match self.run_session().await {
            Ok(()) => info!(connection_id = %self.connection_id, endpoint = %self.hub_endpoint, "service connection closed"),
            Err(e) => warn!(connection_id = %self.connection_id, endpoint = %self.hub_endpoint, "service connection failed: {:#}", e),
        }

        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.set_status(ServiceConnectionStatus::Disconnected);
        self.initialized.send_if_modified(|v| {
            if v.is_none() {
                *v = Some(false);
                true
            }
            else {
                false
            }
        });
        self.finished.send_replace(true);
    }

    #[instrument(name = "service_connection", skip_all, fields(connection_id = %self.connection_id, endpoint = %self.hub_endpoint))]
    async fn run_session(&self) -> anyhow::Result<()> {
        self.set_status(ServiceConnectionStatus::Connecting);

        let stream = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return Ok(()),
            stream = self.deps.factory.connect(&self.hub_endpoint, &self.connection_id) => stream?,
        };
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);

        let handshake_timeout = self.deps.config.handshake_timeout;
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => return Ok(()),
            result = timeout(handshake_timeout, self.handshake(&mut reader, &mut writer, &mut read_buf)) => {
                result.map_err(|_| RelayError::HandshakeTimeout)??;
            }
        }

        let (sender, receiver) = mpsc::channel(OUTBOUND_CAPACITY);
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(sender);
        self.was_connected.store(true, Ordering::Release);
        self.set_status(ServiceConnectionStatus::Connected);
        self.initialized.send_replace(Some(true));
        info!("service connection established");

        let result = tokio::select! {
            r = self.read_loop(&mut reader, &mut read_buf) => r,
            r = self.write_loop(&mut writer, receiver) => r,
            _ = self.stop.cancelled() => {
                debug!("stop requested");
                Ok(())
            }
        };

        // no new messages for this connection from here on
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.set_status(ServiceConnectionStatus::Disconnected);
        let _ = writer.shutdown().await;

        self.close_client_connections().await;
        result
    }

    async fn handshake<R, W>(&self, reader: &mut R, writer: &mut W, buf: &mut BytesMut) -> anyhow::Result<HandshakeResponse>
    where R: AsyncRead + Unpin, W: AsyncWrite + Unpin
    {
        let config = &self.deps.config;
        let migration_level = match config.graceful_shutdown.mode {
            GracefulShutdownMode::MigrateClients => MigrationLevel::ShutdownOnly,
            _ => MigrationLevel::Off,
        };
        let request = ServiceMessage::Handshake(HandshakeRequest {
            version: PROTOCOL_VERSION,
            hub: config.wire_hub_name(self.hub_endpoint.hub()),
            server_id: config.server_id.clone(),
            connection_type: ConnectionType::Default,
            migration_level,
        });

        let mut out = BytesMut::new();
        encode(&request, &mut out);
        writer.write_all(&out).await?;
        writer.flush().await?;

        loop {
            while let Some((message, consumed)) = try_decode(buf)? {
                buf.advance(consumed);
                match message {
                    ServiceMessage::HandshakeResponse(response) => {
                        if !response.error_message.is_empty() {
                            return Err(RelayError::HandshakeRejected(response.error_message).into());
                        }
                        return Ok(response);
                    }
                    ServiceMessage::Ping(_) => {}
                    other => return Err(anyhow::anyhow!("unexpected {} message during handshake", other.name())),
                }
            }

            if reader.read_buf(buf).await? == 0 {
                return Err(anyhow::anyhow!("service closed the stream during handshake"));
            }
        }
    }

    async fn read_loop<R: AsyncRead + Unpin>(&self, reader: &mut R, buf: &mut BytesMut) -> anyhow::Result<()> {
        let server_timeout = self.deps.config.server_timeout;
        loop {
            while let Some((message, consumed)) = try_decode(buf)? {
                buf.advance(consumed);
                self.dispatch(message)?;
            }

            let num_read = timeout(server_timeout, reader.read_buf(buf)).await
                .map_err(|_| RelayError::ServerTimeout(server_timeout))??;
            if num_read == 0 {
                debug!("service closed the stream");
                return Ok(());
            }
        }
    }

    async fn write_loop<W: AsyncWrite + Unpin>(&self, writer: &mut W, mut receiver: mpsc::Receiver<ServiceMessage>) -> anyhow::Result<()> {
        let keep_alive_interval = self.deps.config.keep_alive_interval;
        let mut keep_alive = time::interval_at(Instant::now() + keep_alive_interval, keep_alive_interval);
        keep_alive.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut buf = BytesMut::new();

        loop {
            tokio::select! {
                message = receiver.recv() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    encode(&message, &mut buf);
                    // coalesce whatever else is queued into the same write
                    while let Ok(message) = receiver.try_recv() {
                        encode(&message, &mut buf);
                    }
                    keep_alive.reset();
                }
                _ = keep_alive.tick() => {
                    trace!("sending keep-alive ping");
                    encode(&ServiceMessage::Ping(PingMessage::keep_alive()), &mut buf);
                }
            }

            writer.write_all(&buf).await?;
            writer.flush().await?;
            buf.clear();
        }
    }

    /// Handles one inbound message. This never waits: a single slow client connection must not
    ///  hold up the others on this connection.
    fn dispatch(&self, message: ServiceMessage) -> anyhow::Result<()> {
        trace!(message = message.name(), "received message");
        match message {
            ServiceMessage::OpenConnection(m) => self.on_open_connection(m),
            ServiceMessage::CloseConnection(m) => self.on_close_connection(m),
            ServiceMessage::ConnectionData(m) => self.on_connection_data(m),
            ServiceMessage::Ack(m) => {
                self.deps.ack_handler.trigger_ack_with_status(m.ack_id, m.status);
            }
            ServiceMessage::Ping(m) => {
                if m.is_fin_ack() {
                    debug!("service acknowledged offline request");
                    self.fin_acked.send_replace(true);
                }
                self.events.on_ping(&self.connection_id, &m);
            }
            ServiceMessage::ServiceError(m) => {
                return Err(RelayError::ServiceError(m.error_message).into());
            }
            other => {
                warn!("ignoring unexpected {} message from service", other.name());
            }
        }
        Ok(())
    }

    fn on_open_connection(&self, message: OpenConnectionMessage) {
        let Some(owner) = self.handle() else {
            warn!(connection_id = %message.connection_id, "client connection opened on a closing service connection, ignoring");
            return;
        };

        let deps = &self.deps;
        let (context, connection) = ClientConnectionContext::new(&message, owner, deps.config.client_pipe_capacity);
        match message.headers.get(MIGRATE_FROM_HEADER) {
            Some(from) => info!(client_connection_id = %message.connection_id, from = %from, "client connection migrated in"),
            None => debug!(client_connection_id = %message.connection_id, "client connection opened"),
        }

        deps.client_connections.add(context.clone());
        context.spawn_application(deps.handler.clone(), connection, deps.client_connections.clone());
    }

    fn on_close_connection(&self, message: CloseConnectionMessage) {
        let Some(context) = self.deps.client_connections.try_get(&message.connection_id) else {
            debug!(client_connection_id = %message.connection_id, "close for unknown client connection");
            return;
        };

        context.mark_closing();
        match message.headers.get(MIGRATE_TO_HEADER) {
            Some(to) => {
                info!(client_connection_id = %message.connection_id, to = %to, "client connection migrated out");
                context.mark_migrated_out();
                context.close_inbound(None, false);
            }
            None => {
                debug!(client_connection_id = %message.connection_id, "client connection closed by service");
                context.close_inbound(message.error_message, true);
            }
        }

        tokio::spawn(drain_client_connection(context, self.deps.client_connections.clone(), self.deps.config.close_timeout));
    }

    fn on_connection_data(&self, message: ConnectionDataMessage) {
        let Some(context) = self.deps.client_connections.try_get(&message.connection_id) else {
            debug!(client_connection_id = %message.connection_id, "data for unknown client connection");
            return;
        };

        match context.deliver(message.payload) {
            Delivery::Delivered => {}
            Delivery::Closed => debug!(client_connection_id = %message.connection_id, "client connection does not accept data any more"),
            Delivery::Full => {
                warn!(client_connection_id = %message.connection_id, "application does not keep up with client connection, closing it");
                context.abort_unresponsive("application does not keep up with the client");
            }
        }
    }

    /// Ends all client connections carried by this connection, giving each application a
    ///  bounded time to finish
    async fn close_client_connections(&self) {
        let owned = self.deps.client_connections.connections().into_iter()
            .filter(|c| c.owner().connection_id() == self.connection_id)
            .collect::<Vec<_>>();
        if owned.is_empty() {
            return;
        }

        info!("closing {} client connections", owned.len());
        for context in &owned {
            context.mark_closing();
            context.close_inbound(Some("service connection closed".to_string()), true);
        }

        let deadline = Instant::now() + self.deps.config.close_timeout;
        for context in owned {
            if timeout_at(deadline, context.completed()).await.is_err() {
                force_close(&context, &self.deps.client_connections);
            }
        }
    }
}

async fn drain_client_connection(context: Arc<ClientConnectionContext>, registry: Arc<ClientConnectionManager>, close_timeout: Duration) {
    if timeout(close_timeout, context.completed()).await.is_err() {
        force_close(&context, &registry);
    }
}

fn force_close(context: &ClientConnectionContext, registry: &ClientConnectionManager) {
    warn!(client_connection_id = %context.connection_id(), "application did not finish in time, cancelling it");
    context.abort_application();
    registry.remove_if_same(context);
    context.complete();
}
