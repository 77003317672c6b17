use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::connection::client_connection_manager::ClientConnectionManager;
use crate::connection::connection_handler::ConnectionHandler;
use crate::error::RelayError;
use crate::protocol::service_messages::{Claim, CloseConnectionMessage, ConnectionDataMessage, OpenConnectionMessage, ServiceMessage, MIGRATE_FROM_HEADER};


/// Non-owning reference from a client connection to the physical connection carrying it
#[derive(Clone, Debug)]
pub struct ServiceConnectionHandle {
    connection_id: String,
    outbound: mpsc::Sender<ServiceMessage>,
}
impl ServiceConnectionHandle {
    pub fn new(connection_id: &str, outbound: mpsc::Sender<ServiceMessage>) -> ServiceConnectionHandle {
        ServiceConnectionHandle {
            connection_id: connection_id.to_string(),
            outbound,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub async fn send(&self, message: ServiceMessage) -> anyhow::Result<()> {
        self.outbound.send(message).await
            .map_err(|_| RelayError::NotConnected.into())
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// What the application reads from a client connection
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ClientMessage {
    Data(Bytes),
    /// The client is gone. This is the last message; there is none if the client was migrated
    ///  to another server.
    Close { error_message: Option<String> },
}

/// Outcome of handing client data to the application
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Delivery {
    Delivered,
    /// the application stopped reading from this connection
    Closed,
    /// the application does not keep up, its pipe is full
    Full,
}

/// Local state of one virtual connection, shared between the physical connection that
///  carries it, the registry and the application task.
pub struct ClientConnectionContext {
    connection_id: String,
    claims: Vec<Claim>,
    headers: BTreeMap<String, String>,
    query_string: Option<String>,
    owner: ServiceConnectionHandle,
    inbound: Mutex<Option<mpsc::Sender<ClientMessage>>>,
    migrated_in: bool,
    migrated_out: AtomicBool,
    suppress_handshake_reply: AtomicBool,
    closing: AtomicBool,
    completed: watch::Sender<bool>,
    application: Mutex<Option<AbortHandle>>,
    abort_reason: Mutex<Option<String>>,
}

impl ClientConnectionContext {
    pub fn new(open: &OpenConnectionMessage, owner: ServiceConnectionHandle, pipe_capacity: usize) -> (Arc<ClientConnectionContext>, ClientConnection) {
        let (sender, receiver) = mpsc::channel(pipe_capacity);
        let migrated_in = open.headers.contains_key(MIGRATE_FROM_HEADER);

        let context = Arc::new(ClientConnectionContext {
            connection_id: open.connection_id.clone(),
            claims: open.claims.clone(),
            headers: open.headers.clone(),
            query_string: open.query_string.clone(),
            owner,
            inbound: Mutex::new(Some(sender)),
            migrated_in,
            migrated_out: AtomicBool::new(false),
            suppress_handshake_reply: AtomicBool::new(migrated_in),
            closing: AtomicBool::new(false),
            completed: watch::channel(false).0,
            application: Mutex::new(None),
            abort_reason: Mutex::new(None),
        });

        let connection = ClientConnection {
            context: context.clone(),
            inbound: receiver,
        };
        (context, connection)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    /// the connection was moved here from another server
    pub fn is_migrated(&self) -> bool {
        self.migrated_in
    }

    /// the service moved the connection to another server
    pub fn is_migrated_out(&self) -> bool {
        self.migrated_out.load(Ordering::Acquire)
    }

    pub fn owner(&self) -> &ServiceConnectionHandle {
        &self.owner
    }

    /// Sends a payload to the client. For a migrated connection, the first payload is the
    ///  protocol handshake reply which the client already got from its previous server, so it
    ///  is dropped.
    pub async fn send(&self, payload: Bytes) -> anyhow::Result<()> {
        if self.suppress_handshake_reply.swap(false, Ordering::AcqRel) {
            debug!(connection_id = %self.connection_id, "dropping handshake reply of migrated connection");
            return Ok(());
        }

        self.owner.send(ServiceMessage::ConnectionData(ConnectionDataMessage {
            connection_id: self.connection_id.clone(),
            payload,
        })).await
    }

    fn inbound_sender(&self) -> Option<mpsc::Sender<ClientMessage>> {
        self.inbound.lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Forwards data from the client to the application without waiting for room in the pipe:
    ///  this runs on the read loop shared by all client connections of a service connection.
    pub(crate) fn deliver(&self, payload: Bytes) -> Delivery {
        let Some(sender) = self.inbound_sender() else {
            return Delivery::Closed;
        };
        match sender.try_send(ClientMessage::Data(payload)) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Ends the inbound stream. A close frame is only sent if `send_close_frame` is set;
    ///  without it the application sees the stream end silently.
    pub(crate) fn close_inbound(&self, error_message: Option<String>, send_close_frame: bool) {
        let sender = self.inbound.lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let (Some(sender), true) = (sender, send_close_frame) {
            if sender.try_send(ClientMessage::Close { error_message }).is_err() {
                debug!(connection_id = %self.connection_id, "inbound pipe full or closed, dropping close frame");
            }
        }
    }

    /// Marks the connection as closing; returns whether it was closing already
    pub(crate) fn mark_closing(&self) -> bool {
        self.closing.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn mark_migrated_out(&self) {
        self.migrated_out.store(true, Ordering::Release);
    }

    pub fn is_completed(&self) -> bool {
        *self.completed.borrow()
    }

    /// resolves once the application task for this connection is done
    pub async fn completed(&self) {
        let mut receiver = self.completed.subscribe();
        let _ = receiver.wait_for(|completed| *completed).await;
    }

    pub(crate) fn complete(&self) {
        self.completed.send_replace(true);
    }

    pub(crate) fn abort_application(&self) {
        if let Some(handle) = self.application.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    /// Cancels the application of a client whose pipe overflowed. Cleanup then asks the service
    ///  to close the client, passing `reason` along.
    pub(crate) fn abort_unresponsive(&self, reason: &str) {
        *self.abort_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.to_string());
        self.close_inbound(None, false);
        self.abort_application();
    }

    fn take_abort_reason(&self) -> Option<String> {
        self.abort_reason.lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Runs the application callback for this connection in its own task, supervised by a
    ///  second task that cleans up when the callback returns, fails or panics.
    pub(crate) fn spawn_application(self: &Arc<Self>, handler: Arc<dyn ConnectionHandler>, connection: ClientConnection, registry: Arc<ClientConnectionManager>) {
        let app = tokio::spawn(async move {
            handler.on_connected(connection).await
        });
        *self.application.lock().unwrap_or_else(|e| e.into_inner()) = Some(app.abort_handle());

        let context = self.clone();
        tokio::spawn(async move {
            let error_message = match app.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => {
                    warn!(connection_id = %context.connection_id, "application failed for client connection: {:#}", e);
                    Some(format!("{:#}", e))
                }
                Err(e) if e.is_cancelled() => {
                    debug!(connection_id = %context.connection_id, "application task was cancelled");
                    context.take_abort_reason()
                }
                Err(e) => {
                    warn!(connection_id = %context.connection_id, "application task panicked: {}", e);
                    Some("application task panicked".to_string())
                }
            };
            context.finish(error_message, &registry).await;
        });
    }

    /// Cleanup after the application is done with this connection. Unless the service already
    ///  closed or migrated the connection, the service is told to close it.
    pub(crate) async fn finish(&self, error_message: Option<String>, registry: &ClientConnectionManager) {
        if !self.is_migrated_out() && !self.mark_closing() {
            let close = ServiceMessage::CloseConnection(CloseConnectionMessage {
                connection_id: self.connection_id.clone(),
                error_message,
                headers: BTreeMap::new(),
            });
            if let Err(e) = self.owner.send(close).await {
                debug!(connection_id = %self.connection_id, "could not notify service of closed client connection: {}", e);
            }
        }

        self.close_inbound(None, false);
        registry.remove_if_same(self);
        self.complete();
    }
}

impl std::fmt::Debug for ClientConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnectionContext")
            .field("connection_id", &self.connection_id)
            .field("owner", &self.owner.connection_id)
            .field("migrated_in", &self.migrated_in)
            .field("migrated_out", &self.is_migrated_out())
            .finish()
    }
}

/// The application's end of a virtual connection
pub struct ClientConnection {
    context: Arc<ClientConnectionContext>,
    inbound: mpsc::Receiver<ClientMessage>,
}

impl ClientConnection {
    pub fn connection_id(&self) -> &str {
        self.context.connection_id()
    }

    pub fn context(&self) -> &Arc<ClientConnectionContext> {
        &self.context
    }

    /// next message from the client, `None` after the connection ended
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        self.inbound.recv().await
    }

    pub async fn send(&self, payload: Bytes) -> anyhow::Result<()> {
        self.context.send(payload).await
    }
}
