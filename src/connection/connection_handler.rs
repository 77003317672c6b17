use async_trait::async_trait;

use crate::connection::client_connection::ClientConnection;


/// The application side of virtual connections. `on_connected` is called once per client
///  connection in its own task and owns the connection until it returns: reading
///  [crate::connection::client_connection::ClientMessage]s and sending payloads back.
///
/// Returning (with or without error) closes the client connection unless the service closed it
///  first. A returned error is logged and sent to the service as the close reason.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn on_connected(&self, connection: ClientConnection) -> anyhow::Result<()>;
}
