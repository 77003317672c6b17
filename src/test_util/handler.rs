use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::connection::client_connection::{ClientConnection, ClientMessage};
use crate::connection::connection_handler::ConnectionHandler;


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HandlerBehavior {
    /// record everything the client sends until the connection ends
    ReadUntilClosed,
    /// like `ReadUntilClosed`, sending every payload back to the client
    Echo,
    /// return an error right away
    FailImmediately,
    /// read until the connection ends, then never return
    Hang,
    /// never read from the named client connection, handle all others like `ReadUntilClosed`
    Stall(&'static str),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HandlerEvent {
    Connected { connection_id: String, migrated: bool },
    Data { connection_id: String, payload: Bytes },
    Closed { connection_id: String, error_message: Option<String> },
    /// the inbound stream ended
    Ended { connection_id: String },
}

/// [ConnectionHandler] with canned behavior that records what it sees
pub struct TestConnectionHandler {
    behavior: HandlerBehavior,
    events: watch::Sender<Vec<HandlerEvent>>,
}

impl TestConnectionHandler {
    pub fn new(behavior: HandlerBehavior) -> Arc<TestConnectionHandler> {
        Arc::new(TestConnectionHandler {
            behavior,
            events: watch::channel(Vec::new()).0,
        })
    }

    pub fn events(&self) -> Vec<HandlerEvent> {
        self.events.borrow().clone()
    }

    /// Waits until the recorded events satisfy `condition`. Panics after ten seconds to keep a
    ///  broken test from hanging.
    pub async fn wait_for(&self, condition: impl FnMut(&Vec<HandlerEvent>) -> bool) {
        let mut receiver = self.events.subscribe();
        let waiting = receiver.wait_for(condition);
        let arrived = matches!(tokio::time::timeout(Duration::from_secs(10), waiting).await, Ok(Ok(_)));
        if !arrived {
            panic!("expected handler events did not arrive, got {:?}", self.events());
        }
    }

    fn record(&self, event: HandlerEvent) {
        self.events.send_modify(|events| events.push(event));
    }

    async fn read_until_closed(&self, connection: &mut ClientConnection, echo: bool) -> anyhow::Result<()> {
        let connection_id = connection.connection_id().to_string();
        while let Some(message) = connection.recv().await {
            match message {
                ClientMessage::Data(payload) => {
                    self.record(HandlerEvent::Data { connection_id: connection_id.clone(), payload: payload.clone() });
                    if echo {
                        connection.send(payload).await?;
                    }
                }
                ClientMessage::Close { error_message } => {
                    self.record(HandlerEvent::Closed { connection_id: connection_id.clone(), error_message });
                }
            }
        }
        self.record(HandlerEvent::Ended { connection_id });
        Ok(())
    }
}

#[async_trait]
impl ConnectionHandler for TestConnectionHandler {
    async fn on_connected(&self, mut connection: ClientConnection) -> anyhow::Result<()> {
        self.record(HandlerEvent::Connected {
            connection_id: connection.connection_id().to_string(),
            migrated: connection.context().is_migrated(),
        });

        match self.behavior {
            HandlerBehavior::ReadUntilClosed => self.read_until_closed(&mut connection, false).await,
            HandlerBehavior::Echo => self.read_until_closed(&mut connection, true).await,
            HandlerBehavior::FailImmediately => Err(anyhow!("application failure")),
            HandlerBehavior::Stall(stalled) if connection.connection_id() == stalled => {
                std::future::pending::<()>().await;
                Ok(())
            }
            HandlerBehavior::Stall(_) => self.read_until_closed(&mut connection, false).await,
            HandlerBehavior::Hang => {
                self.read_until_closed(&mut connection, false).await?;
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}
