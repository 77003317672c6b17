use std::time::Duration;

use thiserror::Error;

use crate::protocol::service_messages::AckStatus;


/// Failure kinds callers may want to tell apart. They travel inside `anyhow::Error` and are
///  recovered with `downcast_ref::<RelayError>()`.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum RelayError {
    #[error("no service endpoint is configured")]
    NoEndpoint,
    #[error("no primary service endpoint is configured")]
    NoPrimaryEndpoint,
    #[error("ack {0} timed out")]
    AckTimeout(u32),
    #[error("ack {0} failed with status {1:?}")]
    AckFailed(u32, AckStatus),
    #[error("invalid ack operation: {0}")]
    InvalidAckOperation(String),
    #[error("{0} messages can not be acknowledged")]
    NotAckable(&'static str),
    #[error("operation was cancelled")]
    Cancelled,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("handshake rejected by service: {0}")]
    HandshakeRejected(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u32),
    #[error("no message from service for {0:?}")]
    ServerTimeout(Duration),
    #[error("service reported an error: {0}")]
    ServiceError(String),
    #[error("service connection is not connected")]
    NotConnected,
    #[error("{0} messages can not be routed to service endpoints")]
    UnroutableMessage(&'static str),
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// the `RelayError` carried by an error, if any
pub fn relay_error(e: &anyhow::Error) -> Option<&RelayError> {
    e.downcast_ref::<RelayError>()
}
