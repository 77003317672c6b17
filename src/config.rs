use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;

use crate::endpoint::service_endpoint::EndpointType;
use crate::error::RelayError;


#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum GracefulShutdownMode {
    /// stop immediately, dropping all client connections
    Off = 0,
    /// take endpoints offline and wait for clients to disconnect on their own
    WaitForClientsClose = 1,
    /// take endpoints offline and ask the service to move clients to other servers
    MigrateClients = 2,
}

#[derive(Debug, Clone)]
pub struct GracefulShutdownOptions {
    pub mode: GracefulShutdownMode,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub name: String,
    pub connection_string: String,
    pub endpoint_type: EndpointType,
}
impl EndpointOptions {
    pub fn new(name: &str, connection_string: &str, endpoint_type: EndpointType) -> EndpointOptions {
        EndpointOptions {
            name: name.to_string(),
            connection_string: connection_string.to_string(),
            endpoint_type,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// identifies this application server towards the service
    pub server_id: String,
    /// prefix for hub names on the wire
    pub application_name: Option<String>,

    pub connection_count: usize,
    pub endpoints: Vec<EndpointOptions>,

    /// only relevant for client negotiation, which lives outside this crate
    pub access_token_lifetime: Duration,

    pub server_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub handshake_timeout: Duration,
    pub close_timeout: Duration,
    pub ack_timeout: Duration,

    pub reconnect_initial_interval: Duration,
    pub reconnect_max_interval: Duration,

    pub graceful_shutdown: GracefulShutdownOptions,

    pub endpoint_reload_timeout: Duration,
    pub endpoint_promotion_grace_period: Duration,
    pub require_servers_for_promotion: bool,
    pub servers_ping_interval: Duration,

    pub client_pipe_capacity: usize,
}

impl ServiceOptions {
    pub fn new() -> ServiceOptions {
        ServiceOptions {
            server_id: Uuid::new_v4().to_string(),
            application_name: None,
            connection_count: 5,
            endpoints: Vec::new(),
            access_token_lifetime: Duration::from_secs(3600),
            server_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(15),
            close_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(10),
            reconnect_initial_interval: Duration::from_secs(1),
            reconnect_max_interval: Duration::from_secs(60),
            graceful_shutdown: GracefulShutdownOptions {
                mode: GracefulShutdownMode::Off,
                timeout: Duration::from_secs(30),
            },
            endpoint_reload_timeout: Duration::from_secs(300),
            endpoint_promotion_grace_period: Duration::from_secs(30),
            require_servers_for_promotion: false,
            servers_ping_interval: Duration::from_secs(5),
            client_pipe_capacity: 64,
        }
    }

    pub fn with_endpoint(mut self, name: &str, connection_string: &str, endpoint_type: EndpointType) -> ServiceOptions {
        self.endpoints.push(EndpointOptions::new(name, connection_string, endpoint_type));
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connection_count == 0 {
            return Err(RelayError::InvalidConfiguration("connection count must be at least 1".to_string()).into());
        }
        if self.client_pipe_capacity == 0 {
            return Err(RelayError::InvalidConfiguration("client pipe capacity must be at least 1".to_string()).into());
        }
        if self.keep_alive_interval >= self.server_timeout {
            return Err(RelayError::InvalidConfiguration(format!(
                "keep-alive interval {:?} must be shorter than the server timeout {:?}",
                self.keep_alive_interval, self.server_timeout)).into());
        }
        if self.reconnect_initial_interval.is_zero() || self.keep_alive_interval.is_zero() || self.servers_ping_interval.is_zero() {
            return Err(RelayError::InvalidConfiguration("intervals must be positive".to_string()).into());
        }
        Ok(())
    }

    /// hub name as sent to the service, including the application prefix if any
    pub fn wire_hub_name(&self, hub: &str) -> String {
        match &self.application_name {
            Some(app) if !app.is_empty() => format!("{}_{}", app.to_lowercase(), hub),
            _ => hub.to_string(),
        }
    }
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self::new()
    }
}
