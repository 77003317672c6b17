use std::collections::BTreeMap;

use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};
use bytes_varint::VarIntSupportMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::config::GracefulShutdownMode;
use crate::endpoint::service_endpoint::EndpointMetrics;
use crate::error::RelayError;
use crate::util::buf::*;

pub const PROTOCOL_VERSION: u32 = 1;

/// header of an `OpenConnection` for a client that was moved here from another server
pub const MIGRATE_FROM_HEADER: &str = "Asrs-Migrate-From";
/// header of a `CloseConnection` for a client that is being moved to another server
pub const MIGRATE_TO_HEADER: &str = "Asrs-Migrate-To";

pub const PING_STATUS_KEY: &str = "status";
pub const PING_SERVERS_KEY: &str = "servers";
pub const PING_METRICS_KEY: &str = "metrics";
pub const PING_OFFLINE_KEY: &str = "offline";
const PING_FIN_PREFIX: &str = "fin:";
const PING_FIN_ACK: &str = "finack";

const ID_HANDSHAKE: u8 = 1;
const ID_HANDSHAKE_RESPONSE: u8 = 2;
const ID_PING: u8 = 3;
const ID_OPEN_CONNECTION: u8 = 4;
const ID_CLOSE_CONNECTION: u8 = 5;
const ID_CONNECTION_DATA: u8 = 6;
const ID_MULTI_CONNECTION_DATA: u8 = 7;
const ID_BROADCAST_DATA: u8 = 8;
const ID_GROUP_BROADCAST_DATA: u8 = 9;
const ID_MULTI_GROUP_BROADCAST_DATA: u8 = 10;
const ID_USER_DATA: u8 = 11;
const ID_MULTI_USER_DATA: u8 = 12;
const ID_JOIN_GROUP: u8 = 13;
const ID_LEAVE_GROUP: u8 = 14;
const ID_JOIN_GROUP_WITH_ACK: u8 = 15;
const ID_LEAVE_GROUP_WITH_ACK: u8 = 16;
const ID_ACK: u8 = 17;
const ID_SERVICE_ERROR: u8 = 18;

/// Payloads keyed by client protocol name (e.g. "json", "messagepack"). The bytes are opaque.
pub type Payloads = BTreeMap<String, Bytes>;

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConnectionType {
    Default = 0,
    OnDemand = 1,
    Weak = 2,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MigrationLevel {
    Off = 0,
    ShutdownOnly = 1,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum AckStatus {
    Ok = 1,
    NotFound = 2,
    Timeout = 3,
    InternalServerError = 4,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeRequest {
    pub version: u32,
    pub hub: String,
    pub server_id: String,
    pub connection_type: ConnectionType,
    pub migration_level: MigrationLevel,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeResponse {
    /// empty on success
    pub error_message: String,
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct PingMessage {
    pub entries: Vec<(String, String)>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Claim {
    pub claim_type: String,
    pub value: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenConnectionMessage {
    pub connection_id: String,
    pub claims: Vec<Claim>,
    pub headers: BTreeMap<String, String>,
    pub query_string: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CloseConnectionMessage {
    pub connection_id: String,
    pub error_message: Option<String>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionDataMessage {
    pub connection_id: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MultiConnectionDataMessage {
    pub connection_ids: Vec<String>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BroadcastDataMessage {
    pub excluded_list: Option<Vec<String>>,
    pub payloads: Payloads,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GroupBroadcastDataMessage {
    pub group_name: String,
    pub excluded_list: Option<Vec<String>>,
    pub payloads: Payloads,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MultiGroupBroadcastDataMessage {
    pub group_names: Vec<String>,
    pub payloads: Payloads,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UserDataMessage {
    pub user_id: String,
    pub payloads: Payloads,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MultiUserDataMessage {
    pub user_ids: Vec<String>,
    pub payloads: Payloads,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GroupMembershipMessage {
    pub connection_id: String,
    pub group_name: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GroupMembershipWithAckMessage {
    pub connection_id: String,
    pub group_name: String,
    pub ack_id: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AckMessage {
    pub ack_id: u32,
    pub status: AckStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServiceErrorMessage {
    pub error_message: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ServiceMessage {
    Handshake(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    Ping(PingMessage),
    OpenConnection(OpenConnectionMessage),
    CloseConnection(CloseConnectionMessage),
    ConnectionData(ConnectionDataMessage),
    MultiConnectionData(MultiConnectionDataMessage),
    BroadcastData(BroadcastDataMessage),
    GroupBroadcastData(GroupBroadcastDataMessage),
    MultiGroupBroadcastData(MultiGroupBroadcastDataMessage),
    UserData(UserDataMessage),
    MultiUserData(MultiUserDataMessage),
    JoinGroup(GroupMembershipMessage),
    LeaveGroup(GroupMembershipMessage),
    JoinGroupWithAck(GroupMembershipWithAckMessage),
    LeaveGroupWithAck(GroupMembershipWithAckMessage),
    Ack(AckMessage),
    ServiceError(ServiceErrorMessage),
}

impl ServiceMessage {
    pub fn id(&self) -> u8 {
        match self {
            ServiceMessage::Handshake(_) => ID_HANDSHAKE,
            ServiceMessage::HandshakeResponse(_) => ID_HANDSHAKE_RESPONSE,
            ServiceMessage::Ping(_) => ID_PING,
            ServiceMessage::OpenConnection(_) => ID_OPEN_CONNECTION,
            ServiceMessage::CloseConnection(_) => ID_CLOSE_CONNECTION,
            ServiceMessage::ConnectionData(_) => ID_CONNECTION_DATA,
            ServiceMessage::MultiConnectionData(_) => ID_MULTI_CONNECTION_DATA,
            ServiceMessage::BroadcastData(_) => ID_BROADCAST_DATA,
            ServiceMessage::GroupBroadcastData(_) => ID_GROUP_BROADCAST_DATA,
            ServiceMessage::MultiGroupBroadcastData(_) => ID_MULTI_GROUP_BROADCAST_DATA,
            ServiceMessage::UserData(_) => ID_USER_DATA,
            ServiceMessage::MultiUserData(_) => ID_MULTI_USER_DATA,
            ServiceMessage::JoinGroup(_) => ID_JOIN_GROUP,
            ServiceMessage::LeaveGroup(_) => ID_LEAVE_GROUP,
            ServiceMessage::JoinGroupWithAck(_) => ID_JOIN_GROUP_WITH_ACK,
            ServiceMessage::LeaveGroupWithAck(_) => ID_LEAVE_GROUP_WITH_ACK,
            ServiceMessage::Ack(_) => ID_ACK,
            ServiceMessage::ServiceError(_) => ID_SERVICE_ERROR,
        }
    }

    /// message kind for logging, without the (potentially large) payload
    pub fn name(&self) -> &'static str {
        match self {
            ServiceMessage::Handshake(_) => "Handshake",
            ServiceMessage::HandshakeResponse(_) => "HandshakeResponse",
            ServiceMessage::Ping(_) => "Ping",
            ServiceMessage::OpenConnection(_) => "OpenConnection",
            ServiceMessage::CloseConnection(_) => "CloseConnection",
            ServiceMessage::ConnectionData(_) => "ConnectionData",
            ServiceMessage::MultiConnectionData(_) => "MultiConnectionData",
            ServiceMessage::BroadcastData(_) => "BroadcastData",
            ServiceMessage::GroupBroadcastData(_) => "GroupBroadcastData",
            ServiceMessage::MultiGroupBroadcastData(_) => "MultiGroupBroadcastData",
            ServiceMessage::UserData(_) => "UserData",
            ServiceMessage::MultiUserData(_) => "MultiUserData",
            ServiceMessage::JoinGroup(_) => "JoinGroup",
            ServiceMessage::LeaveGroup(_) => "LeaveGroup",
            ServiceMessage::JoinGroupWithAck(_) => "JoinGroupWithAck",
            ServiceMessage::LeaveGroupWithAck(_) => "LeaveGroupWithAck",
            ServiceMessage::Ack(_) => "Ack",
            ServiceMessage::ServiceError(_) => "ServiceError",
        }
    }

    /// Key for stable connection selection inside a pool: messages with the same key always go
    ///  through the same physical connection while it is connected.
    pub fn partition_key(&self) -> Option<&str> {
        match self {
            ServiceMessage::GroupBroadcastData(m) => Some(&m.group_name),
            ServiceMessage::UserData(m) => Some(&m.user_id),
            ServiceMessage::ConnectionData(m) => Some(&m.connection_id),
            ServiceMessage::CloseConnection(m) => Some(&m.connection_id),
            ServiceMessage::JoinGroup(m) | ServiceMessage::LeaveGroup(m) => Some(&m.group_name),
            ServiceMessage::JoinGroupWithAck(m) | ServiceMessage::LeaveGroupWithAck(m) => Some(&m.group_name),
            _ => None,
        }
    }

    pub fn ack_id(&self) -> Option<u32> {
        match self {
            ServiceMessage::JoinGroupWithAck(m) | ServiceMessage::LeaveGroupWithAck(m) => Some(m.ack_id),
            _ => None,
        }
    }

    pub fn set_ack_id(&mut self, ack_id: u32) -> anyhow::Result<()> {
        match self {
            ServiceMessage::JoinGroupWithAck(m) | ServiceMessage::LeaveGroupWithAck(m) => {
                m.ack_id = ack_id;
                Ok(())
            }
            other => Err(RelayError::NotAckable(other.name()).into()),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.id());
        match self {
            ServiceMessage::Handshake(m) => Self::ser_handshake(m, buf),
            ServiceMessage::HandshakeResponse(m) => {
                put_string(buf, &m.error_message);
                put_opt_string(buf, m.connection_id.as_deref());
            }
            ServiceMessage::Ping(m) => {
                buf.put_usize_varint(m.entries.len());
                for (k, v) in &m.entries {
                    put_string(buf, k);
                    put_string(buf, v);
                }
            }
            ServiceMessage::OpenConnection(m) => Self::ser_open_connection(m, buf),
            ServiceMessage::CloseConnection(m) => {
                put_string(buf, &m.connection_id);
                put_opt_string(buf, m.error_message.as_deref());
                put_string_map(buf, &m.headers);
            }
            ServiceMessage::ConnectionData(m) => {
                put_string(buf, &m.connection_id);
                put_bytes(buf, &m.payload);
            }
            ServiceMessage::MultiConnectionData(m) => {
                put_string_list(buf, &m.connection_ids);
                put_bytes(buf, &m.payload);
            }
            ServiceMessage::BroadcastData(m) => {
                put_opt_string_list(buf, m.excluded_list.as_deref());
                put_bytes_map(buf, &m.payloads);
            }
            ServiceMessage::GroupBroadcastData(m) => {
                put_string(buf, &m.group_name);
                put_opt_string_list(buf, m.excluded_list.as_deref());
                put_bytes_map(buf, &m.payloads);
            }
            ServiceMessage::MultiGroupBroadcastData(m) => {
                put_string_list(buf, &m.group_names);
                put_bytes_map(buf, &m.payloads);
            }
            ServiceMessage::UserData(m) => {
                put_string(buf, &m.user_id);
                put_bytes_map(buf, &m.payloads);
            }
            ServiceMessage::MultiUserData(m) => {
                put_string_list(buf, &m.user_ids);
                put_bytes_map(buf, &m.payloads);
            }
            ServiceMessage::JoinGroup(m) | ServiceMessage::LeaveGroup(m) => {
                put_string(buf, &m.connection_id);
                put_string(buf, &m.group_name);
            }
            ServiceMessage::JoinGroupWithAck(m) | ServiceMessage::LeaveGroupWithAck(m) => {
                put_string(buf, &m.connection_id);
                put_string(buf, &m.group_name);
                buf.put_u32(m.ack_id);
            }
            ServiceMessage::Ack(m) => {
                buf.put_u32(m.ack_id);
                buf.put_u8(m.status.into());
                put_opt_string(buf, m.message.as_deref());
            }
            ServiceMessage::ServiceError(m) => put_string(buf, &m.error_message),
        }
    }

    fn ser_handshake(m: &HandshakeRequest, buf: &mut BytesMut) {
        buf.put_u32(m.version);
        put_string(buf, &m.hub);
        put_string(buf, &m.server_id);
        buf.put_u8(m.connection_type.into());
        buf.put_u8(m.migration_level.into());
    }

    fn ser_open_connection(m: &OpenConnectionMessage, buf: &mut BytesMut) {
        put_string(buf, &m.connection_id);
        buf.put_usize_varint(m.claims.len());
        for claim in &m.claims {
            put_string(buf, &claim.claim_type);
            put_string(buf, &claim.value);
        }
        put_string_map(buf, &m.headers);
        put_opt_string(buf, m.query_string.as_deref());
    }

    /// Parses a complete message body (without the frame length prefix). Trailing bytes are an
    ///  error since frames are exact.
    pub fn deser(buf: &[u8]) -> anyhow::Result<ServiceMessage> {
        let mut buf = buf;
        let msg = match get_u8_checked(&mut buf)? {
            ID_HANDSHAKE => Self::deser_handshake(&mut buf)?,
            ID_HANDSHAKE_RESPONSE => ServiceMessage::HandshakeResponse(HandshakeResponse {
                error_message: try_get_string(&mut buf)?,
                connection_id: try_get_opt_string(&mut buf)?,
            }),
            ID_PING => {
                let len = get_len_checked(&mut buf)?;
                let mut entries = Vec::with_capacity(len);
                for _ in 0..len {
                    let k = try_get_string(&mut buf)?;
                    let v = try_get_string(&mut buf)?;
                    entries.push((k, v));
                }
                ServiceMessage::Ping(PingMessage { entries })
            }
            ID_OPEN_CONNECTION => Self::deser_open_connection(&mut buf)?,
            ID_CLOSE_CONNECTION => ServiceMessage::CloseConnection(CloseConnectionMessage {
                connection_id: try_get_string(&mut buf)?,
                error_message: try_get_opt_string(&mut buf)?,
                headers: try_get_string_map(&mut buf)?,
            }),
            ID_CONNECTION_DATA => ServiceMessage::ConnectionData(ConnectionDataMessage {
                connection_id: try_get_string(&mut buf)?,
                payload: try_get_bytes(&mut buf)?,
            }),
            ID_MULTI_CONNECTION_DATA => ServiceMessage::MultiConnectionData(MultiConnectionDataMessage {
                connection_ids: try_get_string_list(&mut buf)?,
                payload: try_get_bytes(&mut buf)?,
            }),
            ID_BROADCAST_DATA => ServiceMessage::BroadcastData(BroadcastDataMessage {
                excluded_list: try_get_opt_string_list(&mut buf)?,
                payloads: try_get_bytes_map(&mut buf)?,
            }),
            ID_GROUP_BROADCAST_DATA => ServiceMessage::GroupBroadcastData(GroupBroadcastDataMessage {
                group_name: try_get_string(&mut buf)?,
                excluded_list: try_get_opt_string_list(&mut buf)?,
                payloads: try_get_bytes_map(&mut buf)?,
            }),
            ID_MULTI_GROUP_BROADCAST_DATA => ServiceMessage::MultiGroupBroadcastData(MultiGroupBroadcastDataMessage {
                group_names: try_get_string_list(&mut buf)?,
                payloads: try_get_bytes_map(&mut buf)?,
            }),
            ID_USER_DATA => ServiceMessage::UserData(UserDataMessage {
                user_id: try_get_string(&mut buf)?,
                payloads: try_get_bytes_map(&mut buf)?,
            }),
            ID_MULTI_USER_DATA => ServiceMessage::MultiUserData(MultiUserDataMessage {
                user_ids: try_get_string_list(&mut buf)?,
                payloads: try_get_bytes_map(&mut buf)?,
            }),
            ID_JOIN_GROUP => ServiceMessage::JoinGroup(Self::deser_group_membership(&mut buf)?),
            ID_LEAVE_GROUP => ServiceMessage::LeaveGroup(Self::deser_group_membership(&mut buf)?),
            ID_JOIN_GROUP_WITH_ACK => ServiceMessage::JoinGroupWithAck(Self::deser_group_membership_with_ack(&mut buf)?),
            ID_LEAVE_GROUP_WITH_ACK => ServiceMessage::LeaveGroupWithAck(Self::deser_group_membership_with_ack(&mut buf)?),
            ID_ACK => ServiceMessage::Ack(AckMessage {
                ack_id: get_u32_checked(&mut buf)?,
                status: AckStatus::try_from(get_u8_checked(&mut buf)?)?,
                message: try_get_opt_string(&mut buf)?,
            }),
            ID_SERVICE_ERROR => ServiceMessage::ServiceError(ServiceErrorMessage {
                error_message: try_get_string(&mut buf)?,
            }),
            id => return Err(anyhow!("invalid message discriminator {}", id)),
        };

        if !buf.is_empty() {
            return Err(anyhow!("{} trailing bytes after {} message", buf.len(), msg.name()));
        }
        Ok(msg)
    }

    fn deser_handshake(buf: &mut &[u8]) -> anyhow::Result<ServiceMessage> {
        let version = get_u32_checked(buf)?;
        if version != PROTOCOL_VERSION {
            return Err(RelayError::UnsupportedProtocolVersion(version).into());
        }

        Ok(ServiceMessage::Handshake(HandshakeRequest {
            version,
            hub: try_get_string(buf)?,
            server_id: try_get_string(buf)?,
            connection_type: ConnectionType::try_from(get_u8_checked(buf)?)?,
            migration_level: MigrationLevel::try_from(get_u8_checked(buf)?)?,
        }))
    }

    fn deser_open_connection(buf: &mut &[u8]) -> anyhow::Result<ServiceMessage> {
        let connection_id = try_get_string(buf)?;
        let num_claims = get_len_checked(buf)?;
        let mut claims = Vec::with_capacity(num_claims);
        for _ in 0..num_claims {
            claims.push(Claim {
                claim_type: try_get_string(buf)?,
                value: try_get_string(buf)?,
            });
        }

        Ok(ServiceMessage::OpenConnection(OpenConnectionMessage {
            connection_id,
            claims,
            headers: try_get_string_map(buf)?,
            query_string: try_get_opt_string(buf)?,
        }))
    }

    fn deser_group_membership(buf: &mut &[u8]) -> anyhow::Result<GroupMembershipMessage> {
        Ok(GroupMembershipMessage {
            connection_id: try_get_string(buf)?,
            group_name: try_get_string(buf)?,
        })
    }

    fn deser_group_membership_with_ack(buf: &mut &[u8]) -> anyhow::Result<GroupMembershipWithAckMessage> {
        Ok(GroupMembershipWithAckMessage {
            connection_id: try_get_string(buf)?,
            group_name: try_get_string(buf)?,
            ack_id: get_u32_checked(buf)?,
        })
    }
}

impl PingMessage {
    pub fn new(entries: &[(&str, &str)]) -> PingMessage {
        PingMessage {
            entries: entries.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn keep_alive() -> PingMessage {
        PingMessage::default()
    }

    pub fn fin(mode: GracefulShutdownMode) -> PingMessage {
        let mode: u8 = mode.into();
        PingMessage::new(&[(PING_OFFLINE_KEY, &format!("{}{}", PING_FIN_PREFIX, mode))])
    }

    pub fn fin_ack() -> PingMessage {
        PingMessage::new(&[(PING_OFFLINE_KEY, PING_FIN_ACK)])
    }

    pub fn servers_request() -> PingMessage {
        PingMessage::new(&[(PING_SERVERS_KEY, "")])
    }

    pub fn status(active: bool) -> PingMessage {
        PingMessage::new(&[(PING_STATUS_KEY, if active { "1" } else { "0" })])
    }

    pub fn servers(server_ids: &[&str]) -> PingMessage {
        PingMessage::new(&[(PING_SERVERS_KEY, &server_ids.join(","))])
    }

    pub fn metrics(metrics: &EndpointMetrics) -> PingMessage {
        let value = format!("{},{},{}",
                            metrics.connection_capacity,
                            metrics.server_connection_count,
                            metrics.client_connection_count);
        PingMessage::new(&[(PING_METRICS_KEY, &value)])
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_keep_alive(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_fin_ack(&self) -> bool {
        self.get(PING_OFFLINE_KEY) == Some(PING_FIN_ACK)
    }

    /// the shutdown mode requested by a fin ping
    pub fn fin_mode(&self) -> Option<GracefulShutdownMode> {
        let mode = self.get(PING_OFFLINE_KEY)?
            .strip_prefix(PING_FIN_PREFIX)?
            .parse::<u8>().ok()?;
        GracefulShutdownMode::try_from(mode).ok()
    }

    pub fn active_status(&self) -> Option<bool> {
        match self.get(PING_STATUS_KEY)? {
            "1" => Some(true),
            "0" => Some(false),
            _ => None,
        }
    }

    pub fn is_servers_request(&self) -> bool {
        self.get(PING_SERVERS_KEY) == Some("")
    }

    /// server ids announced by the service; `None` if this is not a (non-empty) servers ping
    pub fn server_ids(&self) -> Option<Vec<String>> {
        let value = self.get(PING_SERVERS_KEY)?;
        if value.is_empty() {
            return None;
        }
        Some(value.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn endpoint_metrics(&self) -> Option<EndpointMetrics> {
        let mut parts = self.get(PING_METRICS_KEY)?
            .split(',')
            .map(|s| s.trim().parse::<u64>());
        let connection_capacity = parts.next()?.ok()?;
        let server_connection_count = parts.next()?.ok()?;
        let client_connection_count = parts.next()?.ok()?;
        Some(EndpointMetrics {
            connection_capacity,
            server_connection_count,
            client_connection_count,
        })
    }
}
