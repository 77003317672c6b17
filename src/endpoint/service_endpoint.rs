use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::anyhow;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::RelayError;


#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum EndpointType {
    /// receives new client negotiations
    Primary = 0,
    /// carries messages for existing clients only
    Secondary = 1,
}

impl FromStr for EndpointType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(EndpointType::Primary),
            "secondary" => Ok(EndpointType::Secondary),
            _ => Err(anyhow!("invalid endpoint type '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct EndpointMetrics {
    pub connection_capacity: u64,
    pub server_connection_count: u64,
    pub client_connection_count: u64,
}
impl EndpointMetrics {
    pub fn remaining_capacity(&self) -> u64 {
        self.connection_capacity
            .saturating_sub(self.server_connection_count)
            .saturating_sub(self.client_connection_count)
    }
}

/// Process-unique identity of a [ServiceEndpoint] instance. It survives renames and type
///  changes, which makes it the key for everything that hangs off an endpoint at runtime.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EndpointId(u64);
impl EndpointId {
    fn next() -> EndpointId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        EndpointId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}
impl Display for EndpointId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Configuration identity of an endpoint: two configured endpoints with the same key are
///  duplicates, regardless of their names.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct EndpointKey {
    pub connection_string: String,
    pub endpoint_type: EndpointType,
}

/// The parsed parts of a connection string
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionStringInfo {
    pub endpoint: String,
    pub host: String,
    pub port: u16,
    pub access_key: Option<String>,
    pub version: Option<String>,
}

impl FromStr for ConnectionStringInfo {
    type Err = anyhow::Error;

    /// `Endpoint=https://host[:port][/path];AccessKey=...;Version=1.0;Port=8080;`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |msg: String| RelayError::InvalidConnectionString(msg);

        let mut endpoint = None;
        let mut access_key = None;
        let mut version = None;
        let mut port = None;

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=')
                .ok_or_else(|| invalid(format!("'{}' is not a key=value pair", part)))?;
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value.trim_end_matches('/').to_string()),
                "accesskey" => access_key = Some(value.to_string()),
                "version" => version = Some(value.to_string()),
                "port" => port = Some(value.parse::<u16>()
                    .map_err(|_| invalid(format!("invalid port '{}'", value)))?),
                _ => {}
            }
        }

        let endpoint = endpoint
            .filter(|e| !e.is_empty())
            .ok_or_else(|| invalid("missing 'Endpoint'".to_string()))?;

        let (default_port, authority) = if let Some(rest) = endpoint.strip_prefix("https://") {
            (443, rest)
        }
        else if let Some(rest) = endpoint.strip_prefix("http://") {
            (80, rest)
        }
        else {
            return Err(invalid(format!("endpoint '{}' must start with http:// or https://", endpoint)).into());
        };
        let authority = authority.split('/').next().unwrap_or_default();

        let (host, url_port) = match authority.rsplit_once(':') {
            Some((host, p)) => (host, Some(p.parse::<u16>()
                .map_err(|_| invalid(format!("invalid port in endpoint '{}'", endpoint)))?)),
            None => (authority, None),
        };
        if host.is_empty() {
            return Err(invalid(format!("endpoint '{}' has no host", endpoint)).into());
        }

        Ok(ConnectionStringInfo {
            host: host.to_string(),
            port: port.or(url_port).unwrap_or(default_port),
            endpoint,
            access_key,
            version,
        })
    }
}

/// One configured relay service endpoint. Name and type can change through a reload, the
///  connection string is the endpoint's identity and never changes.
pub struct ServiceEndpoint {
    id: EndpointId,
    connection_string: String,
    info: ConnectionStringInfo,
    name: RwLock<String>,
    endpoint_type: AtomicU8,
    metrics: Mutex<Option<EndpointMetrics>>,
    staging: AtomicBool,
}

impl ServiceEndpoint {
    pub fn new(connection_string: &str, endpoint_type: EndpointType, name: &str) -> anyhow::Result<ServiceEndpoint> {
        let info = connection_string.parse::<ConnectionStringInfo>()?;

        Ok(ServiceEndpoint {
            id: EndpointId::next(),
            connection_string: connection_string.to_string(),
            info,
            name: RwLock::new(name.to_string()),
            endpoint_type: AtomicU8::new(endpoint_type.into()),
            metrics: Mutex::new(None),
            staging: AtomicBool::new(false),
        })
    }

    /// Creates an endpoint from a configuration key of the form `name` or `name:type`
    pub fn from_key(key: &str, connection_string: &str) -> anyhow::Result<ServiceEndpoint> {
        let (name, endpoint_type) = match key.split_once(':') {
            Some((name, t)) => (name, t.parse::<EndpointType>()?),
            None => (key, EndpointType::Primary),
        };
        ServiceEndpoint::new(connection_string, endpoint_type, name)
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn info(&self) -> &ConnectionStringInfo {
        &self.info
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            connection_string: self.connection_string.clone(),
            endpoint_type: self.endpoint_type(),
        }
    }

    pub fn name(&self) -> String {
        self.name.read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write().unwrap_or_else(|e| e.into_inner()) = name.to_string();
    }

    pub fn endpoint_type(&self) -> EndpointType {
        EndpointType::try_from(self.endpoint_type.load(Ordering::Acquire))
            .unwrap_or(EndpointType::Secondary)
    }

    pub(crate) fn set_endpoint_type(&self, endpoint_type: EndpointType) {
        self.endpoint_type.store(endpoint_type.into(), Ordering::Release);
    }

    /// the most recent metrics the service reported, `None` before the first report
    pub fn metrics(&self) -> Option<EndpointMetrics> {
        *self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn update_metrics(&self, metrics: EndpointMetrics) {
        *self.metrics.lock().unwrap_or_else(|e| e.into_inner()) = Some(metrics);
    }

    /// added by a reload and not yet visible to client negotiation
    pub fn is_staging(&self) -> bool {
        self.staging.load(Ordering::Acquire)
    }

    pub(crate) fn set_staging(&self, staging: bool) {
        self.staging.store(staging, Ordering::Release);
    }
}

impl Display for ServiceEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:?}){}", self.name(), self.endpoint_type(), self.info.endpoint)
    }
}

impl std::fmt::Debug for ServiceEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEndpoint")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("type", &self.endpoint_type())
            .field("endpoint", &self.info.endpoint)
            .field("staging", &self.is_staging())
            .finish()
    }
}

/// A [ServiceEndpoint] as seen by one hub. Whether the endpoint is online is a property of the
///  hub's own connections to it, so it lives here and not on the shared endpoint.
#[derive(Debug)]
pub struct HubServiceEndpoint {
    hub: String,
    endpoint: Arc<ServiceEndpoint>,
    online: AtomicBool,
}
impl HubServiceEndpoint {
    pub fn new(hub: &str, endpoint: Arc<ServiceEndpoint>) -> HubServiceEndpoint {
        HubServiceEndpoint {
            hub: hub.to_string(),
            endpoint,
            online: AtomicBool::new(false),
        }
    }

    /// at least one of this hub's physical connections to the endpoint is connected
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn hub(&self) -> &str {
        &self.hub
    }

    pub fn endpoint(&self) -> &Arc<ServiceEndpoint> {
        &self.endpoint
    }
}
impl Display for HubServiceEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}){}", self.hub, self.endpoint)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::error::relay_error;
    use super::*;

    #[rstest]
    #[case::https("Endpoint=https://abc.service.example;AccessKey=secret;Version=1.0;", "abc.service.example", 443, Some("secret"))]
    #[case::http("Endpoint=http://localhost;Port=8080", "localhost", 8080, None)]
    #[case::port_in_url("endpoint=http://localhost:5000/;accesskey=k", "localhost", 5000, Some("k"))]
    #[case::explicit_port_wins("Endpoint=https://h:1000;Port=2000", "h", 2000, None)]
    #[case::path("Endpoint=https://h.example/relay;", "h.example", 443, None)]
    fn test_parse_connection_string(#[case] s: &str, #[case] host: &str, #[case] port: u16, #[case] access_key: Option<&str>) {
        let info = s.parse::<ConnectionStringInfo>().unwrap();
        assert_eq!(info.host, host);
        assert_eq!(info.port, port);
        assert_eq!(info.access_key.as_deref(), access_key);
    }

    #[rstest]
    #[case::empty("")]
    #[case::no_endpoint("AccessKey=abc;")]
    #[case::no_scheme("Endpoint=abc.example;")]
    #[case::not_a_pair("Endpoint")]
    #[case::invalid_port("Endpoint=http://h;Port=abc")]
    #[case::no_host("Endpoint=https://:80")]
    fn test_parse_invalid_connection_string(#[case] s: &str) {
        let err = s.parse::<ConnectionStringInfo>().unwrap_err();
        assert!(matches!(relay_error(&err), Some(RelayError::InvalidConnectionString(_))), "{}", err);
    }

    #[rstest]
    #[case::name_only("east", "east", EndpointType::Primary)]
    #[case::primary("east:primary", "east", EndpointType::Primary)]
    #[case::secondary("west:Secondary", "west", EndpointType::Secondary)]
    fn test_from_key(#[case] key: &str, #[case] name: &str, #[case] endpoint_type: EndpointType) {
        let endpoint = ServiceEndpoint::from_key(key, "Endpoint=https://a.example").unwrap();
        assert_eq!(endpoint.name(), name);
        assert_eq!(endpoint.endpoint_type(), endpoint_type);
    }

    #[test]
    fn test_from_key_invalid_type() {
        assert!(ServiceEndpoint::from_key("east:tertiary", "Endpoint=https://a.example").is_err());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = ServiceEndpoint::new("Endpoint=https://a.example", EndpointType::Primary, "a").unwrap();
        let b = ServiceEndpoint::new("Endpoint=https://a.example", EndpointType::Primary, "a").unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_online_is_per_hub() {
        let endpoint = Arc::new(ServiceEndpoint::new("Endpoint=https://a.example", EndpointType::Primary, "a").unwrap());
        let chat = HubServiceEndpoint::new("chat", endpoint.clone());
        let news = HubServiceEndpoint::new("news", endpoint);

        chat.set_online(true);
        assert!(chat.is_online());
        assert!(!news.is_online());
    }

    #[test]
    fn test_metrics_unknown_until_reported() {
        let endpoint = ServiceEndpoint::new("Endpoint=https://a.example", EndpointType::Primary, "a").unwrap();
        assert_eq!(endpoint.metrics(), None);

        let metrics = EndpointMetrics { connection_capacity: 100, server_connection_count: 1, client_connection_count: 2 };
        endpoint.update_metrics(metrics);
        assert_eq!(endpoint.metrics(), Some(metrics));
    }

    #[rstest]
    #[case::empty(1000, 0, 0, 1000)]
    #[case::partial(1000, 10, 500, 490)]
    #[case::full(1000, 10, 990, 0)]
    #[case::over(1000, 10, 2000, 0)]
    fn test_remaining_capacity(#[case] capacity: u64, #[case] servers: u64, #[case] clients: u64, #[case] expected: u64) {
        let metrics = EndpointMetrics { connection_capacity: capacity, server_connection_count: servers, client_connection_count: clients };
        assert_eq!(metrics.remaining_capacity(), expected);
    }
}
