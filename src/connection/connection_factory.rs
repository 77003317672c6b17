use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::endpoint::service_endpoint::HubServiceEndpoint;


/// A duplex byte stream to a service endpoint
pub trait ServiceStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ServiceStream for T {}

/// Opens the network stream for a physical connection. The handshake happens on top of the
///  returned stream.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn connect(&self, endpoint: &HubServiceEndpoint, connection_id: &str) -> anyhow::Result<Box<dyn ServiceStream>>;
}

/// Plain TCP to the host and port of the endpoint's connection string
pub struct TcpConnectionFactory {}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn connect(&self, endpoint: &HubServiceEndpoint, connection_id: &str) -> anyhow::Result<Box<dyn ServiceStream>> {
        let info = endpoint.endpoint().info();
        debug!(connection_id, host = %info.host, port = info.port, "opening tcp connection");

        let stream = TcpStream::connect((info.host.as_str(), info.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::endpoint::service_endpoint::{EndpointType, ServiceEndpoint};
    use super::*;

    #[tokio::test]
    async fn test_tcp_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let endpoint = ServiceEndpoint::new(&format!("Endpoint=http://127.0.0.1;Port={}", port), EndpointType::Primary, "local").unwrap();
        let hub_endpoint = HubServiceEndpoint::new("chat", Arc::new(endpoint));

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = TcpConnectionFactory {}.connect(&hub_endpoint, "sc1").await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = ServiceEndpoint::new(&format!("Endpoint=http://127.0.0.1;Port={}", port), EndpointType::Primary, "local").unwrap();
        let hub_endpoint = HubServiceEndpoint::new("chat", Arc::new(endpoint));
        assert!(TcpConnectionFactory {}.connect(&hub_endpoint, "sc1").await.is_err());
    }
}
