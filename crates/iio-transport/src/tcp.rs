//! TCP transport helpers.

use std::time::Duration;

use iio_model::{Error, Result};
use tokio::net::{TcpListener, TcpStream};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

/// TCP transport, creates connected streams.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Establishes a TCP connection to `addr` (`host:port`).
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::TimedOut)??;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(addr = addr, "TCP connected");
        Ok(stream)
    }

    /// Binds to `addr` and returns a listener for incoming connections.
    pub async fn listen(&self, addr: &str) -> Result<TcpListener> {
        Ok(TcpListener::bind(addr).await?)
    }

    /// Accepts an incoming TCP connection from the listener.
    pub async fn accept(&self, listener: &TcpListener) -> Result<(TcpStream, String)> {
        let (stream, peer) = listener.accept().await?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok((stream, peer.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_accept() {
        let transport = TcpTransport::default();
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, peer) = transport.accept(&listener).await.unwrap();
            assert!(peer.starts_with("127.0.0.1"));
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
        });

        let mut conn = TcpTransport::default().connect(&addr).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let transport = TcpTransport::default();
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(transport.connect(&addr).await.is_err());
    }
}
