//! Daemons and connections for tests.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use iio_client::{Client, ClientConfig};
use iio_model::{Error, Result};
use iio_transport::{CancelToken, Command, CommandData, CommandHandler, Responder};
use iiod::demo::demo_backend;
use iiod::{Daemon, MemoryBackend, Server};
use tokio::task::JoinHandle;
use tracing::debug;

const PIPE_SIZE: usize = 1 << 20;

/// Server-side timeout used by test daemons.
pub const DAEMON_TIMEOUT_MS: u64 = 1000;

/// Client handler for connections that never carry server commands.
pub struct RejectCommands;

#[async_trait]
impl CommandHandler for RejectCommands {
    async fn handle(&self, _: &Responder, cmd: &Command, _: &mut CommandData<'_>) -> Result<()> {
        debug!(op = cmd.op, "unexpected command from daemon");
        Err(Error::InvalidArgument)
    }
}

/// `u64` length prefix followed by `value`, as carried by write requests.
pub fn write_payload(value: &[u8]) -> Vec<Bytes> {
    vec![
        Bytes::copy_from_slice(&(value.len() as u64).to_le_bytes()),
        Bytes::copy_from_slice(value),
    ]
}

/// A daemon serving the demo context, reached through in-process pipes.
pub struct TestDaemon {
    /// The backend, for seeding values and inspecting TX data.
    pub backend: Arc<MemoryBackend>,
    /// The daemon shared by every connection.
    pub daemon: Arc<Daemon>,
}

impl TestDaemon {
    /// Daemon with ZPRINT enabled.
    pub fn new() -> Result<Self> {
        Self::with_zstd(Some(3))
    }

    /// Daemon with the given compression level, `None` refusing ZPRINT.
    pub fn with_zstd(level: Option<i32>) -> Result<Self> {
        let backend = Arc::new(demo_backend()?);
        let daemon = Arc::new(Daemon::new(backend.clone(), level, DAEMON_TIMEOUT_MS)?);
        Ok(Self { backend, daemon })
    }

    /// Opens a connection and returns the client's ends of it.
    pub fn pipe(
        &self,
    ) -> (
        tokio::io::ReadHalf<tokio::io::DuplexStream>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    ) {
        let (near, far) = tokio::io::duplex(PIPE_SIZE);
        let (sr, sw) = tokio::io::split(far);
        let daemon = self.daemon.clone();
        tokio::spawn(async move { daemon.run_connection(sr, sw).await });
        tokio::io::split(near)
    }

    /// A bare protocol engine connected to the daemon.
    pub fn raw(&self) -> Responder {
        let (read, write) = self.pipe();
        let responder = Responder::new(read, write, Arc::new(RejectCommands));
        responder.set_timeout(2 * DAEMON_TIMEOUT_MS);
        responder
    }

    /// A client with default settings.
    pub async fn client(&self) -> Result<Client> {
        self.client_with(ClientConfig::default()).await
    }

    /// A client with `config`.
    pub async fn client_with(&self, config: ClientConfig) -> Result<Client> {
        let (read, write) = self.pipe();
        Client::from_stream(read, write, config).await
    }
}

/// A daemon behind a loopback TCP listener.
pub struct TcpDaemon {
    /// Listening address.
    pub addr: SocketAddr,
    /// Backend of the daemon.
    pub backend: Arc<MemoryBackend>,
    /// The daemon.
    pub daemon: Arc<Daemon>,
    shutdown: CancelToken,
    task: JoinHandle<Result<()>>,
}

impl TcpDaemon {
    /// Starts listening on an ephemeral port.
    pub async fn start(max_connections: usize) -> Result<Self> {
        let TestDaemon { backend, daemon } = TestDaemon::new()?;
        let server = Server::new(daemon.clone(), max_connections);
        let listener = server.bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancelToken::new();
        let stop = shutdown.clone();
        let task = tokio::spawn(async move { server.run(listener, stop).await });
        Ok(Self {
            addr,
            backend,
            daemon,
            shutdown,
            task,
        })
    }

    /// Connects a client over TCP.
    pub async fn client(&self) -> Result<Client> {
        Client::connect(&self.addr.ip().to_string(), self.addr.port(), ClientConfig::default()).await
    }

    /// `ip:` URI of the daemon.
    pub fn uri(&self) -> String {
        format!("ip:{}:{}", self.addr.ip(), self.addr.port())
    }

    /// Stops accepting and waits for the accept loop.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.task.await.map_err(|_| Error::Interrupted)?
    }
}
