//! TCP accept loop.

use std::sync::Arc;

use iio_transport::{CancelToken, TcpTransport};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::daemon::Daemon;

/// Serves a [`Daemon`] to TCP clients.
pub struct Server {
    daemon: Arc<Daemon>,
    transport: TcpTransport,
    max_connections: usize,
}

impl Server {
    /// `max_connections == 0` accepts any number of clients.
    pub fn new(daemon: Arc<Daemon>, max_connections: usize) -> Self {
        Self {
            daemon,
            transport: TcpTransport::default(),
            max_connections,
        }
    }

    /// Binds `addr` (`host:port`).
    pub async fn bind(&self, addr: &str) -> iio_model::Result<TcpListener> {
        self.transport.listen(addr).await
    }

    /// Accepts connections until `shutdown` is cancelled. Each connection
    /// is served on its own task and releases its objects when it ends.
    pub async fn run(&self, listener: TcpListener, shutdown: CancelToken) -> iio_model::Result<()> {
        let limit = (self.max_connections > 0).then(|| Arc::new(Semaphore::new(self.max_connections)));
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, max_connections = self.max_connections, "listening");
        }

        loop {
            let permit = match &limit {
                None => None,
                Some(sem) => tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = sem.clone().acquire_owned() => permit.ok(),
                },
            };

            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.transport.accept(&listener) => match res {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            info!(%peer, "client connected");

            let daemon = self.daemon.clone();
            tokio::spawn(async move {
                let (read, write) = stream.into_split();
                daemon.run_connection(read, write).await;
                info!(%peer, "client disconnected");
                drop(permit);
            });
        }

        debug!("accept loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::demo::demo_backend;
    use bytes::Bytes;
    use iio_transport::{Command, CommandData, CommandHandler, Opcode, Responder};

    struct Quiet;

    #[async_trait::async_trait]
    impl CommandHandler for Quiet {
        async fn handle(
            &self,
            _: &Responder,
            _: &Command,
            _: &mut CommandData<'_>,
        ) -> iio_model::Result<()> {
            Err(iio_model::Error::InvalidArgument)
        }
    }

    async fn start(max_connections: usize) -> (String, CancelToken, Arc<Daemon>) {
        let daemon = Arc::new(Daemon::new(Arc::new(demo_backend().unwrap()), Some(1), 1000).unwrap());
        let server = Server::new(daemon.clone(), max_connections);
        let listener = server.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shutdown = CancelToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move { server.run(listener, stop).await });
        (addr, shutdown, daemon)
    }

    async fn client(addr: &str) -> Responder {
        let stream = TcpTransport::default().connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        let responder = Responder::new(read, write, Arc::new(Quiet));
        responder.set_timeout(1000);
        responder
    }

    #[tokio::test]
    async fn test_print_over_tcp() {
        let (addr, shutdown, daemon) = start(0).await;
        let client = client(&addr).await;
        let io = client.create_io().unwrap();
        let resp = io.exec_command(Opcode::Print, 0, 0, Vec::new(), 1 << 20).await.unwrap();
        assert_eq!(resp.data, daemon.xml().to_vec());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_frees_buffers() {
        let (addr, shutdown, daemon) = start(0).await;
        let client = client(&addr).await;
        let io = client.create_io().unwrap();
        let mask = vec![Bytes::copy_from_slice(&1u32.to_le_bytes())];
        io.exec_command(Opcode::CreateBuffer, 0, 0, mask, 4).await.unwrap();
        assert_eq!(daemon.buffer_count(), 1);

        client.shutdown().await;
        drop(io);
        for _ in 0..100 {
            if daemon.buffer_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(daemon.buffer_count(), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_connection_limit_queues_extra_clients() {
        let (addr, shutdown, _daemon) = start(1).await;
        let first = client(&addr).await;
        let io = first.create_io().unwrap();
        assert_eq!(io.exec_simple_command(Opcode::Timeout, 0, 10).await, Ok(0));

        let second = client(&addr).await;
        let waiting = second.create_io().unwrap();
        waiting.set_timeout(200);
        let res = waiting.exec_simple_command(Opcode::Timeout, 0, 10).await;
        assert_eq!(res, Err(iio_model::Error::TimedOut));
        shutdown.cancel();
    }
}
