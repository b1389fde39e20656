//! Daemon side of event streams.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use iio_model::{Error, Event, Result, EVENT_SIZE};
use iio_transport::{CancelToken, IiodIo};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::backend::BackendEventStream;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Sends one event, or the error that replaced it.
pub async fn reply_event(io: &IiodIo, res: Result<Event>) {
    let sent = match res {
        Ok(ev) => {
            let raw = Bytes::copy_from_slice(&ev.to_bytes());
            io.send_response(EVENT_SIZE as i32, vec![raw]).await
        }
        Err(e) => io.send_response_code(e.code()).await,
    };
    if let Err(e) = sent {
        debug!(client_id = io.client_id(), error = %e, "event reply not sent");
    }
}

/// An event stream opened by a client. Blocking reads are served one at a
/// time by a dedicated task.
pub struct EvstreamEntry {
    /// Device index.
    pub dev: usize,
    /// Client id the stream was opened with.
    pub client_id: u16,
    /// Connection that opened the stream.
    pub session: u64,
    stream: Arc<dyn BackendEventStream>,
    requests: Mutex<Option<mpsc::UnboundedSender<()>>>,
    cancel: CancelToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EvstreamEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvstreamEntry")
            .field("dev", &self.dev)
            .field("client_id", &self.client_id)
            .field("session", &self.session)
            .finish()
    }
}

impl EvstreamEntry {
    /// Starts the reader task. Blocking reads are answered through `io`.
    pub fn start(
        dev: usize,
        session: u64,
        io: IiodIo,
        stream: Arc<dyn BackendEventStream>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancelToken::new();
        let client_id = io.client_id();
        let task = tokio::spawn(run_reader(stream.clone(), io, rx, cancel.clone()));
        Arc::new(Self {
            dev,
            client_id,
            session,
            stream,
            requests: Mutex::new(Some(tx)),
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Queues a blocking read.
    pub fn request(&self) -> Result<()> {
        lock(&self.requests)
            .as_ref()
            .ok_or(Error::BadDescriptor)?
            .send(())
            .map_err(|_| Error::BadDescriptor)
    }

    /// Reads without waiting.
    pub async fn read_nonblocking(&self) -> Result<Event> {
        self.stream.read(true).await
    }

    /// Stops the reader task and waits for it.
    pub async fn free(&self) {
        self.cancel.cancel();
        lock(&self.requests).take();
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!(dev = self.dev, client_id = self.client_id, "event stream closed");
    }
}

async fn run_reader(
    stream: Arc<dyn BackendEventStream>,
    io: IiodIo,
    mut rx: mpsc::UnboundedReceiver<()>,
    cancel: CancelToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            req = rx.recv() => {
                if req.is_none() {
                    break;
                }
            }
        }
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = stream.read(false) => res,
        };
        reply_event(&io, res).await;
    }
}
