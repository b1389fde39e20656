//! Daemon state shared by every connection.
//!
//! Buffers live in one daemon-wide list addressed by `(device, index)`, so a
//! buffer created on one connection is visible to the others. Event streams
//! are private to the connection that opened them. When a connection ends,
//! everything it created is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use iio_model::{xml, Error, Result};
use iio_transport::{CancelToken, Responder};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::backend::Backend;
use crate::buffer::BufferEntry;
use crate::dispatch::Connection;
use crate::evstream::EvstreamEntry;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// The served context and its live objects.
pub struct Daemon {
    backend: Arc<dyn Backend>,
    xml: Bytes,
    zxml: Option<Bytes>,
    timeout_ms: u64,
    buffers: Mutex<Vec<Arc<BufferEntry>>>,
    evstreams: Mutex<Vec<Arc<EvstreamEntry>>>,
    sessions: Mutex<HashMap<u64, CancelToken>>,
    next_session: AtomicU64,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("xml_len", &self.xml.len())
            .field("zstd", &self.zxml.is_some())
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl Daemon {
    /// Serves the context of `backend`. With `zstd_level` set the XML is
    /// also kept compressed for `ZPRINT`; without it `ZPRINT` is refused.
    pub fn new(backend: Arc<dyn Backend>, zstd_level: Option<i32>, timeout_ms: u64) -> Result<Self> {
        let xml = xml::to_xml(backend.context());
        let zxml = match zstd_level {
            Some(level) => Some(Bytes::from(zstd::encode_all(xml.as_bytes(), level)?)),
            None => None,
        };
        debug!(
            xml_len = xml.len(),
            zxml_len = zxml.as_ref().map(Bytes::len),
            "context description ready"
        );

        Ok(Self {
            backend,
            xml: Bytes::from(xml),
            zxml,
            timeout_ms,
            buffers: Mutex::new(Vec::new()),
            evstreams: Mutex::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        })
    }

    /// The backend.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Raw XML description.
    pub fn xml(&self) -> &Bytes {
        &self.xml
    }

    /// zstd frame of the XML description, when enabled.
    pub fn compressed_xml(&self) -> Option<&Bytes> {
        self.zxml.as_ref()
    }

    /// Number of live buffers across all connections.
    pub fn buffer_count(&self) -> usize {
        lock(&self.buffers).len()
    }

    /// Number of open event streams across all connections.
    pub fn evstream_count(&self) -> usize {
        lock(&self.evstreams).len()
    }

    pub(crate) fn find_buffer(&self, dev: usize, idx: u16) -> Option<Arc<BufferEntry>> {
        lock(&self.buffers)
            .iter()
            .find(|b| b.dev == dev && b.idx == idx)
            .cloned()
    }

    pub(crate) fn insert_buffer(&self, entry: Arc<BufferEntry>) -> Result<()> {
        let mut buffers = lock(&self.buffers);
        if buffers.iter().any(|b| b.dev == entry.dev && b.idx == entry.idx) {
            return Err(Error::Busy);
        }
        buffers.push(entry);
        Ok(())
    }

    pub(crate) fn take_buffer(&self, dev: usize, idx: u16) -> Option<Arc<BufferEntry>> {
        let mut buffers = lock(&self.buffers);
        let pos = buffers.iter().position(|b| b.dev == dev && b.idx == idx)?;
        Some(buffers.swap_remove(pos))
    }

    pub(crate) fn find_evstream(&self, session: u64, dev: usize, client_id: u16) -> Option<Arc<EvstreamEntry>> {
        lock(&self.evstreams)
            .iter()
            .find(|e| e.session == session && e.dev == dev && e.client_id == client_id)
            .cloned()
    }

    pub(crate) fn insert_evstream(&self, entry: Arc<EvstreamEntry>) -> Result<()> {
        let mut streams = lock(&self.evstreams);
        let taken = streams.iter().any(|e| {
            e.session == entry.session && e.dev == entry.dev && e.client_id == entry.client_id
        });
        if taken {
            return Err(Error::Busy);
        }
        streams.push(entry);
        Ok(())
    }

    pub(crate) fn take_evstream(&self, session: u64, dev: usize, client_id: u16) -> Option<Arc<EvstreamEntry>> {
        let mut streams = lock(&self.evstreams);
        let pos = streams
            .iter()
            .position(|e| e.session == session && e.dev == dev && e.client_id == client_id)?;
        Some(streams.swap_remove(pos))
    }

    /// Starts serving one connection and returns its responder along with
    /// the session id to hand to [`Daemon::close_session`].
    pub fn serve<R, W>(self: &Arc<Self>, read: R, write: W) -> (Responder, u64)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let closed = CancelToken::new();
        lock(&self.sessions).insert(session, closed.clone());
        let handler = Arc::new(Connection::new(self.clone(), session, closed));
        let responder = Responder::new(read, write, handler);
        responder.set_timeout(self.timeout_ms);
        debug!(session, "session opened");
        (responder, session)
    }

    /// Serves one connection until the peer goes away, then releases what
    /// it created.
    pub async fn run_connection<R, W>(self: &Arc<Self>, read: R, write: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (responder, session) = self.serve(read, write);
        responder.wait_done().await;
        debug!(session, error = ?responder.error(), "responder stopped");
        self.close_session(session).await;
    }

    /// Frees the buffers and event streams created by `session` and drops
    /// its attribute requests still in progress.
    pub async fn close_session(&self, session: u64) {
        if let Some(closed) = lock(&self.sessions).remove(&session) {
            closed.cancel();
        }
        let buffers: Vec<Arc<BufferEntry>> = {
            let mut all = lock(&self.buffers);
            let (mine, others): (Vec<_>, Vec<_>) =
                all.drain(..).partition(|b| b.session == session);
            *all = others;
            mine
        };
        let streams: Vec<Arc<EvstreamEntry>> = {
            let mut all = lock(&self.evstreams);
            let (mine, others): (Vec<_>, Vec<_>) =
                all.drain(..).partition(|e| e.session == session);
            *all = others;
            mine
        };

        if !buffers.is_empty() || !streams.is_empty() {
            info!(
                session,
                buffers = buffers.len(),
                evstreams = streams.len(),
                "releasing connection resources"
            );
        }
        for buf in buffers {
            buf.free().await;
        }
        for stream in streams {
            stream.free().await;
        }
    }
}
