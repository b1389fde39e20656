//! Request/response engine shared by the daemon and the client.
//!
//! A [`Responder`] owns one connection. A reader task reads frame headers:
//! responses are delivered to the waiter registered under the same client
//! id, every other opcode is handed to the [`CommandHandler`]. A writer task
//! drains a queue of frames so that outgoing frames never interleave.
//!
//! When the reader stops (end of stream, I/O error, protocol violation or an
//! explicit [`Responder::stop`]) the error becomes sticky: every pending
//! waiter and every queued frame completes with it, and so does every later
//! request.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use iio_model::{Error, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};

use crate::cancel::CancelToken;
use crate::io::{IiodIo, Response};
use crate::protocol::Command;
use crate::transport::{FrameReader, FrameWriter};

/// Handles every non-response frame read by a responder.
///
/// The handler must consume exactly the payload the opcode carries through
/// `data` before returning, and should not wait on anything but that payload:
/// the reader task is blocked while it runs. Returning an error stops the
/// responder.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Handles one command.
    async fn handle(
        &self,
        responder: &Responder,
        cmd: &Command,
        data: &mut CommandData<'_>,
    ) -> Result<()>;
}

/// Payload access for the command being handled.
pub struct CommandData<'a> {
    reader: &'a mut FrameReader,
}

impl CommandData<'_> {
    /// Fills `buf` from the payload.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact(buf).await
    }

    /// Reads `len` payload bytes.
    pub async fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        self.reader.read_vec(len).await
    }

    /// Reads a little-endian `u64`.
    pub async fn read_u64_le(&mut self) -> Result<u64> {
        self.reader.read_u64_le().await
    }

    /// Drops `len` payload bytes.
    pub async fn discard(&mut self, len: usize) -> Result<()> {
        self.reader.discard(len).await
    }
}

/// A registered response waiter.
pub(crate) struct Waiter {
    pub(crate) client_id: u16,
    pub(crate) serial: u64,
    pub(crate) capacity: usize,
    pub(crate) tx: oneshot::Sender<Result<Response>>,
}

/// A frame waiting for the writer task.
pub(crate) struct WriteJob {
    pub(crate) cmd: Command,
    pub(crate) bufs: Vec<Bytes>,
    pub(crate) cancel: CancelToken,
    pub(crate) done: oneshot::Sender<Result<usize>>,
}

enum WriterMsg {
    Job(WriteJob),
    Stop(Error),
}

pub(crate) struct State {
    pub(crate) readers: VecDeque<Waiter>,
    stopped: bool,
    error: Option<Error>,
    next_client_id: u16,
    pub(crate) in_use: HashSet<u16>,
    timeout_ms: u64,
}

pub(crate) struct Inner {
    state: Mutex<State>,
    writer_tx: mpsc::UnboundedSender<WriterMsg>,
    stop: CancelToken,
    done: Notify,
    next_serial: AtomicU64,
}

impl Inner {
    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn sticky_error(&self) -> Error {
        self.state().error.clone().unwrap_or(Error::Interrupted)
    }

    pub(crate) fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Queues a frame for the writer task.
    pub(crate) fn submit(&self, job: WriteJob) -> Result<()> {
        let st = self.state();
        if st.stopped {
            return Err(st.error.clone().unwrap_or(Error::Interrupted));
        }
        // sent under the state lock so that no job can follow `Stop`
        self.writer_tx
            .send(WriterMsg::Job(job))
            .map_err(|_| Error::BrokenPipe)
    }

    /// Registers a response waiter.
    pub(crate) fn register(&self, waiter: Waiter) -> Result<()> {
        let mut st = self.state();
        if st.stopped {
            return Err(st.error.clone().unwrap_or(Error::Interrupted));
        }
        st.readers.retain(|w| w.serial != waiter.serial);
        st.readers.push_back(waiter);
        Ok(())
    }

    /// Drops every waiter registered by io `serial`.
    pub(crate) fn unregister(&self, serial: u64) {
        self.state().readers.retain(|w| w.serial != serial);
    }

    fn finish(&self, err: Error) {
        let waiters: Vec<Waiter> = {
            let mut st = self.state();
            if st.stopped {
                return;
            }
            st.stopped = true;
            st.error = Some(err.clone());
            let _ = self.writer_tx.send(WriterMsg::Stop(err.clone()));
            st.readers.drain(..).collect()
        };
        for w in waiters {
            let _ = w.tx.send(Err(err.clone()));
        }
        self.done.notify_waiters();
    }
}

/// Per-connection protocol engine. Cloning yields another handle to the
/// same engine.
#[derive(Clone)]
pub struct Responder {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state();
        f.debug_struct("Responder")
            .field("stopped", &st.stopped)
            .field("waiters", &st.readers.len())
            .finish()
    }
}

impl Responder {
    /// Starts the reader and writer tasks over the two halves of a
    /// connection. Must be called from within a tokio runtime.
    pub fn new<R, W>(read: R, write: W, handler: Arc<dyn CommandHandler>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                readers: VecDeque::new(),
                stopped: false,
                error: None,
                next_client_id: 1,
                in_use: HashSet::new(),
                timeout_ms: 0,
            }),
            writer_tx,
            stop: CancelToken::new(),
            done: Notify::new(),
            next_serial: AtomicU64::new(1),
        });

        let responder = Self { inner };
        tokio::spawn(run_writer(FrameWriter::new(write), writer_rx));
        tokio::spawn(run_reader(responder.clone(), FrameReader::new(read), handler));
        responder
    }

    /// An io answering or sending with client id 0.
    pub fn default_io(&self) -> IiodIo {
        IiodIo::new(self.clone(), 0, false)
    }

    /// An io with a freshly allocated client id, never 0 and unique among
    /// the ios of this responder that are still alive.
    pub fn create_io(&self) -> Result<IiodIo> {
        let id = {
            let mut st = self.inner.state();
            let mut found = None;
            for _ in 0..=u16::MAX {
                let id = st.next_client_id;
                st.next_client_id = st.next_client_id.wrapping_add(1);
                if id != 0 && st.in_use.insert(id) {
                    found = Some(id);
                    break;
                }
            }
            found.ok_or(Error::Busy)?
        };
        Ok(IiodIo::new(self.clone(), id, true))
    }

    /// An io carrying the client id of an incoming command, used to answer
    /// it or to keep answering it later.
    pub fn io_from_command(&self, cmd: &Command) -> IiodIo {
        IiodIo::new(self.clone(), cmd.client_id, false)
    }

    /// Default timeout of ios created from now on, in milliseconds
    /// (0 = infinite).
    pub fn set_timeout(&self, timeout_ms: u64) {
        self.inner.state().timeout_ms = timeout_ms;
    }

    /// Current default timeout.
    pub fn timeout_ms(&self) -> u64 {
        self.inner.state().timeout_ms
    }

    /// True once the reader task has stopped.
    pub fn is_stopped(&self) -> bool {
        self.inner.state().stopped
    }

    /// The sticky error, once stopped.
    pub fn error(&self) -> Option<Error> {
        self.inner.state().error.clone()
    }

    /// Asks the reader task to stop at the next frame boundary.
    pub fn stop(&self) {
        self.inner.stop.cancel();
    }

    /// Waits for the reader task to finish.
    pub async fn wait_done(&self) {
        loop {
            let notified = self.inner.done.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }

    /// Stops the responder and waits for it.
    pub async fn shutdown(&self) {
        self.stop();
        self.wait_done().await;
    }
}

async fn run_reader(responder: Responder, mut reader: FrameReader, handler: Arc<dyn CommandHandler>) {
    let inner = responder.inner.clone();

    let err = loop {
        let cmd = tokio::select! {
            biased;
            _ = inner.stop.cancelled() => break Error::Interrupted,
            res = reader.read_header() => res,
        };
        let cmd = match cmd {
            Ok(cmd) => cmd,
            Err(e) => break e,
        };
        trace!(client_id = cmd.client_id, op = cmd.op, dev = cmd.dev, code = cmd.code, "frame");

        if !cmd.is_response() {
            let mut data = CommandData {
                reader: &mut reader,
            };
            if let Err(e) = handler.handle(&responder, &cmd, &mut data).await {
                warn!(op = cmd.op, error = %e, "command handler failed, stopping");
                break e;
            }
            continue;
        }

        if let Err(e) = deliver(&inner, &mut reader, &cmd).await {
            break e;
        }
    };

    let err = if inner.stop.is_cancelled() {
        Error::Interrupted
    } else {
        err
    };
    debug!(error = %err, "responder reader stopped");
    inner.finish(err);
}

async fn deliver(inner: &Inner, reader: &mut FrameReader, cmd: &Command) -> Result<()> {
    let waiter = {
        let mut st = inner.state();
        let pos = st.readers.iter().position(|w| w.client_id == cmd.client_id);
        pos.and_then(|p| st.readers.remove(p))
    };
    let len = cmd.code.max(0) as usize;

    let Some(waiter) = waiter else {
        debug!(client_id = cmd.client_id, len, "dropping unclaimed response");
        return reader.discard(len).await;
    };

    if cmd.code < 0 {
        let _ = waiter.tx.send(Err(Error::from_code(cmd.code)));
        return Ok(());
    }

    let keep = len.min(waiter.capacity);
    let res: Result<Vec<u8>> = async {
        let data = reader.read_vec(keep).await?;
        reader.discard(len - keep).await?;
        Ok(data)
    }
    .await;

    match res {
        Ok(data) => {
            let _ = waiter.tx.send(Ok(Response {
                code: cmd.code,
                data,
            }));
            Ok(())
        }
        Err(e) => {
            let _ = waiter.tx.send(Err(e.clone()));
            Err(e)
        }
    }
}

async fn run_writer(mut writer: FrameWriter, mut rx: mpsc::UnboundedReceiver<WriterMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Job(job) => {
                if job.cancel.is_cancelled() {
                    let _ = job.done.send(Err(Error::Interrupted));
                    continue;
                }
                let res = writer.write_frame(&job.cmd, &job.bufs).await;
                if let Err(e) = &res {
                    warn!(client_id = job.cmd.client_id, op = job.cmd.op, error = %e, "frame write failed");
                }
                let _ = job.done.send(res);
            }
            WriterMsg::Stop(err) => {
                rx.close();
                while let Ok(msg) = rx.try_recv() {
                    if let WriterMsg::Job(job) = msg {
                        let _ = job.done.send(Err(err.clone()));
                    }
                }
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Opcode;
    use std::time::Duration;

    struct Reject;

    #[async_trait]
    impl CommandHandler for Reject {
        async fn handle(&self, _: &Responder, _: &Command, _: &mut CommandData<'_>) -> Result<()> {
            Err(Error::InvalidArgument)
        }
    }

    /// Echoes write payloads back, never answers reads.
    struct Echo;

    #[async_trait]
    impl CommandHandler for Echo {
        async fn handle(
            &self,
            responder: &Responder,
            cmd: &Command,
            data: &mut CommandData<'_>,
        ) -> Result<()> {
            let io = responder.io_from_command(cmd);
            match cmd.opcode() {
                Ok(Opcode::WriteAttr) => {
                    let len = data.read_u64_le().await? as usize;
                    let payload = data.read_vec(len).await?;
                    io.send_response(len as i32, vec![Bytes::from(payload)]).await?;
                }
                Ok(Opcode::ReadAttr) => {}
                _ => {
                    io.send_response_code(-libc::EINVAL).await?;
                }
            }
            Ok(())
        }
    }

    fn pair() -> (Responder, Responder) {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let client = Responder::new(ar, aw, Arc::new(Reject));
        let server = Responder::new(br, bw, Arc::new(Echo));
        (client, server)
    }

    fn write_payload(bytes: &'static [u8]) -> Vec<Bytes> {
        vec![
            Bytes::copy_from_slice(&(bytes.len() as u64).to_le_bytes()),
            Bytes::from_static(bytes),
        ]
    }

    #[tokio::test]
    async fn test_exec_command_round_trip() {
        let (client, _server) = pair();
        let io = client.create_io().unwrap();
        let resp = io
            .exec_command(Opcode::WriteAttr, 0, 0, write_payload(b"hello"), 64)
            .await
            .unwrap();
        assert_eq!(resp.code, 5);
        assert_eq!(resp.data, b"hello");
    }

    #[tokio::test]
    async fn test_surplus_payload_is_discarded() {
        let (client, _server) = pair();
        let io = client.create_io().unwrap();
        let resp = io
            .exec_command(Opcode::WriteAttr, 0, 0, write_payload(b"abcdef"), 3)
            .await
            .unwrap();
        assert_eq!(resp.code, 6);
        assert_eq!(resp.data, b"abc");

        let resp = io
            .exec_command(Opcode::WriteAttr, 0, 0, write_payload(b"xy"), 16)
            .await
            .unwrap();
        assert_eq!(resp.data, b"xy");
    }

    #[tokio::test]
    async fn test_unknown_opcode_answer_is_an_error() {
        let (client, _server) = pair();
        let io = client.create_io().unwrap();
        let err = io.exec_simple_command(Opcode::GetTrig, 0, 0).await.unwrap_err();
        assert_eq!(err, Error::InvalidArgument);
        assert!(!client.is_stopped());
    }

    #[tokio::test]
    async fn test_unclaimed_response_is_dropped() {
        let (client, server) = pair();
        server
            .default_io()
            .send_response(5, vec![Bytes::from_static(b"stray")])
            .await
            .unwrap();

        let io = client.create_io().unwrap();
        let resp = io
            .exec_command(Opcode::WriteAttr, 0, 0, write_payload(b"ok"), 16)
            .await
            .unwrap();
        assert_eq!(resp.data, b"ok");
    }

    #[tokio::test]
    async fn test_cancel_interrupts_waiter() {
        let (client, _server) = pair();
        let io = client.create_io().unwrap();
        let waiter = io.clone();
        let task = tokio::spawn(async move {
            waiter.exec_simple_command(Opcode::ReadAttr, 0, 0).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        io.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, Err(Error::Interrupted));

        let other = client.create_io().unwrap();
        let resp = other
            .exec_command(Opcode::WriteAttr, 0, 0, write_payload(b"still"), 16)
            .await
            .unwrap();
        assert_eq!(resp.data, b"still");
    }

    #[tokio::test]
    async fn test_response_timeout() {
        let (client, _server) = pair();
        client.set_timeout(50);
        let io = client.create_io().unwrap();
        assert_eq!(io.timeout_ms(), 50);
        let res = io.exec_simple_command(Opcode::ReadAttr, 0, 0).await;
        assert_eq!(res, Err(Error::TimedOut));
        assert!(client.inner.state().readers.is_empty());
    }

    #[tokio::test]
    async fn test_peer_close_is_sticky() {
        let (client, server) = pair();
        let io = client.create_io().unwrap();
        let waiter = io.clone();
        let task = tokio::spawn(async move {
            waiter.exec_simple_command(Opcode::ReadAttr, 0, 0).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        server.shutdown().await;
        assert_eq!(server.error(), Some(Error::Interrupted));

        let res = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, Err(Error::BrokenPipe));

        client.wait_done().await;
        let other = client.create_io().unwrap();
        assert_eq!(
            other.send_command(Opcode::Print, 0, 0, Vec::new()).await,
            Err(Error::BrokenPipe)
        );
    }

    #[tokio::test]
    async fn test_client_ids_are_unique_and_released() {
        let (client, _server) = pair();
        let a = client.create_io().unwrap();
        let b = client.create_io().unwrap();
        assert_ne!(a.client_id(), 0);
        assert_ne!(a.client_id(), b.client_id());
        assert_eq!(client.default_io().client_id(), 0);
        assert_eq!(client.inner.state().in_use.len(), 2);

        let b2 = b.clone();
        drop(b);
        assert_eq!(client.inner.state().in_use.len(), 2);
        drop(b2);
        assert_eq!(client.inner.state().in_use.len(), 1);
    }

    #[tokio::test]
    async fn test_has_response_polls_without_blocking() {
        let (client, _server) = pair();
        let io = client.create_io().unwrap();
        io.get_response_async(16).unwrap();
        assert!(!io.has_response());
        io.send_command(Opcode::WriteAttr, 0, 0, write_payload(b"p")).await.unwrap();
        assert!(io.command_is_done());

        tokio::time::timeout(Duration::from_secs(1), async {
            while !io.has_response() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(io.wait_for_response().await.unwrap().data, b"p");
    }
}
