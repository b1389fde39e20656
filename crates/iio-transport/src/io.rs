//! Request/response rendezvous bound to one client id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use iio_model::{Error, Result};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::protocol::{Command, Opcode};
use crate::responder::{Inner, Responder, Waiter, WriteJob};

/// A received response: the non-negative code and the payload bytes that
/// fitted in the capacity given to [`IiodIo::get_response_async`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    /// Response code (payload length announced by the peer).
    pub code: i32,
    /// Payload, at most the registered capacity.
    pub data: Vec<u8>,
}

enum ReadState {
    Idle,
    Pending {
        rx: oneshot::Receiver<Result<Response>>,
        start: Instant,
    },
    Ready(Result<Response>),
}

enum WriteState {
    Idle,
    Pending {
        rx: oneshot::Receiver<Result<usize>>,
        cancel: CancelToken,
        start: Instant,
    },
    Done(Result<usize>),
}

pub(crate) struct IoShared {
    client_id: u16,
    serial: u64,
    timeout_ms: AtomicU64,
    read: Mutex<ReadState>,
    read_cancel: Mutex<CancelToken>,
    write: Mutex<WriteState>,
    owner: Weak<Inner>,
    tracked: bool,
}

impl Drop for IoShared {
    fn drop(&mut self) {
        if let Some(inner) = self.owner.upgrade() {
            inner.unregister(self.serial);
            if self.tracked {
                inner.state().in_use.remove(&self.client_id);
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle correlating requests and responses under one client id.
///
/// Clones share the same pending state. At most one frame per io may be in
/// flight in the writer queue, and at most one response may be awaited.
#[derive(Clone)]
pub struct IiodIo {
    shared: Arc<IoShared>,
    responder: Responder,
}

impl std::fmt::Debug for IiodIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IiodIo")
            .field("client_id", &self.shared.client_id)
            .field("timeout_ms", &self.timeout_ms())
            .finish()
    }
}

impl IiodIo {
    pub(crate) fn new(responder: Responder, client_id: u16, tracked: bool) -> Self {
        let shared = Arc::new(IoShared {
            client_id,
            serial: responder.inner.next_serial(),
            timeout_ms: AtomicU64::new(responder.timeout_ms()),
            read: Mutex::new(ReadState::Idle),
            read_cancel: Mutex::new(CancelToken::new()),
            write: Mutex::new(WriteState::Idle),
            owner: Arc::downgrade(&responder.inner),
            tracked,
        });
        Self { shared, responder }
    }

    /// Client id carried by this io's frames.
    pub fn client_id(&self) -> u16 {
        self.shared.client_id
    }

    /// The responder this io belongs to.
    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    /// Timeout in milliseconds, 0 = infinite.
    pub fn timeout_ms(&self) -> u64 {
        self.shared.timeout_ms.load(Ordering::Relaxed)
    }

    /// Sets the timeout used by the waits of this io.
    pub fn set_timeout(&self, timeout_ms: u64) {
        self.shared.timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    fn deadline(&self, start: Instant) -> Option<Instant> {
        match self.timeout_ms() {
            0 => None,
            ms => Some(start + Duration::from_millis(ms)),
        }
    }

    fn enqueue(&self, cmd: Command, bufs: Vec<Bytes>) -> Result<()> {
        let mut write = lock(&self.shared.write);
        if let WriteState::Pending { rx, .. } = &mut *write {
            if let Err(TryRecvError::Empty) = rx.try_recv() {
                return Err(Error::Io);
            }
        }

        let cancel = CancelToken::new();
        let (tx, rx) = oneshot::channel();
        self.responder.inner.submit(WriteJob {
            cmd,
            bufs,
            cancel: cancel.clone(),
            done: tx,
        })?;
        *write = WriteState::Pending {
            rx,
            cancel,
            start: Instant::now(),
        };
        Ok(())
    }

    /// Queues a command frame without waiting for it to be written.
    pub fn send_command_async(&self, op: Opcode, dev: u8, code: i32, bufs: Vec<Bytes>) -> Result<()> {
        self.enqueue(Command::new(self.client_id(), op, dev, code), bufs)
    }

    /// Queues a command frame and waits until it is written.
    pub async fn send_command(&self, op: Opcode, dev: u8, code: i32, bufs: Vec<Bytes>) -> Result<usize> {
        self.send_command_async(op, dev, code, bufs)?;
        self.wait_for_command_done().await
    }

    /// Queues a response frame without waiting for it to be written.
    pub fn send_response_async(&self, code: i32, bufs: Vec<Bytes>) -> Result<()> {
        self.enqueue(Command::new(self.client_id(), Opcode::Response, 0, code), bufs)
    }

    /// Queues a response frame and waits until it is written.
    pub async fn send_response(&self, code: i32, bufs: Vec<Bytes>) -> Result<usize> {
        self.send_response_async(code, bufs)?;
        self.wait_for_command_done().await
    }

    /// Sends a payload-less response.
    pub async fn send_response_code(&self, code: i32) -> Result<usize> {
        self.send_response(code, Vec::new()).await
    }

    /// Waits for the last queued frame to be written. Returns the payload
    /// size written, or 0 when nothing was queued.
    pub async fn wait_for_command_done(&self) -> Result<usize> {
        let state = std::mem::replace(&mut *lock(&self.shared.write), WriteState::Idle);
        let (rx, cancel, start) = match state {
            WriteState::Idle => return Ok(0),
            WriteState::Done(res) => return res,
            WriteState::Pending { rx, cancel, start } => (rx, cancel, start),
        };

        let inner = &self.responder.inner;
        let wait = async {
            tokio::select! {
                res = rx => res.unwrap_or_else(|_| Err(inner.sticky_error())),
                _ = cancel.cancelled() => Err(Error::Interrupted),
            }
        };

        match self.deadline(start) {
            None => wait.await,
            Some(deadline) => match tokio::time::timeout_at(deadline, wait).await {
                Ok(res) => res,
                Err(_) => {
                    cancel.cancel();
                    Err(Error::TimedOut)
                }
            },
        }
    }

    /// True when the last queued frame was written, failed, or its timeout
    /// expired.
    pub fn command_is_done(&self) -> bool {
        let mut write = lock(&self.shared.write);
        let (res, start) = match &mut *write {
            WriteState::Idle | WriteState::Done(_) => return true,
            WriteState::Pending { rx, start, .. } => (rx.try_recv(), *start),
        };
        match res {
            Ok(r) => {
                *write = WriteState::Done(r);
                true
            }
            Err(TryRecvError::Closed) => {
                *write = WriteState::Done(Err(self.responder.inner.sticky_error()));
                true
            }
            Err(TryRecvError::Empty) => self.deadline(start).is_some_and(|d| Instant::now() >= d),
        }
    }

    /// Registers this io as the receiver of the next response with its
    /// client id. At most `capacity` payload bytes are kept; the rest is
    /// drained from the connection.
    pub fn get_response_async(&self, capacity: usize) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.shared.read_cancel) = CancelToken::new();
        *lock(&self.shared.read) = ReadState::Pending {
            rx,
            start: Instant::now(),
        };
        let res = self.responder.inner.register(Waiter {
            client_id: self.client_id(),
            serial: self.shared.serial,
            capacity,
            tx,
        });
        if let Err(e) = &res {
            *lock(&self.shared.read) = ReadState::Ready(Err(e.clone()));
        }
        res
    }

    /// True when a response (or an error) is ready, or the timeout expired.
    pub fn has_response(&self) -> bool {
        let mut read = lock(&self.shared.read);
        let (res, start) = match &mut *read {
            ReadState::Idle => return false,
            ReadState::Ready(_) => return true,
            ReadState::Pending { rx, start } => (rx.try_recv(), *start),
        };
        match res {
            Ok(r) => {
                *read = ReadState::Ready(r);
                true
            }
            Err(TryRecvError::Closed) => {
                *read = ReadState::Ready(Err(Error::Interrupted));
                true
            }
            Err(TryRecvError::Empty) => self.deadline(start).is_some_and(|d| Instant::now() >= d),
        }
    }

    /// Waits for the response registered by
    /// [`IiodIo::get_response_async`]. A negative response code is
    /// returned as the matching error.
    pub async fn wait_for_response(&self) -> Result<Response> {
        let state = std::mem::replace(&mut *lock(&self.shared.read), ReadState::Idle);
        let (rx, start) = match state {
            ReadState::Idle => return Err(Error::InvalidArgument),
            ReadState::Ready(res) => return res,
            ReadState::Pending { rx, start } => (rx, start),
        };
        let cancel = lock(&self.shared.read_cancel).clone();

        let wait = async {
            tokio::select! {
                res = rx => res.unwrap_or(Err(Error::Interrupted)),
                _ = cancel.cancelled() => Err(Error::Interrupted),
            }
        };

        match self.deadline(start) {
            None => wait.await,
            Some(deadline) => match tokio::time::timeout_at(deadline, wait).await {
                Ok(res) => res,
                Err(_) => {
                    self.responder.inner.unregister(self.shared.serial);
                    Err(Error::TimedOut)
                }
            },
        }
    }

    /// Withdraws the pending response request; a task blocked in
    /// [`IiodIo::wait_for_response`] returns [`Error::Interrupted`].
    pub fn cancel_response(&self) {
        self.responder.inner.unregister(self.shared.serial);
        lock(&self.shared.read_cancel).cancel();
        let mut read = lock(&self.shared.read);
        if matches!(*read, ReadState::Pending { .. }) {
            *read = ReadState::Ready(Err(Error::Interrupted));
        }
    }

    /// Cancels the queued frame, if not yet written, and the pending
    /// response request.
    pub fn cancel(&self) {
        if let WriteState::Pending { cancel, .. } = &*lock(&self.shared.write) {
            cancel.cancel();
        }
        self.cancel_response();
    }

    /// Sends a command and waits for its response, keeping at most
    /// `capacity` bytes of payload.
    pub async fn exec_command(
        &self,
        op: Opcode,
        dev: u8,
        code: i32,
        bufs: Vec<Bytes>,
        capacity: usize,
    ) -> Result<Response> {
        self.get_response_async(capacity)?;
        if let Err(e) = self.send_command(op, dev, code, bufs).await {
            self.cancel();
            return Err(e);
        }
        self.wait_for_response().await
    }

    /// Sends a payload-less command and returns the response code.
    pub async fn exec_simple_command(&self, op: Opcode, dev: u8, code: i32) -> Result<i32> {
        Ok(self.exec_command(op, dev, code, Vec::new(), 0).await?.code)
    }
}
