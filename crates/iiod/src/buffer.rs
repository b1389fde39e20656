//! Daemon side of buffers and blocks.
//!
//! Every buffer owns two tasks forming a pipeline. The enqueue task hands
//! blocks to the backend in arrival order and forwards them to the dequeue
//! task, which waits for the hardware and answers through the block's io.
//! A cyclic enqueue is answered by the enqueue task and never reaches the
//! dequeue task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use iio_model::{ChannelsMask, Error, Result};
use iio_transport::{CancelToken, IiodIo};
use tokio::sync::{mpsc, Mutex as StepLock};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::backend::BackendBuffer;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A block transfer request decoded from the wire.
#[derive(Debug)]
pub struct Transfer {
    /// Block index within the buffer.
    pub block: u16,
    /// Bytes of the block in use.
    pub bytes_used: usize,
    /// TX samples, empty for RX buffers.
    pub data: Bytes,
    /// Replay the block until the buffer is disabled.
    pub cyclic: bool,
}

struct BlockEntry {
    size: usize,
    io: IiodIo,
    cancel: CancelToken,
    // held by a worker while it touches the block in the backend
    step: Arc<StepLock<()>>,
}

impl BlockEntry {
    /// Cancels pending transfers and waits for a worker step in progress.
    async fn retire(&self) {
        self.cancel.cancel();
        let _idle = self.step.lock().await;
    }
}

struct Job {
    block: u16,
    io: IiodIo,
    cancel: CancelToken,
    step: Arc<StepLock<()>>,
    data: Bytes,
    bytes_used: usize,
    cyclic: bool,
}

/// One buffer created by a client.
pub struct BufferEntry {
    /// Device index.
    pub dev: usize,
    /// Buffer index chosen by the client.
    pub idx: u16,
    /// Connection that created the buffer.
    pub session: u64,
    /// True when samples flow towards the hardware.
    pub is_tx: bool,
    /// Channel mask as accepted by the backend.
    pub mask: ChannelsMask,
    backend: Arc<dyn BackendBuffer>,
    blocks: Mutex<HashMap<u16, BlockEntry>>,
    enqueue_tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BufferEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferEntry")
            .field("dev", &self.dev)
            .field("idx", &self.idx)
            .field("session", &self.session)
            .field("is_tx", &self.is_tx)
            .field("blocks", &lock(&self.blocks).len())
            .finish()
    }
}

impl BufferEntry {
    /// Wraps a backend buffer and starts its worker tasks.
    pub fn start(
        dev: usize,
        idx: u16,
        session: u64,
        mask: ChannelsMask,
        is_tx: bool,
        backend: Arc<dyn BackendBuffer>,
    ) -> Arc<Self> {
        let (enqueue_tx, enqueue_rx) = mpsc::unbounded_channel();
        let (dequeue_tx, dequeue_rx) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(run_enqueue(backend.clone(), enqueue_rx, dequeue_tx)),
            tokio::spawn(run_dequeue(backend.clone(), is_tx, dequeue_rx)),
        ];
        Arc::new(Self {
            dev,
            idx,
            session,
            is_tx,
            mask,
            backend,
            blocks: Mutex::new(HashMap::new()),
            enqueue_tx: Mutex::new(Some(enqueue_tx)),
            tasks: Mutex::new(tasks),
        })
    }

    /// Size of block `idx`, if it exists.
    pub fn block_size(&self, idx: u16) -> Option<usize> {
        lock(&self.blocks).get(&idx).map(|b| b.size)
    }

    /// Number of live blocks.
    pub fn block_count(&self) -> usize {
        lock(&self.blocks).len()
    }

    /// Creates block `idx`. Its replies go through `io` until it is freed.
    pub async fn create_block(&self, idx: u16, size: u64, io: IiodIo) -> Result<()> {
        if lock(&self.blocks).contains_key(&idx) {
            return Err(Error::InvalidArgument);
        }
        let size = usize::try_from(size).map_err(|_| Error::OutOfMemory)?;
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        self.backend.create_block(idx, size).await?;

        lock(&self.blocks).insert(
            idx,
            BlockEntry {
                size,
                io,
                cancel: CancelToken::new(),
                step: Arc::new(StepLock::new(())),
            },
        );
        debug!(dev = self.dev, buffer = self.idx, block = idx, size, "block created");
        Ok(())
    }

    /// Frees block `idx`. A transfer still pending on it is answered with
    /// `-EBADF`; a backend call already running on it completes first.
    pub async fn free_block(&self, idx: u16) -> Result<()> {
        let entry = lock(&self.blocks).remove(&idx).ok_or(Error::BadDescriptor)?;
        entry.retire().await;
        self.backend.free_block(idx).await?;
        debug!(dev = self.dev, buffer = self.idx, block = idx, "block freed");
        Ok(())
    }

    /// Hands a transfer to the enqueue task.
    pub fn transfer(&self, t: Transfer) -> Result<()> {
        let (io, cancel, step) = {
            let blocks = lock(&self.blocks);
            let b = blocks.get(&t.block).ok_or(Error::BadDescriptor)?;
            (b.io.clone(), b.cancel.clone(), b.step.clone())
        };
        let tx = lock(&self.enqueue_tx).clone().ok_or(Error::BadDescriptor)?;
        tx.send(Job {
            block: t.block,
            io,
            cancel,
            step,
            data: t.data,
            bytes_used: t.bytes_used,
            cyclic: t.cyclic,
        })
        .map_err(|_| Error::BadDescriptor)
    }

    /// Starts streaming.
    pub async fn enable(&self) -> Result<()> {
        self.backend.enable().await
    }

    /// Stops streaming.
    pub async fn disable(&self) -> Result<()> {
        self.backend.disable().await
    }

    /// Frees every block, waits for the worker tasks to drain and disables
    /// the hardware buffer.
    pub async fn free(&self) {
        let blocks: Vec<(u16, BlockEntry)> = lock(&self.blocks).drain().collect();
        for (idx, entry) in blocks {
            entry.retire().await;
            if let Err(e) = self.backend.free_block(idx).await {
                debug!(block = idx, error = %e, "backend block free failed");
            }
        }

        lock(&self.enqueue_tx).take();
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        if let Err(e) = self.backend.disable().await {
            debug!(error = %e, "backend disable on free failed");
        }
        debug!(dev = self.dev, buffer = self.idx, "buffer freed");
    }
}

async fn answer(io: &IiodIo, code: i32, bufs: Vec<Bytes>) {
    if let Err(e) = io.send_response(code, bufs).await {
        debug!(client_id = io.client_id(), error = %e, "block reply not sent");
    }
}

async fn run_enqueue(
    backend: Arc<dyn BackendBuffer>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    dequeue_tx: mpsc::UnboundedSender<Job>,
) {
    while let Some(mut job) = rx.recv().await {
        let step = job.step.clone().lock_owned().await;
        if job.cancel.is_cancelled() {
            drop(step);
            answer(&job.io, Error::BadDescriptor.code(), Vec::new()).await;
            continue;
        }

        let data = std::mem::take(&mut job.data);
        let res = backend
            .enqueue_block(job.block, data, job.bytes_used, job.cyclic)
            .await;
        drop(step);
        match res {
            Err(e) => {
                debug!(block = job.block, error = %e, "enqueue failed");
                answer(&job.io, e.code(), Vec::new()).await;
            }
            Ok(()) if job.cyclic => answer(&job.io, 0, Vec::new()).await,
            Ok(()) => {
                if let Err(mpsc::error::SendError(job)) = dequeue_tx.send(job) {
                    answer(&job.io, Error::BadDescriptor.code(), Vec::new()).await;
                }
            }
        }
    }
}

async fn run_dequeue(
    backend: Arc<dyn BackendBuffer>,
    is_tx: bool,
    mut rx: mpsc::UnboundedReceiver<Job>,
) {
    while let Some(job) = rx.recv().await {
        let step = job.step.clone().lock_owned().await;
        let res = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => Err(Error::BadDescriptor),
            res = backend.dequeue_block(job.block) => res,
        };
        drop(step);

        match res {
            Ok(data) if !is_tx => {
                answer(&job.io, data.len() as i32, vec![data]).await;
            }
            Ok(_) => answer(&job.io, 0, Vec::new()).await,
            Err(e) => {
                if e != Error::BadDescriptor {
                    error!(block = job.block, error = %e, "dequeue failed");
                }
                answer(&job.io, e.code(), Vec::new()).await;
            }
        }
    }
}
