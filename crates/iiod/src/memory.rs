//! In-memory backend.
//!
//! Serves a parsed [`Context`] without hardware behind it. Attribute values
//! follow the sysfs convention: a write keeps the bytes up to the first NUL
//! and appends a newline. RX buffers produce a deterministic byte ramp (see
//! [`rx_pattern`]), TX buffers record what they were given, and events are
//! injected by the owner of the backend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use iio_model::{AttrOwner, AttrRef, ChannelsMask, Context, Error, Event, Result};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::backend::{Backend, BackendBuffer, BackendEventStream};

/// Byte `i` of the RX ramp starting at stream offset `offset`.
pub fn rx_pattern(offset: u64, len: usize) -> Vec<u8> {
    (0..len as u64).map(|i| ((offset + i) % 251) as u8).collect()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct State {
    values: HashMap<AttrRef, Vec<u8>>,
    stalled: HashSet<AttrRef>,
    triggers: HashMap<usize, usize>,
    listeners: HashMap<usize, Vec<mpsc::UnboundedSender<Event>>>,
    tx_log: HashMap<usize, Vec<Vec<u8>>>,
}

struct Shared {
    state: Mutex<State>,
    timeout_ms: AtomicU64,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn timeout(&self) -> Option<Duration> {
        match self.timeout_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Backend keeping everything in memory.
pub struct MemoryBackend {
    ctx: Context,
    shared: Arc<Shared>,
    events: bool,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("devices", &self.ctx.devices().len())
            .field("events", &self.events)
            .finish()
    }
}

impl MemoryBackend {
    /// Serves `ctx`, every attribute initially empty.
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                timeout_ms: AtomicU64::new(0),
            }),
            events: true,
        }
    }

    /// Makes event stream creation fail with `NotImplemented`.
    pub fn without_events(mut self) -> Self {
        self.events = false;
        self
    }

    /// Stores a raw attribute value as is.
    pub fn set_value(&self, attr: AttrRef, raw: impl Into<Vec<u8>>) {
        self.shared.state().values.insert(attr, raw.into());
    }

    /// Stores a raw value by owner and name. Unknown names are ignored.
    pub fn seed(&self, owner: AttrOwner, name: &str, raw: impl Into<Vec<u8>>) {
        if let Some(attr) = self.ctx.find_attr(owner, name) {
            self.set_value(attr, raw);
        }
    }

    /// Makes reads of `attr` hang until the backend timeout expires, or
    /// forever when no timeout is set.
    pub fn stall(&self, attr: AttrRef) {
        self.shared.state().stalled.insert(attr);
    }

    /// Pushes `event` to every stream open on `dev`. Returns how many
    /// streams received it.
    pub fn inject_event(&self, dev: usize, event: Event) -> usize {
        let mut st = self.shared.state();
        let Some(listeners) = st.listeners.get_mut(&dev) else {
            return 0;
        };
        listeners.retain(|tx| tx.send(event).is_ok());
        listeners.len()
    }

    /// Everything played by the TX buffers of `dev`, one entry per block.
    pub fn tx_data(&self, dev: usize) -> Vec<Vec<u8>> {
        self.shared
            .state()
            .tx_log
            .get(&dev)
            .cloned()
            .unwrap_or_default()
    }

    /// Current hardware timeout.
    pub fn timeout_ms(&self) -> u64 {
        self.shared.timeout_ms.load(Ordering::Relaxed)
    }

    fn check_device(&self, dev: usize) -> Result<()> {
        self.ctx.device(dev).map(|_| ()).ok_or(Error::InvalidArgument)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn context(&self) -> &Context {
        &self.ctx
    }

    async fn read_attr(&self, attr: AttrRef) -> Result<Vec<u8>> {
        let meta = self.ctx.attr(attr).ok_or(Error::NotFound)?;
        if let Some(value) = &meta.value {
            return Ok(value.as_bytes().to_vec());
        }

        let (stalled, value) = {
            let st = self.shared.state();
            (st.stalled.contains(&attr), st.values.get(&attr).cloned())
        };
        if stalled {
            debug!(attr = %meta.name, "attribute read stalls");
            match self.shared.timeout() {
                None => std::future::pending::<()>().await,
                Some(d) => tokio::time::sleep(d).await,
            }
            return Err(Error::TimedOut);
        }
        Ok(value.unwrap_or_default())
    }

    async fn write_attr(&self, attr: AttrRef, value: &[u8]) -> Result<usize> {
        if attr.owner == AttrOwner::Context {
            return Err(Error::PermissionDenied);
        }
        self.ctx.attr(attr).ok_or(Error::NotFound)?;

        let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
        let mut stored = value[..end].to_vec();
        if stored.last() != Some(&b'\n') {
            stored.push(b'\n');
        }
        self.shared.state().values.insert(attr, stored);
        Ok(value.len())
    }

    fn get_trigger(&self, dev: usize) -> Result<Option<usize>> {
        self.check_device(dev)?;
        Ok(self.shared.state().triggers.get(&dev).copied())
    }

    fn set_trigger(&self, dev: usize, trigger: Option<usize>) -> Result<()> {
        self.check_device(dev)?;
        let mut st = self.shared.state();
        match trigger {
            None => {
                st.triggers.remove(&dev);
            }
            Some(trig) => {
                let is_trigger = self.ctx.device(trig).is_some_and(|d| d.is_trigger());
                if !is_trigger {
                    return Err(Error::InvalidArgument);
                }
                st.triggers.insert(dev, trig);
            }
        }
        Ok(())
    }

    fn set_timeout(&self, timeout_ms: u64) {
        self.shared.timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    async fn create_buffer(
        &self,
        dev: usize,
        idx: u16,
        mask: &mut ChannelsMask,
    ) -> Result<Arc<dyn BackendBuffer>> {
        let device = self.ctx.device(dev).ok_or(Error::InvalidArgument)?;
        if mask.len() != device.channels().len() {
            return Err(Error::InvalidArgument);
        }
        for chn in device.channels() {
            if !chn.is_scan_element {
                mask.disable(chn.number);
            }
        }
        if mask.count_enabled() == 0 {
            return Err(Error::InvalidArgument);
        }

        let (enabled, _) = watch::channel(false);
        debug!(dev, idx, "memory buffer created");
        Ok(Arc::new(MemoryBuffer {
            dev,
            is_tx: device.is_tx(mask),
            shared: self.shared.clone(),
            inner: Mutex::new(BufState::default()),
            enabled,
        }))
    }

    async fn open_event_stream(&self, dev: usize) -> Result<Arc<dyn BackendEventStream>> {
        self.check_device(dev)?;
        if !self.events {
            return Err(Error::NotImplemented);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.state().listeners.entry(dev).or_default().push(tx);
        Ok(Arc::new(MemoryEventStream {
            rx: tokio::sync::Mutex::new(rx),
            shared: self.shared.clone(),
        }))
    }
}

struct Queued {
    idx: u16,
    data: Bytes,
}

#[derive(Default)]
struct BufState {
    blocks: HashMap<u16, usize>,
    queue: VecDeque<Queued>,
    cyclic: Option<u16>,
    produced: u64,
}

struct MemoryBuffer {
    dev: usize,
    is_tx: bool,
    shared: Arc<Shared>,
    inner: Mutex<BufState>,
    enabled: watch::Sender<bool>,
}

impl MemoryBuffer {
    fn record(&self, data: &[u8]) {
        self.shared
            .state()
            .tx_log
            .entry(self.dev)
            .or_default()
            .push(data.to_vec());
    }
}

#[async_trait]
impl BackendBuffer for MemoryBuffer {
    async fn enable(&self) -> Result<()> {
        if self.enabled.send_if_modified(|on| !std::mem::replace(on, true)) {
            Ok(())
        } else {
            Err(Error::Busy)
        }
    }

    async fn disable(&self) -> Result<()> {
        self.enabled.send_replace(false);
        lock(&self.inner).cyclic = None;
        Ok(())
    }

    async fn create_block(&self, idx: u16, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let mut st = lock(&self.inner);
        if st.blocks.contains_key(&idx) {
            return Err(Error::InvalidArgument);
        }
        st.blocks.insert(idx, size);
        Ok(())
    }

    async fn free_block(&self, idx: u16) -> Result<()> {
        let mut st = lock(&self.inner);
        st.blocks.remove(&idx).ok_or(Error::BadDescriptor)?;
        st.queue.retain(|q| q.idx != idx);
        if st.cyclic == Some(idx) {
            st.cyclic = None;
        }
        Ok(())
    }

    async fn enqueue_block(
        &self,
        idx: u16,
        data: Bytes,
        bytes_used: usize,
        cyclic: bool,
    ) -> Result<()> {
        let mut st = lock(&self.inner);
        let size = *st.blocks.get(&idx).ok_or(Error::BadDescriptor)?;
        if bytes_used == 0 || bytes_used > size {
            return Err(Error::InvalidArgument);
        }
        if st.cyclic.is_some() || st.queue.iter().any(|q| q.idx == idx) {
            return Err(Error::Busy);
        }

        if cyclic {
            if !self.is_tx {
                return Err(Error::InvalidArgument);
            }
            st.cyclic = Some(idx);
            drop(st);
            self.record(&data);
            return Ok(());
        }

        st.queue.push_back(Queued { idx, data });
        Ok(())
    }

    async fn dequeue_block(&self, idx: u16) -> Result<Bytes> {
        let mut enabled = self.enabled.subscribe();
        enabled
            .wait_for(|on| *on)
            .await
            .map(|_| ())
            .map_err(|_| Error::BadDescriptor)?;

        let mut st = lock(&self.inner);
        let size = *st.blocks.get(&idx).ok_or(Error::BadDescriptor)?;
        if st.queue.front().map(|q| q.idx) != Some(idx) {
            return Err(Error::InvalidArgument);
        }
        let Some(queued) = st.queue.pop_front() else {
            return Err(Error::InvalidArgument);
        };

        if self.is_tx {
            drop(st);
            self.record(&queued.data);
            return Ok(Bytes::new());
        }
        let offset = st.produced;
        st.produced += size as u64;
        Ok(Bytes::from(rx_pattern(offset, size)))
    }
}

struct MemoryEventStream {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
    shared: Arc<Shared>,
}

#[async_trait]
impl BackendEventStream for MemoryEventStream {
    async fn read(&self, nonblock: bool) -> Result<Event> {
        if nonblock {
            let mut rx = self.rx.try_lock().map_err(|_| Error::WouldBlock)?;
            return rx.try_recv().map_err(|e| match e {
                mpsc::error::TryRecvError::Empty => Error::WouldBlock,
                mpsc::error::TryRecvError::Disconnected => Error::BadDescriptor,
            });
        }

        let mut rx = self.rx.lock().await;
        match self.shared.timeout() {
            None => rx.recv().await.ok_or(Error::BadDescriptor),
            Some(d) => tokio::time::timeout(d, rx.recv())
                .await
                .map_err(|_| Error::TimedOut)?
                .ok_or(Error::BadDescriptor),
        }
    }
}
