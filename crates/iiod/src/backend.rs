//! What the daemon needs from the hardware it serves.
//!
//! The dispatcher only talks to these traits, so a sysfs scanner, a USB
//! gadget bridge or the in-memory [`MemoryBackend`](crate::memory::MemoryBackend)
//! can sit underneath without the protocol layer noticing.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use iio_model::{AttrRef, ChannelsMask, Context, Event, Result};

/// Device access used by the daemon.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// The context advertised to clients. Never changes.
    fn context(&self) -> &Context;

    /// Reads the raw value of an attribute.
    async fn read_attr(&self, attr: AttrRef) -> Result<Vec<u8>>;

    /// Writes the raw value of an attribute, returns the bytes consumed.
    async fn write_attr(&self, attr: AttrRef, value: &[u8]) -> Result<usize>;

    /// Index of the trigger attached to `dev`, if any.
    fn get_trigger(&self, dev: usize) -> Result<Option<usize>>;

    /// Attaches trigger device `trigger` to `dev`, or detaches it.
    fn set_trigger(&self, dev: usize, trigger: Option<usize>) -> Result<()>;

    /// Timeout for blocking hardware I/O, 0 = infinite.
    fn set_timeout(&self, timeout_ms: u64);

    /// Creates buffer `idx` on `dev`. The backend may force bits of `mask`
    /// on or off; the caller reports the mask as left by this call.
    async fn create_buffer(
        &self,
        dev: usize,
        idx: u16,
        mask: &mut ChannelsMask,
    ) -> Result<Arc<dyn BackendBuffer>>;

    /// Opens the event stream of `dev`.
    async fn open_event_stream(&self, dev: usize) -> Result<Arc<dyn BackendEventStream>>;
}

/// One hardware buffer and its blocks. Blocks are addressed by the index
/// the client chose when creating them.
#[async_trait]
pub trait BackendBuffer: Send + Sync {
    /// Starts streaming. Fails with `Busy` when already enabled.
    async fn enable(&self) -> Result<()>;

    /// Stops streaming and ends any cyclic replay.
    async fn disable(&self) -> Result<()>;

    /// Allocates block `idx` of `size` bytes.
    async fn create_block(&self, idx: u16, size: usize) -> Result<()>;

    /// Releases block `idx`, dropping it from the hardware queue.
    async fn free_block(&self, idx: u16) -> Result<()>;

    /// Queues block `idx`. For TX buffers `data` holds the `bytes_used`
    /// bytes to send; for RX buffers it is empty.
    async fn enqueue_block(&self, idx: u16, data: Bytes, bytes_used: usize, cyclic: bool)
        -> Result<()>;

    /// Waits until block `idx` has been processed. RX buffers return the
    /// captured bytes, TX buffers an empty payload.
    async fn dequeue_block(&self, idx: u16) -> Result<Bytes>;
}

/// Event source of one device.
#[async_trait]
pub trait BackendEventStream: Send + Sync {
    /// Reads one event. A non-blocking read with nothing pending fails with
    /// `WouldBlock`.
    async fn read(&self, nonblock: bool) -> Result<Event>;
}
