//! Remote buffers and their blocks.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use iio_model::{AttrOwner, AttrRef, ChannelsMask, Error, Result};
use iio_transport::{pack_code, IiodIo, Opcode};
use tracing::{debug, trace};

use crate::client::Client;
use crate::stream::Stream;

pub(crate) struct BufferShared {
    client: Client,
    dev: usize,
    wire_dev: u8,
    idx: u16,
    mask: ChannelsMask,
    is_tx: bool,
    sample_size: usize,
    next_block: AtomicU16,
    released: AtomicBool,
}

impl BufferShared {
    fn code(&self) -> i32 {
        i32::from(self.idx)
    }

    pub(crate) fn is_tx(&self) -> bool {
        self.is_tx
    }

    pub(crate) async fn command(&self, op: Opcode) -> Result<()> {
        let io = self.client.create_io()?;
        io.exec_simple_command(op, self.wire_dev, self.code()).await?;
        Ok(())
    }
}

impl Drop for BufferShared {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            self.client.release(Opcode::FreeBuffer, self.wire_dev, self.code());
        }
    }
}

/// A buffer created on the daemon.
///
/// Dropping the handle frees the remote buffer once every block created
/// from it has been dropped too; [`Buffer::free`] does it right away and
/// reports the outcome.
pub struct Buffer {
    shared: Arc<BufferShared>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("dev", &self.shared.dev)
            .field("idx", &self.shared.idx)
            .field("is_tx", &self.shared.is_tx)
            .field("sample_size", &self.shared.sample_size)
            .finish()
    }
}

impl Buffer {
    pub(crate) async fn create(client: Client, dev: usize, idx: u16, mask: &ChannelsMask) -> Result<Self> {
        let wire_dev = client.dev_index(dev)?;
        let device = client.context().device(dev).ok_or(Error::NoDevice)?;
        let nb_channels = device.channels().len();
        if mask.len() != nb_channels {
            return Err(Error::InvalidArgument);
        }

        let io = client.create_io()?;
        let resp = io
            .exec_command(
                Opcode::CreateBuffer,
                wire_dev,
                i32::from(idx),
                vec![Bytes::from(mask.to_le_bytes())],
                mask.wire_size(),
            )
            .await?;
        let mask = ChannelsMask::from_le_bytes(nb_channels, &resp.data)?;
        let is_tx = device.is_tx(&mask);
        let sample_size = device.sample_size(&mask)?;
        debug!(dev, idx, is_tx, sample_size, "buffer created");

        Ok(Self {
            shared: Arc::new(BufferShared {
                client,
                dev,
                wire_dev,
                idx,
                mask,
                is_tx,
                sample_size,
                next_block: AtomicU16::new(0),
                released: AtomicBool::new(false),
            }),
        })
    }

    /// Device index.
    pub fn device(&self) -> usize {
        self.shared.dev
    }

    /// Buffer index on its device.
    pub fn index(&self) -> u16 {
        self.shared.idx
    }

    /// Channels the daemon actually enabled.
    pub fn mask(&self) -> &ChannelsMask {
        &self.shared.mask
    }

    /// True for output buffers.
    pub fn is_tx(&self) -> bool {
        self.shared.is_tx
    }

    /// Size in bytes of one sample of every enabled channel.
    pub fn sample_size(&self) -> usize {
        self.shared.sample_size
    }

    /// Looks up a buffer attribute by name.
    pub fn attr(&self, name: &str) -> Result<AttrRef> {
        self.shared.client.find_attr(
            AttrOwner::Buffer {
                dev: self.shared.dev,
                buffer: self.shared.idx,
            },
            name,
        )
    }

    /// Starts streaming. Fails with [`Error::Busy`] when already enabled.
    pub async fn enable(&self) -> Result<()> {
        self.shared.command(Opcode::EnableBuffer).await
    }

    /// Stops streaming and any cyclic replay.
    pub async fn disable(&self) -> Result<()> {
        self.shared.command(Opcode::DisableBuffer).await
    }

    /// Creates a block of `size` bytes. The size must hold at least one
    /// sample.
    pub async fn create_block(&self, size: usize) -> Result<Block> {
        Block::create(self.shared.clone(), size).await
    }

    /// Creates a stream of `nb_blocks` blocks of `samples` samples each.
    pub async fn create_stream(&self, nb_blocks: usize, samples: usize) -> Result<Stream> {
        if nb_blocks == 0 || samples == 0 {
            return Err(Error::InvalidArgument);
        }
        let size = samples
            .checked_mul(self.shared.sample_size)
            .ok_or(Error::InvalidArgument)?;
        let mut blocks = Vec::with_capacity(nb_blocks);
        for _ in 0..nb_blocks {
            blocks.push(self.create_block(size).await?);
        }
        Ok(Stream::new(self.shared.clone(), blocks))
    }

    /// Frees the buffer on the daemon. Blocks still alive fail with
    /// [`Error::BadDescriptor`] afterwards.
    pub async fn free(self) -> Result<()> {
        self.shared.released.store(true, Ordering::Release);
        self.shared.command(Opcode::FreeBuffer).await
    }
}

/// A block of sample memory exchanged with the daemon.
///
/// A block is either idle, when its data may be filled or read, or
/// enqueued, between [`Block::enqueue`] and [`Block::dequeue`].
pub struct Block {
    buffer: Arc<BufferShared>,
    io: IiodIo,
    idx: u16,
    data: Vec<u8>,
    bytes_used: usize,
    enqueued: bool,
    released: bool,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("idx", &self.idx)
            .field("size", &self.data.len())
            .field("bytes_used", &self.bytes_used)
            .field("enqueued", &self.enqueued)
            .finish()
    }
}

impl Block {
    async fn create(buffer: Arc<BufferShared>, size: usize) -> Result<Self> {
        if buffer.sample_size == 0 || size < buffer.sample_size {
            return Err(Error::InvalidArgument);
        }
        let idx = buffer.next_block.fetch_add(1, Ordering::Relaxed);
        let io = buffer.client.create_io()?;
        io.exec_command(
            Opcode::CreateBlock,
            buffer.wire_dev,
            pack_code(idx, buffer.idx),
            vec![Bytes::copy_from_slice(&(size as u64).to_le_bytes())],
            0,
        )
        .await?;
        debug!(dev = buffer.dev, buffer = buffer.idx, block = idx, size, "block created");

        Ok(Self {
            buffer,
            io,
            idx,
            data: vec![0; size],
            bytes_used: 0,
            enqueued: false,
            released: false,
        })
    }

    fn code(&self) -> i32 {
        pack_code(self.idx, self.buffer.idx)
    }

    /// Block index within its buffer.
    pub fn index(&self) -> u16 {
        self.idx
    }

    /// Capacity in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Bytes covered by the last enqueue.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// True between an enqueue and the matching dequeue.
    pub fn is_enqueued(&self) -> bool {
        self.enqueued
    }

    /// Sample memory. For input buffers it holds the last dequeued data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Sample memory to fill before enqueueing on an output buffer.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Hands the block to the daemon. `bytes_used == 0` means the whole
    /// block. A cyclic enqueue makes the hardware replay the block until
    /// the buffer is disabled.
    pub async fn enqueue(&mut self, bytes_used: usize, cyclic: bool) -> Result<()> {
        if self.enqueued {
            return Err(Error::PermissionDenied);
        }
        let bytes_used = match bytes_used {
            0 => self.data.len(),
            n if n > self.data.len() => return Err(Error::InvalidArgument),
            n => n,
        };

        let is_tx = self.buffer.is_tx;
        self.io.get_response_async(if is_tx { 0 } else { bytes_used })?;

        let mut bufs = vec![Bytes::copy_from_slice(&(bytes_used as u64).to_le_bytes())];
        if is_tx {
            bufs.push(Bytes::copy_from_slice(&self.data[..bytes_used]));
        }
        let op = if cyclic {
            Opcode::EnqueueBlockCyclic
        } else {
            Opcode::TransferBlock
        };
        if let Err(e) = self.io.send_command_async(op, self.buffer.wire_dev, self.code(), bufs) {
            self.io.cancel_response();
            return Err(e);
        }

        trace!(block = self.idx, bytes_used, cyclic, "block enqueued");
        self.enqueued = true;
        self.bytes_used = bytes_used;
        Ok(())
    }

    /// Waits for the daemon to hand the block back. With `nonblock`,
    /// returns [`Error::Busy`] instead of waiting.
    ///
    /// Any failure returns the block to the idle state, since the daemon
    /// answers a failed enqueue and a failed dequeue the same way.
    pub async fn dequeue(&mut self, nonblock: bool) -> Result<()> {
        if !self.enqueued {
            return Err(Error::PermissionDenied);
        }
        if nonblock && !self.io.command_is_done() {
            return Err(Error::Busy);
        }
        if let Err(e) = self.io.wait_for_command_done().await {
            self.io.cancel_response();
            self.enqueued = false;
            return Err(e);
        }
        if nonblock && !self.io.has_response() {
            return Err(Error::Busy);
        }

        let res = self.io.wait_for_response().await;
        self.enqueued = false;
        let resp = res?;
        if !self.buffer.is_tx {
            let n = resp.data.len().min(self.data.len());
            self.data[..n].copy_from_slice(&resp.data[..n]);
        }
        trace!(block = self.idx, code = resp.code, "block dequeued");
        Ok(())
    }

    /// Frees the block on the daemon. A transfer still in flight is
    /// abandoned.
    pub async fn free(mut self) -> Result<()> {
        self.released = true;
        self.io.cancel();
        let io = self.buffer.client.create_io()?;
        io.exec_simple_command(Opcode::FreeBlock, self.buffer.wire_dev, self.code())
            .await?;
        debug!(block = self.idx, "block freed");
        Ok(())
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if !self.released {
            self.io.cancel();
            self.buffer
                .client
                .release(Opcode::FreeBlock, self.buffer.wire_dev, self.code());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::connected;
    use iiod::rx_pattern;

    fn mask(bits: u64, n: usize) -> ChannelsMask {
        ChannelsMask::from_bits(n, bits)
    }

    #[tokio::test]
    async fn test_create_buffer_negotiates_mask() {
        let (client, _, daemon) = connected(None).await;
        let buf = client.create_buffer(0, 0, &mask(0x7, 3)).await.unwrap();
        assert_eq!(buf.mask(), &mask(0x3, 3));
        assert!(!buf.is_tx());
        assert_eq!(buf.sample_size(), 4);
        assert_eq!(daemon.buffer_count(), 1);

        let dup = client.create_buffer(0, 0, &mask(0x3, 3)).await;
        assert_eq!(dup.unwrap_err(), Error::Busy);
        buf.free().await.unwrap();
        assert_eq!(daemon.buffer_count(), 0);
    }

    #[tokio::test]
    async fn test_block_size_checks() {
        let (client, _, _) = connected(None).await;
        let buf = client.create_buffer(0, 0, &mask(0x1, 3)).await.unwrap();
        assert_eq!(buf.create_block(1).await.unwrap_err(), Error::InvalidArgument);
        let mut block = buf.create_block(64).await.unwrap();
        assert_eq!(block.enqueue(65, false).await, Err(Error::InvalidArgument));
        assert_eq!(block.dequeue(false).await, Err(Error::PermissionDenied));
    }

    #[tokio::test]
    async fn test_rx_block_round_trip() {
        let (client, _, _) = connected(None).await;
        let buf = client.create_buffer(0, 0, &mask(0x3, 3)).await.unwrap();
        let mut block = buf.create_block(4096).await.unwrap();

        block.enqueue(0, false).await.unwrap();
        assert!(block.is_enqueued());
        assert_eq!(block.enqueue(0, false).await, Err(Error::PermissionDenied));
        assert_eq!(block.dequeue(true).await, Err(Error::Busy));

        buf.enable().await.unwrap();
        block.dequeue(false).await.unwrap();
        assert!(!block.is_enqueued());
        assert_eq!(block.data(), rx_pattern(0, 4096).as_slice());
        assert_eq!(buf.enable().await, Err(Error::Busy));
    }

    #[tokio::test]
    async fn test_tx_block_reaches_backend() {
        let (client, backend, _) = connected(None).await;
        let buf = client.create_buffer(1, 0, &mask(0x1, 2)).await.unwrap();
        assert!(buf.is_tx());
        let mut block = buf.create_block(8).await.unwrap();
        block.data_mut().copy_from_slice(b"abcdefgh");
        block.enqueue(4, false).await.unwrap();
        buf.enable().await.unwrap();
        block.dequeue(false).await.unwrap();
        assert_eq!(block.bytes_used(), 4);
        assert_eq!(backend.tx_data(1), vec![b"abcd".to_vec()]);
    }

    #[tokio::test]
    async fn test_free_block_interrupts_transfer() {
        let (client, _, _) = connected(None).await;
        let buf = client.create_buffer(0, 0, &mask(0x1, 3)).await.unwrap();
        let mut block = buf.create_block(16).await.unwrap();
        let other = buf.create_block(16).await.unwrap();
        block.enqueue(0, false).await.unwrap();
        other.free().await.unwrap();
        block.free().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_buffer_is_released() {
        let (client, _, daemon) = connected(None).await;
        let buf = client.create_buffer(0, 1, &mask(0x1, 3)).await.unwrap();
        let block = buf.create_block(16).await.unwrap();
        drop(buf);
        assert_eq!(daemon.buffer_count(), 1);
        drop(block);
        for _ in 0..100 {
            if daemon.buffer_count() == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("buffer not released");
    }
}
