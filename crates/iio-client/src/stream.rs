//! Ring of blocks cycling through one buffer.

use std::sync::Arc;

use iio_model::{Error, Result};
use iio_transport::Opcode;
use tracing::debug;

use crate::buffer::{Block, BufferShared};

/// Blocks handed to the daemon in round-robin order.
///
/// Each call to [`Stream::next_block`] gives the previous block back to
/// the daemon and returns the oldest one once the daemon is done with it:
/// full of samples for an input buffer, free to refill for an output
/// buffer.
pub struct Stream {
    buffer: Arc<BufferShared>,
    blocks: Vec<Block>,
    curr: usize,
    started: bool,
    enabled: bool,
    all_enqueued: bool,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("blocks", &self.blocks.len())
            .field("curr", &self.curr)
            .field("started", &self.started)
            .finish()
    }
}

impl Stream {
    pub(crate) fn new(buffer: Arc<BufferShared>, blocks: Vec<Block>) -> Self {
        Self {
            buffer,
            blocks,
            curr: 0,
            started: false,
            enabled: false,
            all_enqueued: false,
        }
    }

    /// Number of blocks in the ring.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Always false; a stream holds at least one block.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Advances the ring and returns the next block to consume or fill.
    pub async fn next_block(&mut self) -> Result<&mut Block> {
        let n = self.blocks.len();
        if n == 0 {
            return Err(Error::InvalidArgument);
        }

        if !self.started {
            self.started = true;
            if self.buffer.is_tx() {
                return Ok(&mut self.blocks[0]);
            }
            for block in &mut self.blocks[1..] {
                block.enqueue(0, false).await?;
            }
            self.all_enqueued = true;
        }

        self.blocks[self.curr].enqueue(0, false).await?;
        if !self.enabled {
            self.buffer.command(Opcode::EnableBuffer).await?;
            self.enabled = true;
        }

        self.curr = (self.curr + 1) % n;
        self.all_enqueued |= self.curr == 0;
        if self.all_enqueued {
            self.blocks[self.curr].dequeue(false).await?;
        }
        Ok(&mut self.blocks[self.curr])
    }

    /// Frees every block of the stream, after collecting the blocks
    /// still owned by the daemon.
    pub async fn free(mut self) -> Result<()> {
        retire(std::mem::take(&mut self.blocks)).await
    }
}

async fn retire(blocks: Vec<Block>) -> Result<()> {
    let mut first = Ok(());
    for mut block in blocks {
        if block.is_enqueued() {
            // the outcome is irrelevant, only the reply has to be consumed
            let _ = block.dequeue(false).await;
        }
        let res = block.free().await;
        if first.is_ok() {
            first = res;
        }
    }
    first
}

impl Drop for Stream {
    fn drop(&mut self) {
        let blocks = std::mem::take(&mut self.blocks);
        if blocks.is_empty() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = retire(blocks).await {
                    debug!(error = %e, "stream teardown failed");
                }
            });
        }
    }
}
