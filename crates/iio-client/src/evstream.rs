//! Hardware event streams.

use iio_model::{Event, Result, EVENT_SIZE};
use iio_transport::{IiodIo, Opcode};
use tracing::debug;

use crate::client::Client;

/// Events of one device, read from the daemon.
///
/// A read request is always outstanding on the stream's io, so a
/// non-blocking read only checks whether its answer already arrived.
/// [`EventStream::read`] is not cancel safe: dropping a blocking read
/// loses the pending request.
pub struct EventStream {
    client: Client,
    dev: usize,
    wire_dev: u8,
    io: IiodIo,
    released: bool,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("dev", &self.dev)
            .field("client_id", &self.io.client_id())
            .finish()
    }
}

impl EventStream {
    pub(crate) async fn open(client: Client, dev: usize) -> Result<Self> {
        let wire_dev = client.dev_index(dev)?;
        let io = client.create_io()?;
        io.exec_simple_command(Opcode::CreateEvstream, wire_dev, 0).await?;
        io.set_timeout(0);

        let mut stream = Self {
            client,
            dev,
            wire_dev,
            io,
            released: false,
        };
        stream.request_next().await?;
        debug!(dev, client_id = stream.io.client_id(), "event stream opened");
        Ok(stream)
    }

    async fn request_next(&mut self) -> Result<()> {
        self.io.get_response_async(EVENT_SIZE)?;
        if let Err(e) = self.io.send_command(Opcode::ReadEvent, self.wire_dev, 0, Vec::new()).await {
            self.io.cancel_response();
            return Err(e);
        }
        Ok(())
    }

    /// Device index.
    pub fn device(&self) -> usize {
        self.dev
    }

    /// Returns the next event. With `nonblock`, fails with
    /// [`iio_model::Error::WouldBlock`] when none has arrived yet.
    pub async fn read(&mut self, nonblock: bool) -> Result<Event> {
        if nonblock && !self.io.has_response() {
            return Err(iio_model::Error::WouldBlock);
        }
        let event = self
            .io
            .wait_for_response()
            .await
            .and_then(|resp| Event::from_bytes(&resp.data));
        let next = self.request_next().await;
        let event = event?;
        next?;
        Ok(event)
    }

    /// Closes the stream on the daemon.
    pub async fn free(mut self) -> Result<()> {
        self.released = true;
        let io = self.client.create_io()?;
        let res = io
            .exec_simple_command(Opcode::FreeEvstream, self.wire_dev, i32::from(self.io.client_id()))
            .await;
        self.io.cancel();
        res.map(|_| ())
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if !self.released {
            self.io.cancel();
            self.client
                .release(Opcode::FreeEvstream, self.wire_dev, i32::from(self.io.client_id()));
        }
    }
}
