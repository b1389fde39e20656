//! Opcode dispatcher.
//!
//! One [`Connection`] per client connection handles every command frame
//! read by that connection's responder. Handlers consume the payload of
//! their opcode, resolve the target objects and answer through an io
//! carrying the command's client id. Anything that may wait on hardware
//! (attribute I/O, block completion, blocking event reads) runs on a task
//! so that the reader keeps going.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use iio_model::attr::packed;
use iio_model::{AttrOwner, AttrRef, ChannelsMask, Error, Result};
use iio_transport::{
    CancelToken, Command, CommandData, CommandHandler, IiodIo, Opcode, Responder, ALL_ATTRS,
    MAX_ATTR_SIZE,
};
use tracing::{debug, info, trace, warn};

use crate::buffer::{BufferEntry, Transfer};
use crate::daemon::Daemon;
use crate::evstream::{reply_event, EvstreamEntry};

/// Largest attribute write payload accepted, composite writes included.
const MAX_WRITE_SIZE: usize = 16 * MAX_ATTR_SIZE;

/// Response code and payload.
type Reply = (i32, Vec<u8>);

fn reply(io: &IiodIo, code: i32, bufs: Vec<Bytes>) {
    if let Err(e) = io.send_response_async(code, bufs) {
        debug!(client_id = io.client_id(), error = %e, "reply dropped");
    }
}

fn reply_code(io: &IiodIo, code: i32) {
    reply(io, code, Vec::new());
}

fn reply_result(io: &IiodIo, res: Result<()>) {
    reply_code(io, res.map_or_else(|e| e.code(), |()| 0));
}

fn with_payload(data: Vec<u8>) -> Reply {
    (data.len() as i32, data)
}

/// Attributes addressed by one command.
enum Target {
    One(AttrRef),
    All(Vec<AttrRef>),
}

/// Per-connection command handler.
pub struct Connection {
    daemon: Arc<Daemon>,
    session: u64,
    closed: CancelToken,
}

impl Connection {
    pub(crate) fn new(daemon: Arc<Daemon>, session: u64, closed: CancelToken) -> Self {
        Self {
            daemon,
            session,
            closed,
        }
    }

    fn check_device(&self, cmd: &Command) -> Result<usize> {
        let dev = usize::from(cmd.dev);
        self.daemon
            .backend()
            .context()
            .device(dev)
            .map(|_| dev)
            .ok_or(Error::InvalidArgument)
    }

    fn buffer(&self, cmd: &Command) -> Result<Arc<BufferEntry>> {
        let dev = self.check_device(cmd)?;
        self.daemon
            .find_buffer(dev, cmd.code_low())
            .ok_or(Error::BadDescriptor)
    }

    fn resolve(&self, op: Opcode, cmd: &Command) -> Result<Target> {
        let dev = self.check_device(cmd)?;
        let owner = match op {
            Opcode::ReadAttr | Opcode::WriteAttr => AttrOwner::Device(dev),
            Opcode::ReadDbgAttr | Opcode::WriteDbgAttr => AttrOwner::Debug(dev),
            Opcode::ReadBufAttr | Opcode::WriteBufAttr => {
                self.buffer(cmd)?;
                AttrOwner::Buffer {
                    dev,
                    buffer: cmd.code_low(),
                }
            }
            _ => AttrOwner::Channel {
                dev,
                chn: usize::from(cmd.code_low()),
            },
        };

        let list = self
            .daemon
            .backend()
            .context()
            .attr_list(owner)
            .ok_or(Error::InvalidArgument)?;
        let idx = cmd.code_high();
        if idx == ALL_ATTRS {
            return Ok(Target::All(
                (0..list.len()).map(|i| AttrRef::new(owner, i)).collect(),
            ));
        }
        let idx = usize::from(idx);
        if idx >= list.len() {
            return Err(Error::NotFound);
        }
        Ok(Target::One(AttrRef::new(owner, idx)))
    }

    /// Runs `work` on a task and answers with its outcome, unless the
    /// connection goes away first.
    fn spawn_reply<F>(&self, io: IiodIo, work: F)
    where
        F: Future<Output = Result<Reply>> + Send + 'static,
    {
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let res = tokio::select! {
                biased;
                _ = closed.cancelled() => return,
                res = work => res,
            };
            let sent = match res {
                Ok((code, data)) if data.is_empty() => io.send_response_code(code).await,
                Ok((code, data)) => io.send_response(code, vec![Bytes::from(data)]).await,
                Err(e) => io.send_response_code(e.code()).await,
            };
            if let Err(e) = sent {
                debug!(client_id = io.client_id(), error = %e, "attribute reply not sent");
            }
        });
    }

    fn read_attr(&self, io: IiodIo, op: Opcode, cmd: &Command) {
        let target = match self.resolve(op, cmd) {
            Ok(t) => t,
            Err(e) => return reply_code(&io, e.code()),
        };
        let backend = self.daemon.backend().clone();

        self.spawn_reply(io, async move {
            match target {
                Target::One(attr) => {
                    let mut value = backend.read_attr(attr).await?;
                    value.truncate(MAX_ATTR_SIZE);
                    Ok(with_payload(value))
                }
                Target::All(attrs) => {
                    let mut entries = Vec::with_capacity(attrs.len());
                    for attr in attrs {
                        entries.push(backend.read_attr(attr).await.map(|mut v| {
                            v.truncate(MAX_ATTR_SIZE);
                            v
                        }));
                    }
                    Ok(with_payload(packed::encode(&entries)))
                }
            }
        });
    }

    async fn write_attr(
        &self,
        io: IiodIo,
        op: Opcode,
        cmd: &Command,
        data: &mut CommandData<'_>,
    ) -> Result<()> {
        let len = usize::try_from(data.read_u64_le().await?).map_err(|_| Error::InvalidArgument)?;
        if len > MAX_WRITE_SIZE {
            warn!(len, "attribute write too large");
            data.discard(len).await?;
            reply_code(&io, Error::InvalidArgument.code());
            return Ok(());
        }
        let payload = data.read_vec(len).await?;

        let target = match self.resolve(op, cmd) {
            Ok(t) => t,
            Err(e) => {
                reply_code(&io, e.code());
                return Ok(());
            }
        };
        let backend = self.daemon.backend().clone();

        self.spawn_reply(io, async move {
            match target {
                Target::One(attr) => {
                    let written = backend.write_attr(attr, &payload).await?;
                    Ok((written as i32, Vec::new()))
                }
                Target::All(attrs) => {
                    let entries = packed::decode(&payload, attrs.len())?;
                    for (attr, entry) in attrs.into_iter().zip(entries) {
                        if let Ok(value) = entry {
                            if !value.is_empty() {
                                backend.write_attr(attr, &value).await?;
                            }
                        }
                    }
                    Ok((payload.len() as i32, Vec::new()))
                }
            }
        });
        Ok(())
    }

    fn get_trigger(&self, io: &IiodIo, cmd: &Command) {
        let res = self
            .check_device(cmd)
            .and_then(|dev| self.daemon.backend().get_trigger(dev));
        let code = match res {
            Ok(Some(trig)) => trig as i32,
            Ok(None) => Error::NoDevice.code(),
            Err(e) => e.code(),
        };
        reply_code(io, code);
    }

    fn set_trigger(&self, io: &IiodIo, cmd: &Command) {
        let trigger = usize::try_from(cmd.code).ok();
        let res = self
            .check_device(cmd)
            .and_then(|dev| self.daemon.backend().set_trigger(dev, trigger));
        reply_result(io, res);
    }

    async fn create_buffer(&self, io: &IiodIo, cmd: &Command, data: &mut CommandData<'_>) -> Result<()> {
        let ctx = self.daemon.backend().context();
        let Some(device) = ctx.device(usize::from(cmd.dev)) else {
            reply_code(io, Error::InvalidArgument.code());
            return Ok(());
        };
        let nb_channels = device.channels().len();
        let raw = data.read_vec(ChannelsMask::new(nb_channels).wire_size()).await?;
        let mut mask = ChannelsMask::from_le_bytes(nb_channels, &raw)?;

        let dev = usize::from(cmd.dev);
        let idx = cmd.code_low();
        if self.daemon.find_buffer(dev, idx).is_some() {
            reply_code(io, Error::Busy.code());
            return Ok(());
        }

        let hw = match self.daemon.backend().create_buffer(dev, idx, &mut mask).await {
            Ok(hw) => hw,
            Err(e) => {
                warn!(dev, idx, error = %e, "buffer creation failed");
                reply_code(io, e.code());
                return Ok(());
            }
        };
        let is_tx = device.is_tx(&mask);
        let wire = mask.to_le_bytes();
        let entry = BufferEntry::start(dev, idx, self.session, mask, is_tx, hw);
        if let Err(e) = self.daemon.insert_buffer(entry.clone()) {
            entry.free().await;
            reply_code(io, e.code());
            return Ok(());
        }

        info!(dev, idx, is_tx, session = self.session, "buffer created");
        reply(io, wire.len() as i32, vec![Bytes::from(wire)]);
        Ok(())
    }

    async fn free_buffer(&self, io: &IiodIo, cmd: &Command) {
        let res = match self.check_device(cmd) {
            Err(e) => Err(e),
            Ok(dev) => match self.daemon.take_buffer(dev, cmd.code_low()) {
                None => Err(Error::BadDescriptor),
                Some(entry) => {
                    entry.free().await;
                    info!(dev, idx = entry.idx, "buffer freed");
                    Ok(())
                }
            },
        };
        reply_result(io, res);
    }

    async fn set_enabled(&self, io: &IiodIo, cmd: &Command, enabled: bool) {
        let res = match self.buffer(cmd) {
            Err(e) => Err(e),
            Ok(buf) if enabled => buf.enable().await,
            Ok(buf) => buf.disable().await,
        };
        debug!(dev = cmd.dev, idx = cmd.code_low(), enabled, ok = res.is_ok(), "buffer state");
        reply_result(io, res);
    }

    async fn create_block(
        &self,
        responder: &Responder,
        io: &IiodIo,
        cmd: &Command,
        data: &mut CommandData<'_>,
    ) -> Result<()> {
        let size = data.read_u64_le().await?;
        let res = match self.buffer(cmd) {
            Err(e) => Err(e),
            Ok(buf) => {
                let block_io = responder.io_from_command(cmd);
                buf.create_block(cmd.code_high(), size, block_io).await
            }
        };
        reply_result(io, res);
        Ok(())
    }

    async fn free_block(&self, io: &IiodIo, cmd: &Command) {
        let res = match self.buffer(cmd) {
            Err(e) => Err(e),
            Ok(buf) => buf.free_block(cmd.code_high()).await,
        };
        reply_result(io, res);
    }

    async fn transfer_block(
        &self,
        io: &IiodIo,
        cmd: &Command,
        data: &mut CommandData<'_>,
        cyclic: bool,
    ) -> Result<()> {
        let buf = match self.buffer(cmd) {
            Ok(buf) => buf,
            Err(e) => {
                warn!(dev = cmd.dev, idx = cmd.code_low(), "transfer on unknown buffer");
                reply_code(io, e.code());
                return Ok(());
            }
        };
        let bytes_used =
            usize::try_from(data.read_u64_le().await?).map_err(|_| Error::InvalidArgument)?;
        let block = cmd.code_high();

        let check = match buf.block_size(block) {
            None => Err(Error::BadDescriptor),
            Some(_) if bytes_used == 0 => Err(Error::InvalidArgument),
            Some(size) if bytes_used > size => Err(Error::InvalidArgument),
            Some(_) => Ok(()),
        };
        if let Err(e) = check {
            if buf.is_tx {
                data.discard(bytes_used).await?;
            }
            debug!(block, bytes_used, error = %e, "transfer rejected");
            reply_code(io, e.code());
            return Ok(());
        }

        let samples = if buf.is_tx {
            Bytes::from(data.read_vec(bytes_used).await?)
        } else {
            Bytes::new()
        };
        trace!(block, bytes_used, cyclic, "transfer queued");
        let queued = buf.transfer(Transfer {
            block,
            bytes_used,
            data: samples,
            cyclic,
        });
        if let Err(e) = queued {
            reply_code(io, e.code());
        }
        Ok(())
    }

    async fn create_evstream(&self, responder: &Responder, io: &IiodIo, cmd: &Command) {
        let res = match self.check_device(cmd) {
            Err(e) => Err(e),
            Ok(dev) => match self.daemon.backend().open_event_stream(dev).await {
                Err(e) => Err(e),
                Ok(stream) => {
                    let entry = EvstreamEntry::start(
                        dev,
                        self.session,
                        responder.io_from_command(cmd),
                        stream,
                    );
                    let inserted = self.daemon.insert_evstream(entry.clone());
                    if inserted.is_err() {
                        entry.free().await;
                    }
                    inserted
                }
            },
        };
        reply_result(io, res);
    }

    async fn free_evstream(&self, io: &IiodIo, cmd: &Command) {
        let res = match self.check_device(cmd) {
            Err(e) => Err(e),
            Ok(dev) => match self.daemon.take_evstream(self.session, dev, cmd.code as u16) {
                None => Err(Error::BadDescriptor),
                Some(entry) => {
                    entry.free().await;
                    Ok(())
                }
            },
        };
        reply_result(io, res);
    }

    async fn read_event(&self, io: &IiodIo, cmd: &Command) {
        let entry = self
            .check_device(cmd)
            .ok()
            .and_then(|dev| self.daemon.find_evstream(self.session, dev, cmd.client_id));
        let Some(entry) = entry else {
            warn!(client_id = cmd.client_id, "read on unknown event stream");
            return reply_code(io, Error::BadDescriptor.code());
        };

        if cmd.code != 0 {
            let res = entry.read_nonblocking().await;
            let io = io.clone();
            tokio::spawn(async move { reply_event(&io, res).await });
        } else if let Err(e) = entry.request() {
            reply_code(io, e.code());
        }
    }
}

#[async_trait]
impl CommandHandler for Connection {
    async fn handle(
        &self,
        responder: &Responder,
        cmd: &Command,
        data: &mut CommandData<'_>,
    ) -> Result<()> {
        let io = responder.io_from_command(cmd);
        let Ok(op) = cmd.opcode() else {
            warn!(op = cmd.op, "unknown opcode");
            reply_code(&io, Error::InvalidArgument.code());
            return Ok(());
        };
        trace!(?op, client_id = cmd.client_id, dev = cmd.dev, code = cmd.code, "command");

        match op {
            Opcode::Response => reply_code(&io, Error::InvalidArgument.code()),
            Opcode::Print => {
                let xml = self.daemon.xml().clone();
                reply(&io, xml.len() as i32, vec![xml]);
            }
            Opcode::ZPrint => match self.daemon.compressed_xml() {
                Some(z) => reply(&io, z.len() as i32, vec![z.clone()]),
                None => reply_code(&io, Error::InvalidArgument.code()),
            },
            Opcode::Timeout => {
                let res = u64::try_from(cmd.code)
                    .map(|ms| self.daemon.backend().set_timeout(ms))
                    .map_err(|_| Error::InvalidArgument);
                reply_result(&io, res);
            }
            Opcode::ReadAttr | Opcode::ReadDbgAttr | Opcode::ReadBufAttr | Opcode::ReadChnAttr => {
                self.read_attr(io, op, cmd)
            }
            Opcode::WriteAttr
            | Opcode::WriteDbgAttr
            | Opcode::WriteBufAttr
            | Opcode::WriteChnAttr => self.write_attr(io, op, cmd, data).await?,
            Opcode::GetTrig => self.get_trigger(&io, cmd),
            Opcode::SetTrig => self.set_trigger(&io, cmd),
            Opcode::CreateBuffer => self.create_buffer(&io, cmd, data).await?,
            Opcode::FreeBuffer => self.free_buffer(&io, cmd).await,
            Opcode::EnableBuffer => self.set_enabled(&io, cmd, true).await,
            Opcode::DisableBuffer => self.set_enabled(&io, cmd, false).await,
            Opcode::CreateBlock => self.create_block(responder, &io, cmd, data).await?,
            Opcode::FreeBlock => self.free_block(&io, cmd).await,
            Opcode::TransferBlock => self.transfer_block(&io, cmd, data, false).await?,
            Opcode::EnqueueBlockCyclic => self.transfer_block(&io, cmd, data, true).await?,
            Opcode::CreateEvstream => self.create_evstream(responder, &io, cmd).await,
            Opcode::FreeEvstream => self.free_evstream(&io, cmd).await,
            Opcode::ReadEvent => self.read_event(&io, cmd).await,
        }
        Ok(())
    }
}
