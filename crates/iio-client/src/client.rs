//! Connection to a remote IIOD daemon.
//!
//! A [`Client`] fetches the daemon's context description once, at
//! connection time, and from then on addresses devices, channels and
//! attributes by their position in that description. Every request runs on
//! its own io, so a client can be shared between tasks freely.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use iio_model::attr::{packed, parse_double, parse_longlong, value_text};
use iio_model::{xml, AttrOwner, AttrRef, AvailableValues, ChannelsMask, Context, Error, Result};
use iio_transport::{
    pack_code, Command, CommandData, CommandHandler, IiodIo, Opcode, Responder, TcpTransport,
    TcpTransportConfig, ALL_ATTRS, MAX_ATTR_SIZE,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::buffer::Buffer;
use crate::config::ClientConfig;
use crate::evstream::EventStream;

/// Largest context description accepted.
pub const MAX_XML_SIZE: usize = 16 * 1024 * 1024;

const XML_MAGIC: &[u8] = b"<?xml";

/// Daemons never send commands to clients.
struct RefuseCommands;

#[async_trait]
impl CommandHandler for RefuseCommands {
    async fn handle(&self, _: &Responder, cmd: &Command, _: &mut CommandData<'_>) -> Result<()> {
        warn!(op = cmd.op, "daemon sent a command, closing");
        Err(Error::NotSupported)
    }
}

/// Wire routing of one attribute list.
struct Route {
    read: Opcode,
    write: Opcode,
    dev: u8,
    low: u16,
}

struct ClientInner {
    responder: Responder,
    ctx: Context,
    config: ClientConfig,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.responder.stop();
    }
}

/// Handle to a remote context. Clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("context", &self.inner.ctx.name)
            .field("devices", &self.inner.ctx.devices().len())
            .field("config", &self.inner.config)
            .finish()
    }
}

fn decode_xml(data: Vec<u8>) -> Result<String> {
    let raw = if data.starts_with(XML_MAGIC) {
        data
    } else {
        debug!(len = data.len(), "decompressing context description");
        zstd::decode_all(data.as_slice())?
    };
    String::from_utf8(raw).map_err(|e| Error::Xml {
        reason: e.to_string(),
    })
}

async fn fetch_xml(responder: &Responder, use_zstd: bool) -> Result<String> {
    let io = responder.create_io()?;
    if use_zstd {
        match io.exec_command(Opcode::ZPrint, 0, 0, Vec::new(), MAX_XML_SIZE).await {
            Ok(resp) => return decode_xml(resp.data),
            Err(Error::InvalidArgument) => {
                debug!("compressed context description refused, asking for plain XML")
            }
            Err(e) => return Err(e),
        }
    }
    let resp = io.exec_command(Opcode::Print, 0, 0, Vec::new(), MAX_XML_SIZE).await?;
    decode_xml(resp.data)
}

impl Client {
    /// Connects to `host:port` over TCP.
    pub async fn connect(host: &str, port: u16, config: ClientConfig) -> Result<Self> {
        let transport = TcpTransport::new(TcpTransportConfig {
            connect_timeout_ms: config.connect_timeout_ms,
            nodelay: config.nodelay,
        });
        let addr = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        let stream = transport.connect(&addr).await?;
        let (read, write) = stream.into_split();
        let client = Self::from_stream(read, write, config).await?;
        info!(%addr, devices = client.context().devices().len(), "connected");
        Ok(client)
    }

    /// Runs the protocol over any pair of byte stream halves and fetches
    /// the context description.
    pub async fn from_stream<R, W>(read: R, write: W, config: ClientConfig) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let responder = Responder::new(read, write, Arc::new(RefuseCommands));
        responder.set_timeout(config.timeout_ms);

        let ctx = match fetch_xml(&responder, config.use_zstd).await {
            Ok(text) => xml::parse(&text),
            Err(e) => Err(e),
        };
        let ctx = match ctx {
            Ok(ctx) => ctx,
            Err(e) => {
                responder.stop();
                return Err(e);
            }
        };

        Ok(Self {
            inner: Arc::new(ClientInner {
                responder,
                ctx,
                config,
            }),
        })
    }

    /// The remote context, as described by the daemon.
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Settings this client was created with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The connection's protocol engine.
    pub fn responder(&self) -> &Responder {
        &self.inner.responder
    }

    /// A fresh io for one request.
    pub(crate) fn create_io(&self) -> Result<IiodIo> {
        self.inner.responder.create_io()
    }

    /// Sends a command whose answer nobody waits for, from a context that
    /// cannot await (a `Drop` impl). The io lives until the answer arrives
    /// so its client id is not reused too early.
    pub(crate) fn release(&self, op: Opcode, dev: u8, code: i32) {
        let io = match self.create_io() {
            Ok(io) => io,
            Err(e) => {
                debug!(?op, error = %e, "release not sent");
                return;
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = io.exec_simple_command(op, dev, code).await {
                        debug!(?op, code, error = %e, "release failed");
                    }
                });
            }
            Err(_) => {
                if let Err(e) = io.send_command_async(op, dev, code, Vec::new()) {
                    debug!(?op, error = %e, "release not sent");
                }
            }
        }
    }

    /// Wire index of device `dev`.
    pub(crate) fn dev_index(&self, dev: usize) -> Result<u8> {
        self.inner.ctx.device(dev).ok_or(Error::NoDevice)?;
        u8::try_from(dev).map_err(|_| Error::InvalidArgument)
    }

    /// Closes the connection. Pending requests fail with `EINTR`.
    pub async fn shutdown(&self) {
        self.inner.responder.shutdown().await;
    }

    fn route(&self, owner: AttrOwner) -> Result<Route> {
        let (read, write, dev, low) = match owner {
            AttrOwner::Context => return Err(Error::InvalidArgument),
            AttrOwner::Device(dev) => (Opcode::ReadAttr, Opcode::WriteAttr, dev, 0),
            AttrOwner::Debug(dev) => (Opcode::ReadDbgAttr, Opcode::WriteDbgAttr, dev, 0),
            AttrOwner::Buffer { dev, buffer } => (Opcode::ReadBufAttr, Opcode::WriteBufAttr, dev, buffer),
            AttrOwner::Channel { dev, chn } => {
                let low = u16::try_from(chn).map_err(|_| Error::InvalidArgument)?;
                (Opcode::ReadChnAttr, Opcode::WriteChnAttr, dev, low)
            }
        };
        Ok(Route {
            read,
            write,
            dev: self.dev_index(dev)?,
            low,
        })
    }

    fn attr_index(&self, attr: AttrRef) -> Result<u16> {
        self.inner.ctx.attr(attr).ok_or(Error::NotFound)?;
        u16::try_from(attr.index)
            .ok()
            .filter(|&i| i != ALL_ATTRS)
            .ok_or(Error::InvalidArgument)
    }

    /// Looks an attribute up by name.
    pub fn find_attr(&self, owner: AttrOwner, name: &str) -> Result<AttrRef> {
        self.inner.ctx.find_attr(owner, name).ok_or(Error::NotFound)
    }

    /// Reads the raw value of an attribute. Context attributes are
    /// answered from the description without a round trip.
    pub async fn read_attr(&self, attr: AttrRef) -> Result<Vec<u8>> {
        if attr.owner == AttrOwner::Context {
            let meta = self.inner.ctx.attr(attr).ok_or(Error::NotFound)?;
            return Ok(meta.value.clone().unwrap_or_default().into_bytes());
        }
        let route = self.route(attr.owner)?;
        let code = pack_code(self.attr_index(attr)?, route.low);
        let io = self.create_io()?;
        let resp = io
            .exec_command(route.read, route.dev, code, Vec::new(), MAX_ATTR_SIZE)
            .await?;
        Ok(resp.data)
    }

    /// Writes the raw value of an attribute and returns the number of
    /// bytes the daemon accepted.
    pub async fn write_attr(&self, attr: AttrRef, value: &[u8]) -> Result<usize> {
        if attr.owner == AttrOwner::Context {
            return Err(Error::PermissionDenied);
        }
        let route = self.route(attr.owner)?;
        let code = pack_code(self.attr_index(attr)?, route.low);
        let io = self.create_io()?;
        let bufs = vec![
            Bytes::copy_from_slice(&(value.len() as u64).to_le_bytes()),
            Bytes::copy_from_slice(value),
        ];
        let resp = io.exec_command(route.write, route.dev, code, bufs, 0).await?;
        Ok(resp.code as usize)
    }

    /// Reads every attribute of `owner` in one request, in index order.
    pub async fn read_all_attrs(&self, owner: AttrOwner) -> Result<Vec<Result<Vec<u8>>>> {
        let list = self.inner.ctx.attr_list(owner).ok_or(Error::NotFound)?;
        if owner == AttrOwner::Context {
            return Ok(list
                .iter()
                .map(|a| Ok(a.value.clone().unwrap_or_default().into_bytes()))
                .collect());
        }
        let route = self.route(owner)?;
        let io = self.create_io()?;
        let resp = io
            .exec_command(route.read, route.dev, pack_code(ALL_ATTRS, route.low), Vec::new(), MAX_XML_SIZE)
            .await?;
        packed::decode(&resp.data, list.len())
    }

    /// Writes every attribute of `owner` in one request. `values` holds one
    /// entry per attribute in index order; empty entries are left alone.
    pub async fn write_all_attrs(&self, owner: AttrOwner, values: &[Vec<u8>]) -> Result<usize> {
        if owner == AttrOwner::Context {
            return Err(Error::PermissionDenied);
        }
        let list = self.inner.ctx.attr_list(owner).ok_or(Error::NotFound)?;
        if values.len() != list.len() {
            return Err(Error::InvalidArgument);
        }
        let entries: Vec<packed::Entry> = values.iter().cloned().map(Ok).collect();
        let payload = packed::encode(&entries);

        let route = self.route(owner)?;
        let io = self.create_io()?;
        let bufs = vec![
            Bytes::copy_from_slice(&(payload.len() as u64).to_le_bytes()),
            Bytes::from(payload),
        ];
        let resp = io
            .exec_command(route.write, route.dev, pack_code(ALL_ATTRS, route.low), bufs, 0)
            .await?;
        Ok(resp.code as usize)
    }

    /// Reads an attribute as text: up to the first NUL, without the
    /// trailing newline.
    pub async fn read_string(&self, attr: AttrRef) -> Result<String> {
        Ok(value_text(&self.read_attr(attr).await?))
    }

    /// Reads an integer attribute; the base follows the usual C prefixes.
    pub async fn read_longlong(&self, attr: AttrRef) -> Result<i64> {
        parse_longlong(&self.read_attr(attr).await?)
    }

    /// Reads a boolean attribute (any non-zero integer is true).
    pub async fn read_bool(&self, attr: AttrRef) -> Result<bool> {
        Ok(self.read_longlong(attr).await? != 0)
    }

    /// Reads a floating point attribute.
    pub async fn read_double(&self, attr: AttrRef) -> Result<f64> {
        parse_double(&self.read_attr(attr).await?)
    }

    /// Reads and parses an `*_available` attribute.
    pub async fn read_available(&self, attr: AttrRef) -> Result<AvailableValues> {
        let meta = self.inner.ctx.attr(attr).ok_or(Error::NotFound)?;
        if !meta.is_available_list() || matches!(attr.owner, AttrOwner::Buffer { .. }) {
            return Err(Error::InvalidArgument);
        }
        AvailableValues::parse(&self.read_string(attr).await?)
    }

    /// Writes a string, NUL terminated.
    pub async fn write_string(&self, attr: AttrRef, value: &str) -> Result<usize> {
        let mut raw = Vec::with_capacity(value.len() + 1);
        raw.extend_from_slice(value.as_bytes());
        raw.push(0);
        self.write_attr(attr, &raw).await
    }

    /// Writes `1` or `0`.
    pub async fn write_bool(&self, attr: AttrRef, value: bool) -> Result<usize> {
        self.write_string(attr, if value { "1" } else { "0" }).await
    }

    /// Writes an integer in decimal.
    pub async fn write_longlong(&self, attr: AttrRef, value: i64) -> Result<usize> {
        self.write_string(attr, &value.to_string()).await
    }

    /// Writes a float with the shortest representation that reads back
    /// to the same value.
    pub async fn write_double(&self, attr: AttrRef, value: f64) -> Result<usize> {
        self.write_string(attr, &value.to_string()).await
    }

    /// Trigger of device `dev`, if one is set.
    pub async fn get_trigger(&self, dev: usize) -> Result<Option<usize>> {
        let io = self.create_io()?;
        match io.exec_simple_command(Opcode::GetTrig, self.dev_index(dev)?, 0).await {
            Ok(trig) => {
                let trig = trig as usize;
                self.inner.ctx.device(trig).ok_or(Error::NoSuchAddress)?;
                Ok(Some(trig))
            }
            Err(Error::NoDevice) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sets or clears the trigger of device `dev`.
    pub async fn set_trigger(&self, dev: usize, trigger: Option<usize>) -> Result<()> {
        let code = match trigger {
            None => -1,
            Some(t) => {
                let is_trigger = self.inner.ctx.device(t).is_some_and(|d| d.is_trigger());
                if !is_trigger {
                    return Err(Error::InvalidArgument);
                }
                i32::from(self.dev_index(t)?)
            }
        };
        let io = self.create_io()?;
        io.exec_simple_command(Opcode::SetTrig, self.dev_index(dev)?, code).await?;
        Ok(())
    }

    /// Sets the timeout of requests made from now on and asks the daemon to
    /// give up on hardware I/O after half of it.
    pub async fn set_timeout(&self, timeout_ms: u64) -> Result<()> {
        self.inner.responder.set_timeout(timeout_ms);
        let remote = i32::try_from(timeout_ms / 2).map_err(|_| Error::InvalidArgument)?;
        let io = self.create_io()?;
        io.exec_simple_command(Opcode::Timeout, 0, remote).await?;
        Ok(())
    }

    /// Creates buffer `idx` on device `dev` with the channels of `mask`.
    pub async fn create_buffer(&self, dev: usize, idx: u16, mask: &ChannelsMask) -> Result<Buffer> {
        Buffer::create(self.clone(), dev, idx, mask).await
    }

    /// Opens the event stream of device `dev`.
    pub async fn open_event_stream(&self, dev: usize) -> Result<EventStream> {
        EventStream::open(self.clone(), dev).await
    }
}
