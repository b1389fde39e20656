//! Framed byte transport.
//!
//! The responder owns one [`FrameReader`] (read half) and one
//! [`FrameWriter`] (write half) of any reliable ordered byte stream: a TCP
//! socket, a pipe or an in-process duplex.

use std::io::IoSlice;

use bytes::Bytes;
use iio_model::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{Command, HEADER_SIZE};

/// Boxed read half.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const DISCARD_CHUNK: usize = 4096;

/// Reading side of a connection.
pub struct FrameReader {
    inner: BoxedReader,
}

impl FrameReader {
    /// Wraps a read half.
    pub fn new(inner: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    /// Reads the next frame header. End of stream surfaces as
    /// [`Error::BrokenPipe`].
    pub async fn read_header(&mut self) -> Result<Command> {
        let mut raw = [0u8; HEADER_SIZE];
        self.read_exact(&mut raw).await?;
        Ok(Command::decode(&raw))
    }

    /// Fills `buf` completely.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).await?;
        Ok(())
    }

    /// Reads exactly `len` bytes into a new vector.
    pub async fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Reads a little-endian `u64`.
    pub async fn read_u64_le(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.read_exact(&mut raw).await?;
        Ok(u64::from_le_bytes(raw))
    }

    /// Reads and drops exactly `len` bytes.
    pub async fn discard(&mut self, mut len: usize) -> Result<()> {
        let mut scratch = [0u8; DISCARD_CHUNK];
        while len > 0 {
            let n = len.min(DISCARD_CHUNK);
            let got = self.inner.read(&mut scratch[..n]).await?;
            if got == 0 {
                return Err(Error::BrokenPipe);
            }
            len -= got;
        }
        Ok(())
    }
}

/// Writing side of a connection.
pub struct FrameWriter {
    inner: BoxedWriter,
}

impl FrameWriter {
    /// Wraps a write half.
    pub fn new(inner: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    /// Writes one frame (header then every payload buffer) as a single
    /// vectored batch, looping over short writes. Returns the payload size.
    pub async fn write_frame(&mut self, cmd: &Command, bufs: &[Bytes]) -> Result<usize> {
        let header = cmd.encode();
        let mut parts: Vec<&[u8]> = Vec::with_capacity(bufs.len() + 1);
        parts.push(&header);
        parts.extend(bufs.iter().filter(|b| !b.is_empty()).map(|b| b.as_ref()));

        let payload: usize = bufs.iter().map(Bytes::len).sum();
        let mut idx = 0;
        let mut offset = 0;

        while idx < parts.len() {
            let slices: Vec<IoSlice<'_>> = std::iter::once(IoSlice::new(&parts[idx][offset..]))
                .chain(parts[idx + 1..].iter().map(|p| IoSlice::new(p)))
                .collect();
            let mut written = self.inner.write_vectored(&slices).await?;
            if written == 0 {
                return Err(Error::BrokenPipe);
            }

            while idx < parts.len() && written >= parts[idx].len() - offset {
                written -= parts[idx].len() - offset;
                idx += 1;
                offset = 0;
            }
            offset += written;
        }

        self.inner.flush().await?;
        Ok(payload)
    }

    /// Closes the write half.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Opcode;

    #[tokio::test]
    async fn test_frame_round_trip_over_duplex() {
        let (a, b) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);

        let cmd = Command::new(4, Opcode::Response, 0, 10);
        let task = tokio::spawn(async move {
            writer
                .write_frame(&cmd, &[Bytes::from_static(b"hello"), Bytes::from_static(b"world")])
                .await
                .unwrap()
        });

        let hdr = reader.read_header().await.unwrap();
        assert_eq!(hdr, cmd);
        assert_eq!(reader.read_vec(10).await.unwrap(), b"helloworld");
        assert_eq!(task.await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_short_writes_are_resumed() {
        // a 3-byte pipe forces many partial writes
        let (a, b) = tokio::io::duplex(3);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);
        let payload = Bytes::from((0u8..=255).collect::<Vec<_>>());
        let cmd = Command::new(1, Opcode::Response, 0, 256);

        let expected = payload.clone();
        let task = tokio::spawn(async move { writer.write_frame(&cmd, &[payload]).await });

        assert_eq!(reader.read_header().await.unwrap().code, 256);
        assert_eq!(reader.read_vec(256).await.unwrap(), expected.to_vec());
        assert_eq!(task.await.unwrap().unwrap(), 256);
    }

    #[tokio::test]
    async fn test_discard_keeps_framing() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);
        writer
            .write_frame(&Command::new(1, Opcode::Response, 0, 5), &[Bytes::from_static(b"12345")])
            .await
            .unwrap();
        writer
            .write_frame(&Command::new(2, Opcode::Response, 0, 0), &[])
            .await
            .unwrap();

        let first = reader.read_header().await.unwrap();
        reader.discard(first.code as usize).await.unwrap();
        assert_eq!(reader.read_header().await.unwrap().client_id, 2);
    }

    #[tokio::test]
    async fn test_eof_is_broken_pipe() {
        let (a, b) = tokio::io::duplex(16);
        drop(a);
        let mut reader = FrameReader::new(b);
        assert_eq!(reader.read_header().await, Err(Error::BrokenPipe));
    }
}
