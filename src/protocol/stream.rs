//! Reading and writing frames on an async byte stream.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Frame, FrameBuffer, DEFAULT_MAX_PARTS, DEFAULT_MAX_PART_SIZE};
use crate::error::{CallmeshError, Result};

/// Read buffer size.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Pulls whole frames off a byte stream.
pub struct FrameReader<R> {
    reader: R,
    buffer: FrameBuffer,
    ready: VecDeque<Frame>,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_buffer(reader, FrameBuffer::new())
    }

    /// Use a pre-configured [`FrameBuffer`] (custom limits).
    pub fn with_buffer(reader: R, buffer: FrameBuffer) -> Self {
        Self {
            reader,
            buffer,
            ready: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK_SIZE],
        }
    }

    /// Wait for the next frame.
    ///
    /// Returns `Ok(None)` when the peer closes the stream between frames.
    ///
    /// # Errors
    ///
    /// `TransportRead` if the read fails or the stream ends mid-frame,
    /// `Protocol` if the bytes do not form a valid frame.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }

            let n = self
                .reader
                .read(&mut self.chunk)
                .await
                .map_err(|e| CallmeshError::TransportRead(e.to_string()))?;

            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(CallmeshError::TransportRead(format!(
                    "Connection closed with {} bytes of a partial frame",
                    self.buffer.len()
                )));
            }

            self.ready.extend(self.buffer.push(&self.chunk[..n])?);
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Read exactly one frame, failing if the stream closes first.
///
/// Consumes only the bytes of that frame, so the stream can be handed to
/// another reader or called again for the next frame. Limits are the
/// defaults of [`FrameBuffer`].
///
/// # Errors
///
/// `TransportRead` if the read fails or the stream ends, `Protocol` if a
/// limit is exceeded or the parts do not form a valid frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let count = reader.read_u16().await.map_err(read_error)?;
    if count == 0 || count > DEFAULT_MAX_PARTS {
        return Err(CallmeshError::Protocol(format!(
            "Part count {} outside 1..={}",
            count, DEFAULT_MAX_PARTS
        )));
    }

    let mut parts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32().await.map_err(read_error)?;
        if len > DEFAULT_MAX_PART_SIZE {
            return Err(CallmeshError::Protocol(format!(
                "Part size {} exceeds maximum {}",
                len, DEFAULT_MAX_PART_SIZE
            )));
        }
        let mut part = vec![0u8; len as usize];
        reader.read_exact(&mut part).await.map_err(read_error)?;
        parts.push(Bytes::from(part));
    }
    Frame::from_parts(parts)
}

fn read_error(err: std::io::Error) -> CallmeshError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        CallmeshError::TransportRead("Connection closed".to_string())
    } else {
        CallmeshError::TransportRead(err.to_string())
    }
}

/// Write one frame and flush.
///
/// # Errors
///
/// `TransportWrite` when the stream rejects the bytes.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let bytes = frame.encode()?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| CallmeshError::TransportWrite(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| CallmeshError::TransportWrite(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::{Signal, Tag};

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut client, server) = tokio::io::duplex(1024);
        let frame = Frame::request("read", vec![Bytes::new(), Bytes::from_static(b"body")]);

        write_frame(&mut client, &frame).await.unwrap();
        write_frame(&mut client, &Frame::control(vec![], Signal::Ping))
            .await
            .unwrap();
        drop(client);

        let mut reader = FrameReader::new(server);
        assert_eq!(reader.next_frame().await.unwrap(), Some(frame));
        assert!(reader.next_frame().await.unwrap().unwrap().is_control());
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_eof_mid_frame() {
        let (mut client, server) = tokio::io::duplex(1024);
        let bytes = Frame::request("read", vec![Bytes::from_static(b"body")])
            .encode()
            .unwrap();
        client.write_all(&bytes[..bytes.len() - 1]).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server);
        assert!(matches!(
            reader.next_frame().await,
            Err(CallmeshError::TransportRead(_))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_on_closed_stream() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(matches!(
            read_frame(&mut server).await,
            Err(CallmeshError::TransportRead(_))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_back_to_back() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = Frame::request("read", vec![Bytes::from_static(b"body")]);

        write_frame(&mut client, &Frame::control(vec![], Signal::Ping))
            .await
            .unwrap();
        write_frame(&mut client, &request).await.unwrap();
        write_frame(&mut client, &Frame::control(vec![], Signal::Pong))
            .await
            .unwrap();

        let first = read_frame(&mut server).await.unwrap();
        assert_eq!(first.tag, Tag::Control(Signal::Ping));

        let second = tokio::time::timeout(Duration::from_secs(1), read_frame(&mut server))
            .await
            .expect("second frame lost")
            .unwrap();
        assert_eq!(second, request);

        // The rest of the stream is still framed correctly.
        let mut reader = FrameReader::new(server);
        let third = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(third.tag, Tag::Control(Signal::Pong));
    }

    #[tokio::test]
    async fn test_read_frame_eof_mid_part() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let bytes = Frame::request("read", vec![Bytes::from_static(b"body")])
            .encode()
            .unwrap();
        client.write_all(&bytes[..bytes.len() - 2]).await.unwrap();
        drop(client);

        assert!(matches!(
            read_frame(&mut server).await,
            Err(CallmeshError::TransportRead(_))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_zero_parts() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0]).await.unwrap();

        assert!(matches!(
            read_frame(&mut server).await,
            Err(CallmeshError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_write_to_closed_stream() {
        let (mut client, server) = tokio::io::duplex(64);
        drop(server);
        let err = write_frame(&mut client, &Frame::control(vec![], Signal::Pong))
            .await
            .unwrap_err();
        assert!(matches!(err, CallmeshError::TransportWrite(_)));
    }
}
