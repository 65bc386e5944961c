//! Frame reader for parsing packets from a stream

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use super::codec::decode_from;
use super::error::FrameError;
use super::packet::Packet;
use super::{DEFAULT_MAX_FRAME_LENGTH, LENGTH_FIELD_SIZE};

/// Default timeout for completing a frame once its first byte is received
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(60);

/// Default idle timeout (waiting for the first byte of a frame)
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Initial read buffer capacity
const INITIAL_BUFFER_SIZE: usize = 8 * 1024;

/// Reads framed packets from an async reader
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    max_frame_length: u32,
}

impl<R> FrameReader<R> {
    /// Create a new frame reader with the default maximum frame length
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_length(reader, DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Create a new frame reader with a custom maximum frame length
    pub fn with_max_frame_length(reader: R, max_frame_length: u32) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            max_frame_length,
        }
    }

    /// Get a reference to the underlying reader
    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    /// Consume the frame reader and return the underlying reader
    ///
    /// Any bytes already buffered but not yet decoded are lost.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Read the next packet from the stream
    ///
    /// Returns `Ok(None)` if the connection is cleanly closed between frames.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is malformed, the stream ends mid-frame,
    /// or an I/O error occurs.
    ///
    /// # Note
    ///
    /// This method has no timeout. Prefer
    /// [`read_packet_with_timeout`](Self::read_packet_with_timeout) on network streams.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>, FrameError> {
        loop {
            if let Some(packet) = decode_from(&mut self.buffer, self.max_frame_length)? {
                return Ok(Some(packet));
            }
            if !self.fill().await? {
                return self.eof();
            }
        }
    }

    /// Read the next packet with idle and frame timeouts
    ///
    /// `idle_timeout` bounds the wait for the first byte of a frame and
    /// `frame_timeout` bounds the time to complete it once started.
    pub async fn read_packet_with_timeout(
        &mut self,
        idle_timeout: Duration,
        frame_timeout: Duration,
    ) -> Result<Option<Packet>, FrameError> {
        if self.buffer.is_empty() {
            match timeout(idle_timeout, self.fill()).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => return Ok(None), // Clean disconnect
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(FrameError::IdleTimeout),
            }
        }

        match timeout(frame_timeout, self.read_packet()).await {
            Ok(result) => result,
            Err(_) => Err(FrameError::FrameTimeout),
        }
    }

    /// Read more bytes into the buffer, returning false on EOF
    async fn fill(&mut self) -> Result<bool, FrameError> {
        if self.buffer.capacity() - self.buffer.len() < LENGTH_FIELD_SIZE {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }
        let n = self.reader.read_buf(&mut self.buffer).await?;
        Ok(n > 0)
    }

    fn eof(&self) -> Result<Option<Packet>, FrameError> {
        if self.buffer.is_empty() {
            Ok(None)
        } else {
            Err(FrameError::ConnectionClosed)
        }
    }
}
