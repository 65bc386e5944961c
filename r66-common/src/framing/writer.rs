//! Frame writer for sending packets to a stream

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::codec::encode_into;
use super::error::FrameError;
use super::packet::Packet;

/// Writes framed packets to an async writer
///
/// Each call writes one whole frame and flushes. A connection should have a
/// single `FrameWriter` owned by one task so frames never interleave.
pub struct FrameWriter<W> {
    writer: W,
    scratch: BytesMut,
}

impl<W> FrameWriter<W> {
    /// Create a new frame writer
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            scratch: BytesMut::new(),
        }
    }

    /// Get a reference to the underlying writer
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Consume the frame writer and return the underlying writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Write a packet to the stream
    ///
    /// # Errors
    ///
    /// Returns an error if the packet cannot be framed or an I/O error occurs.
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), FrameError> {
        self.scratch.clear();
        encode_into(packet, &mut self.scratch)?;
        self.writer.write_all(&self.scratch).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut down the write half of the stream
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
