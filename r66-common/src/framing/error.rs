//! Frame error types

use std::io;

/// Errors raised while reading or writing frames
///
/// Every variant except `Io` on a write path is fatal for the physical
/// connection: the stream has no delimiter, so a bad frame leaves the
/// reader with no way to find the next boundary.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The length field is smaller than the two channel ids
    #[error("invalid frame length {0} (minimum is 8)")]
    InvalidLength(u32),

    /// The length field exceeds the configured maximum
    #[error("frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: u32, max: u32 },

    /// The payload does not fit in a frame
    #[error("payload of {0} bytes cannot be framed")]
    PayloadTooLarge(usize),

    /// The stream ended in the middle of a frame
    #[error("connection closed mid-frame")]
    ConnectionClosed,

    /// No data arrived within the idle timeout
    #[error("idle timeout")]
    IdleTimeout,

    /// A started frame did not complete within the frame timeout
    #[error("frame timeout")]
    FrameTimeout,

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Whether this error is a protocol framing violation (as opposed to a transport failure)
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidLength(_) | Self::FrameTooLarge { .. } | Self::PayloadTooLarge(_)
        )
    }
}
