//! Binary framing for multiplexed packets
//!
//! Every packet on a physical connection is framed as:
//!
//! ```text
//! [length:4B][localId:4B][remoteId:4B][payload:(length-8)B]
//! ```
//!
//! All integers are big-endian. `length` counts the two ids and the payload
//! but not itself, so the smallest legal frame has `length == 8`.
//!
//! There is no delimiter to resynchronise on: a frame whose `length` is
//! below 8 (or above the configured maximum) is fatal for the connection.

mod codec;
mod error;
mod packet;
mod reader;
mod writer;

pub use codec::{decode, decode_from, encode, encode_into};
pub use error::FrameError;
pub use packet::Packet;
pub use reader::{DEFAULT_FRAME_TIMEOUT, DEFAULT_IDLE_TIMEOUT, FrameReader};
pub use writer::FrameWriter;

/// Size of the length prefix in bytes
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Size of the two channel ids that follow the length prefix
pub const IDS_SIZE: usize = 8;

/// Default upper bound on `length` (16 MiB)
///
/// Frames above this are rejected before any payload allocation happens.
pub const DEFAULT_MAX_FRAME_LENGTH: u32 = 16 * 1024 * 1024;
