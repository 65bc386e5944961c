//! R66 Common Library
//!
//! Wire protocol and shared types for the R66 managed file transfer engine.

pub mod framing;
pub mod run;
pub mod session;

/// Protocol version announced in the startup banner
pub const PROTOCOL_VERSION: &str = "0.3.2";

/// Default port for R66 connections
pub const DEFAULT_PORT: u16 = 6666;

/// Channel id meaning "no channel yet"
///
/// A packet whose `local_id` is `NO_CHANNEL` asks the receiver to create a
/// new local channel. Keep-alive packets travel on `(NO_CHANNEL, NO_CHANNEL)`.
pub const NO_CHANNEL: i32 = i32::MIN;

/// Default transfer block size in bytes (64 KiB)
pub const DEFAULT_BLOCK_SIZE: u32 = 64 * 1024;

/// Largest block size a peer may request (1 MiB)
///
/// Kept well under the default maximum frame length so a `Data` packet
/// always fits in one frame.
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;
