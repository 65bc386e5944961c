//! Multiplexed packet

use std::fmt;

use bytes::Bytes;

use super::IDS_SIZE;

/// One framed unit on a physical connection
///
/// Immutable once built. `local_id` is the receiving side's channel id and
/// `remote_id` the sending side's, so a reply swaps them (see [`Packet::reply`]).
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    local_id: i32,
    remote_id: i32,
    payload: Bytes,
}

impl Packet {
    /// Create a packet
    pub fn new(local_id: i32, remote_id: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            local_id,
            remote_id,
            payload: payload.into(),
        }
    }

    /// Channel id on the receiving side
    pub fn local_id(&self) -> i32 {
        self.local_id
    }

    /// Channel id on the sending side
    pub fn remote_id(&self) -> i32 {
        self.remote_id
    }

    /// Payload bytes
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the packet, returning its payload
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Value of the length field for this packet (ids plus payload)
    pub fn frame_length(&self) -> usize {
        IDS_SIZE + self.payload.len()
    }

    /// Build a packet travelling the other way on the same channel pair
    pub fn reply(&self, payload: impl Into<Bytes>) -> Self {
        Self::new(self.remote_id, self.local_id, payload)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
