//! One logical session on a multiplexed connection

use std::fmt;
use std::sync::Weak;

use r66_common::NO_CHANNEL;
use r66_common::framing::Packet;
use r66_common::session::{LocalPacket, SessionCodecError};
use tokio::sync::{mpsc, watch};

use super::Multiplexer;

/// Errors raised when sending on a channel
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The connection is gone; the packet was not queued
    #[error("channel closed")]
    Closed,

    #[error("cannot encode packet: {0}")]
    Codec(#[from] SessionCodecError),
}

/// Handle held by the session driving one channel
///
/// Refers back to its multiplexer weakly, by id. Dropping the handle
/// closes the channel.
pub struct Channel {
    local_id: i32,
    remote_id: i32,
    inbound: mpsc::Receiver<Packet>,
    outbound: mpsc::Sender<Packet>,
    cancel: watch::Receiver<bool>,
    mux: Weak<Multiplexer>,
}

impl Channel {
    pub(super) fn new(
        local_id: i32,
        remote_id: i32,
        inbound: mpsc::Receiver<Packet>,
        outbound: mpsc::Sender<Packet>,
        cancel: watch::Receiver<bool>,
        mux: Weak<Multiplexer>,
    ) -> Self {
        Self {
            local_id,
            remote_id,
            inbound,
            outbound,
            cancel,
            mux,
        }
    }

    /// This side's id for the channel
    pub fn local_id(&self) -> i32 {
        self.local_id
    }

    /// The peer's id, or `NO_CHANNEL` until its first reply
    pub fn remote_id(&self) -> i32 {
        self.remote_id
    }

    /// Receive the next packet routed to this channel
    ///
    /// Returns `None` once the channel or its connection is closed.
    pub async fn recv(&mut self) -> Option<Packet> {
        let packet = self.inbound.recv().await?;
        if self.remote_id == NO_CHANNEL {
            self.remote_id = packet.remote_id();
        }
        Some(packet)
    }

    /// Receive and decode the next session packet
    ///
    /// `None` means the channel closed; `Some(Err(_))` is a malformed payload.
    pub async fn recv_local(&mut self) -> Option<Result<LocalPacket, SessionCodecError>> {
        let packet = self.recv().await?;
        Some(LocalPacket::decode(packet.payload()))
    }

    /// Take a packet that is already queued, without waiting
    pub fn try_recv_local(&mut self) -> Option<Result<LocalPacket, SessionCodecError>> {
        let packet = self.inbound.try_recv().ok()?;
        if self.remote_id == NO_CHANNEL {
            self.remote_id = packet.remote_id();
        }
        Some(LocalPacket::decode(packet.payload()))
    }

    /// Queue a session packet for the peer
    ///
    /// Waits while the connection's outbound queue is full.
    pub async fn send(&self, packet: &LocalPacket) -> Result<(), ChannelError> {
        let payload = packet.encode()?;
        self.outbound
            .send(Packet::new(self.remote_id, self.local_id, payload))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Attach a transfer run; returns false if the channel is already closed
    pub fn bind_run(&self, run_id: i64) -> bool {
        self.mux
            .upgrade()
            .is_some_and(|mux| mux.bind_run(self.local_id, run_id))
    }

    /// Whether the channel was closed from the connection side
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// A receiver that flips to `true` when the channel is closed
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel.clone()
    }

    /// Close the channel and detach its run
    pub fn close(&self) {
        if let Some(mux) = self.mux.upgrade() {
            mux.close(self.local_id);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .finish()
    }
}
