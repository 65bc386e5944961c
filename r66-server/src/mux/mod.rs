//! Local channel multiplexer
//!
//! Routes packets of one physical connection to the local channels riding
//! on it. A channel is identified by the pair `(local_id, remote_id)`:
//! `local_id` is allocated here and `remote_id` is the peer's id for the
//! same channel. The multiplexer only routes; it never touches run status.
//!
//! Inbound packets for a channel are queued in arrival order. A channel whose
//! queue stays full past the stall timeout is closed, so one session that
//! stops reading cannot hold up the others. Outbound packets from every
//! channel share one queue drained by the connection's single writer task,
//! so frames are never interleaved.

mod channel;

pub use channel::{Channel, ChannelError};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use r66_common::NO_CHANNEL;
use r66_common::framing::Packet;
use r66_common::session::LocalPacket;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::constants::{CHANNEL_QUEUE_CAPACITY, CHANNEL_STALL_TIMEOUT};

/// Result of routing one inbound packet
#[derive(Debug)]
pub enum Dispatch {
    /// Queued for an existing channel
    Delivered,
    /// A startup packet opened a new channel; the packet is already queued on it
    Opened(Channel),
    /// Connection-level packet on `(NO_CHANNEL, NO_CHANNEL)`
    Control(Packet),
    /// No channel matches the pair; the packet was dropped
    Dropped,
    /// The channel's queue stayed full; the channel was closed and the
    /// packet dropped. `run_id` is set for runs the connection must settle.
    Stalled {
        local_id: i32,
        remote_id: i32,
        run_id: Option<i64>,
    },
}

struct ChannelEntry {
    remote_id: i32,
    inbound: mpsc::Sender<Packet>,
    run_id: Option<i64>,
    cancel: watch::Sender<bool>,
    /// Opened by a startup packet from the peer rather than by [`Multiplexer::open`]
    opened_by_peer: bool,
}

impl ChannelEntry {
    /// Run the connection settles when this channel dies
    ///
    /// Whoever opens a channel locally settles its run once the session ends.
    fn settled_run(&self) -> Option<i64> {
        self.run_id.filter(|_| self.opened_by_peer)
    }
}

/// Routing table for one physical connection
pub struct Multiplexer {
    peer: Option<SocketAddr>,
    next_local_id: AtomicI32,
    channels: Mutex<HashMap<i32, ChannelEntry>>,
    /// Taken on `close_all` so the writer task sees the queue close
    outbound: Mutex<Option<mpsc::Sender<Packet>>>,
    stall_timeout: Duration,
}

impl Multiplexer {
    /// Create a multiplexer writing to `outbound`
    pub fn new(peer: Option<SocketAddr>, outbound: mpsc::Sender<Packet>) -> Arc<Self> {
        Self::with_stall_timeout(peer, outbound, CHANNEL_STALL_TIMEOUT)
    }

    /// Create a multiplexer that closes channels whose queue stays full for
    /// `stall_timeout`
    pub fn with_stall_timeout(
        peer: Option<SocketAddr>,
        outbound: mpsc::Sender<Packet>,
        stall_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            next_local_id: AtomicI32::new(1),
            channels: Mutex::new(HashMap::new()),
            outbound: Mutex::new(Some(outbound)),
            stall_timeout,
        })
    }

    /// Open a channel towards `remote_id`
    ///
    /// Pass `NO_CHANNEL` when initiating: the peer's id is learned from its
    /// first reply. Returns `None` once the connection is closing or local
    /// ids are exhausted.
    pub fn open(self: &Arc<Self>, remote_id: i32) -> Option<Channel> {
        self.open_with(remote_id, None)
    }

    fn open_with(self: &Arc<Self>, remote_id: i32, first: Option<Packet>) -> Option<Channel> {
        let outbound = self
            .outbound
            .lock()
            .expect("multiplexer outbound lock poisoned")
            .clone()?;

        // Ids only grow; running out is preferable to reusing one
        let local_id = self
            .next_local_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
            .ok()?;

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_QUEUE_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let opened_by_peer = first.is_some();

        if let Some(packet) = first {
            // Fresh queue with spare capacity; cannot fail
            let _ = inbound_tx.try_send(packet);
        }

        self.channels
            .lock()
            .expect("multiplexer lock poisoned")
            .insert(
                local_id,
                ChannelEntry {
                    remote_id,
                    inbound: inbound_tx,
                    run_id: None,
                    cancel: cancel_tx,
                    opened_by_peer,
                },
            );

        Some(Channel::new(
            local_id,
            remote_id,
            inbound_rx,
            outbound,
            cancel_rx,
            Arc::downgrade(self),
        ))
    }

    /// Route an inbound packet
    ///
    /// Packets for one channel are delivered in the order they are
    /// dispatched. Waits up to the stall timeout when the channel's queue is
    /// full, then closes that channel.
    pub async fn dispatch(self: &Arc<Self>, packet: Packet) -> Dispatch {
        if packet.local_id() == NO_CHANNEL {
            if packet.remote_id() == NO_CHANNEL {
                return Dispatch::Control(packet);
            }
            return match self.open_with(packet.remote_id(), Some(packet)) {
                Some(channel) => Dispatch::Opened(channel),
                None => Dispatch::Dropped,
            };
        }

        let inbound = {
            let mut channels = self.channels.lock().expect("multiplexer lock poisoned");
            match channels.get_mut(&packet.local_id()) {
                Some(entry) if entry.remote_id == packet.remote_id() => Some(entry.inbound.clone()),
                Some(entry) if entry.remote_id == NO_CHANNEL => {
                    entry.remote_id = packet.remote_id();
                    Some(entry.inbound.clone())
                }
                _ => None,
            }
        };

        let local_id = packet.local_id();
        let remote_id = packet.remote_id();
        let Some(inbound) = inbound else {
            debug!(peer = ?self.peer, local_id, remote_id, "routing miss, packet dropped");
            return Dispatch::Dropped;
        };

        let packet = match inbound.try_send(packet) {
            Ok(()) => return Dispatch::Delivered,
            Err(TrySendError::Full(packet)) => packet,
            Err(TrySendError::Closed(_)) => {
                debug!(peer = ?self.peer, local_id, remote_id, "channel gone, packet dropped");
                return Dispatch::Dropped;
            }
        };

        match inbound.send_timeout(packet, self.stall_timeout).await {
            Ok(()) => Dispatch::Delivered,
            Err(SendTimeoutError::Closed(_)) => {
                debug!(peer = ?self.peer, local_id, remote_id, "channel gone, packet dropped");
                Dispatch::Dropped
            }
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(peer = ?self.peer, local_id, remote_id, "channel stopped reading, closing it");
                let run_id = self.remove(local_id).and_then(|entry| entry.settled_run());
                Dispatch::Stalled {
                    local_id,
                    remote_id,
                    run_id,
                }
            }
        }
    }

    /// Attach a transfer run to a channel
    ///
    /// Returns false if the channel is already closed.
    pub fn bind_run(&self, local_id: i32, run_id: i64) -> bool {
        match self
            .channels
            .lock()
            .expect("multiplexer lock poisoned")
            .get_mut(&local_id)
        {
            Some(entry) => {
                entry.run_id = Some(run_id);
                true
            }
            None => false,
        }
    }

    /// Close one channel
    ///
    /// Idempotent. Cancels the channel's pipeline at its next task boundary.
    pub fn close(&self, local_id: i32) {
        self.remove(local_id);
    }

    fn remove(&self, local_id: i32) -> Option<ChannelEntry> {
        let entry = self
            .channels
            .lock()
            .expect("multiplexer lock poisoned")
            .remove(&local_id)?;
        let _ = entry.cancel.send(true);
        Some(entry)
    }

    /// Close every channel and stop accepting new ones
    ///
    /// Returns the runs bound to channels the peer opened, for the caller to
    /// settle once their sessions have ended.
    pub fn close_all(&self) -> Vec<i64> {
        self.outbound
            .lock()
            .expect("multiplexer outbound lock poisoned")
            .take();

        let entries: Vec<ChannelEntry> = self
            .channels
            .lock()
            .expect("multiplexer lock poisoned")
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        entries
            .into_iter()
            .filter_map(|entry| {
                let _ = entry.cancel.send(true);
                entry.settled_run()
            })
            .collect()
    }

    /// Queue a connection-level packet on `(NO_CHANNEL, NO_CHANNEL)`
    ///
    /// Best effort: dropped if the outbound queue is full or closed.
    pub fn send_control(&self, packet: &LocalPacket) {
        self.send_detached(NO_CHANNEL, NO_CHANNEL, packet);
    }

    /// Queue a packet for a channel that no longer has a local session
    ///
    /// Same best-effort rules as [`send_control`](Self::send_control).
    pub fn send_detached(&self, local_id: i32, remote_id: i32, packet: &LocalPacket) {
        let payload = match packet.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer = ?self.peer, error = %e, "cannot encode control packet");
                return;
            }
        };

        let outbound = self
            .outbound
            .lock()
            .expect("multiplexer outbound lock poisoned")
            .clone();
        // Addressed with the peer's id first
        if let Some(outbound) = outbound
            && outbound
                .try_send(Packet::new(remote_id, local_id, payload))
                .is_err()
        {
            debug!(peer = ?self.peer, kind = packet.kind(), "packet not queued");
        }
    }

    #[cfg(test)]
    fn channel_count(&self) -> usize {
        self.channels.lock().expect("multiplexer lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn setup() -> (Arc<Multiplexer>, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(16);
        (Multiplexer::new(None, tx), rx)
    }

    async fn peer_opened(mux: &Arc<Multiplexer>, remote_id: i32) -> Channel {
        match mux.dispatch(Packet::new(NO_CHANNEL, remote_id, Bytes::new())).await {
            Dispatch::Opened(channel) => channel,
            other => panic!("expected a new channel, got {other:?}"),
        }
    }

    #[test]
    fn test_local_ids_unique_and_increasing() {
        let (mux, _rx) = setup();
        let a = mux.open(NO_CHANNEL).unwrap();
        let b = mux.open(NO_CHANNEL).unwrap();
        assert_eq!(a.local_id(), 1);
        assert_eq!(b.local_id(), 2);

        // A closed channel's id is not handed out again
        drop(a);
        let c = mux.open(NO_CHANNEL).unwrap();
        assert_eq!(c.local_id(), 3);
    }

    #[test]
    fn test_local_ids_exhausted() {
        let (mux, _rx) = setup();
        mux.next_local_id.store(i32::MAX, Ordering::Relaxed);
        assert!(mux.open(NO_CHANNEL).is_none());
    }

    #[tokio::test]
    async fn test_startup_packet_opens_channel() {
        let (mux, _rx) = setup();
        let packet = Packet::new(NO_CHANNEL, 42, Bytes::from_static(b"hello"));

        let Dispatch::Opened(mut channel) = mux.dispatch(packet).await else {
            panic!("expected a new channel");
        };
        assert_eq!(channel.remote_id(), 42);

        let first = channel.recv().await.unwrap();
        assert_eq!(first.payload().as_ref(), b"hello");
        assert_eq!(mux.channel_count(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_preserves_order() {
        let (mux, _rx) = setup();
        let mut channel = mux.open(7).unwrap();
        let id = channel.local_id();

        for i in 0u8..10 {
            let delivered = mux.dispatch(Packet::new(id, 7, vec![i])).await;
            assert!(matches!(delivered, Dispatch::Delivered));
        }
        for i in 0u8..10 {
            assert_eq!(channel.recv().await.unwrap().payload().as_ref(), &[i]);
        }
    }

    #[tokio::test]
    async fn test_unknown_pair_dropped() {
        let (mux, _rx) = setup();
        let channel = mux.open(7).unwrap();

        // Unknown local id
        assert!(matches!(
            mux.dispatch(Packet::new(999, 7, Bytes::new())).await,
            Dispatch::Dropped
        ));
        // Known local id, wrong remote id
        assert!(matches!(
            mux.dispatch(Packet::new(channel.local_id(), 8, Bytes::new()))
                .await,
            Dispatch::Dropped
        ));
        // Still routable afterwards
        assert!(matches!(
            mux.dispatch(Packet::new(channel.local_id(), 7, Bytes::new()))
                .await,
            Dispatch::Delivered
        ));
    }

    #[tokio::test]
    async fn test_initiator_learns_remote_id() {
        let (mux, _rx) = setup();
        let mut channel = mux.open(NO_CHANNEL).unwrap();
        let id = channel.local_id();

        mux.dispatch(Packet::new(id, 55, Bytes::new())).await;
        channel.recv().await.unwrap();
        assert_eq!(channel.remote_id(), 55);

        // The pair is now fixed
        assert!(matches!(
            mux.dispatch(Packet::new(id, 56, Bytes::new())).await,
            Dispatch::Dropped
        ));
    }

    #[tokio::test]
    async fn test_control_packets() {
        let (mux, _rx) = setup();
        let packet = Packet::new(NO_CHANNEL, NO_CHANNEL, Bytes::new());
        assert!(matches!(mux.dispatch(packet).await, Dispatch::Control(_)));
        assert_eq!(mux.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_late_packet_after_close_dropped() {
        let (mux, _rx) = setup();
        let channel = mux.open(7).unwrap();
        let id = channel.local_id();

        mux.close(id);
        mux.close(id);
        assert!(matches!(
            mux.dispatch(Packet::new(id, 7, Bytes::new())).await,
            Dispatch::Dropped
        ));
    }

    #[test]
    fn test_close_cancels_channel() {
        let (mux, _rx) = setup();
        let channel = mux.open(7).unwrap();
        let id = channel.local_id();

        assert!(mux.bind_run(id, 1001));
        assert!(!channel.is_cancelled());
        mux.close(id);
        assert!(channel.is_cancelled());
        assert!(!mux.bind_run(id, 1002));
    }

    #[tokio::test]
    async fn test_close_all_returns_peer_opened_runs() {
        let (mux, mut rx) = setup();
        let a = peer_opened(&mux, 1).await;
        let b = peer_opened(&mux, 2).await;
        let _c = peer_opened(&mux, 3).await;
        let outgoing = mux.open(NO_CHANNEL).unwrap();
        mux.bind_run(a.local_id(), 10);
        mux.bind_run(b.local_id(), 20);
        mux.bind_run(outgoing.local_id(), 30);

        // The run of a locally opened channel is its opener's to settle
        let mut runs = mux.close_all();
        runs.sort();
        assert_eq!(runs, vec![10, 20]);
        assert_eq!(mux.channel_count(), 0);
        assert!(mux.open(4).is_none());
        assert!(outgoing.is_cancelled());

        // Only the channels' own senders remain; dropping them closes the queue
        drop((a, b, _c, outgoing));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stalled_channel_is_closed_alone() {
        let (tx, _rx) = mpsc::channel(16);
        let mux = Multiplexer::with_stall_timeout(None, tx, Duration::from_millis(50));
        let stuck = peer_opened(&mux, 1).await;
        let mut healthy = peer_opened(&mux, 2).await;
        mux.bind_run(stuck.local_id(), 10);

        // The startup packet already holds one slot
        for _ in 1..CHANNEL_QUEUE_CAPACITY {
            let delivered = mux.dispatch(Packet::new(stuck.local_id(), 1, Bytes::new())).await;
            assert!(matches!(delivered, Dispatch::Delivered));
        }

        let overflow = mux.dispatch(Packet::new(stuck.local_id(), 1, Bytes::new())).await;
        let Dispatch::Stalled {
            local_id,
            remote_id,
            run_id,
        } = overflow
        else {
            panic!("expected the channel to stall, got {overflow:?}");
        };
        assert_eq!((local_id, remote_id, run_id), (stuck.local_id(), 1, Some(10)));
        assert!(stuck.is_cancelled());
        assert_eq!(mux.channel_count(), 1);

        // The other channel keeps flowing
        healthy.recv().await.unwrap();
        let delivered = mux.dispatch(Packet::new(healthy.local_id(), 2, vec![9])).await;
        assert!(matches!(delivered, Dispatch::Delivered));
        assert_eq!(healthy.recv().await.unwrap().payload().as_ref(), &[9]);
    }

    #[tokio::test]
    async fn test_send_detached_addresses_peer_first() {
        let (mux, mut rx) = setup();
        mux.send_detached(4, 77, &LocalPacket::Error { info: "stalled".into() });

        let packet = rx.recv().await.unwrap();
        assert_eq!(packet.local_id(), 77);
        assert_eq!(packet.remote_id(), 4);
    }

    #[tokio::test]
    async fn test_send_control() {
        let (mux, mut rx) = setup();
        mux.send_control(&LocalPacket::KeepAlive);

        let packet = rx.recv().await.unwrap();
        assert_eq!(packet.local_id(), NO_CHANNEL);
        assert_eq!(packet.remote_id(), NO_CHANNEL);
        assert_eq!(
            LocalPacket::decode(packet.payload()).unwrap(),
            LocalPacket::KeepAlive
        );
    }
}
