//! Physical connection handling
//!
//! One task reads frames and dispatches them through the multiplexer; a
//! separate writer task drains the shared outbound queue, so a slow peer
//! never stalls inbound dispatch. The same connection type serves accepted
//! sockets and outbound client connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use r66_common::NO_CHANNEL;
use r66_common::framing::{
    DEFAULT_FRAME_TIMEOUT, DEFAULT_IDLE_TIMEOUT, FrameError, FrameReader, FrameWriter, Packet,
};
use r66_common::session::LocalPacket;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use r66_common::run::RunStatus;
use tracing::{debug, error, info, warn};

use crate::constants::{INFO_CHANNEL_STALLED, KEEP_ALIVE_INTERVAL, OUTBOUND_QUEUE_CAPACITY};
use crate::db::StoreError;
use crate::mux::{Dispatch, Multiplexer};
use crate::session::{SessionContext, run_receiver, settle_lost_run};

/// How long teardown waits for queued packets to be written
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long teardown waits for receiver sessions to notice the close
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the read loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    /// The local side asked to close
    Local,
    /// The peer announced a shutdown
    PeerShutdown,
    /// The stream ended or failed
    Transport,
}

/// A physical connection and the sessions riding on it
pub struct Connection<S> {
    reader: FrameReader<BufReader<ReadHalf<S>>>,
    writer: JoinHandle<()>,
    stop_writer: oneshot::Sender<()>,
    mux: Arc<Multiplexer>,
    peer_addr: Option<SocketAddr>,
    ctx: SessionContext,
    sessions: JoinSet<()>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Split `stream` and start its writer task
    pub fn new(stream: S, peer_addr: Option<SocketAddr>, ctx: SessionContext) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel();

        let writer = tokio::spawn(write_loop(
            FrameWriter::new(write_half),
            outbound_rx,
            stop_rx,
            peer_addr,
        ));

        Self {
            reader: FrameReader::new(BufReader::new(read_half)),
            writer,
            stop_writer: stop_tx,
            mux: Multiplexer::new(peer_addr, outbound_tx),
            peer_addr,
            ctx: ctx.for_peer(peer_addr),
            sessions: JoinSet::new(),
        }
    }

    /// Multiplexer for opening outbound channels
    pub fn multiplexer(&self) -> Arc<Multiplexer> {
        self.mux.clone()
    }

    /// Serve the connection until it ends
    ///
    /// `close` ends the connection from this side: a `Shutdown` is sent to
    /// the peer before the socket closes. A dropped sender counts as a close.
    /// On return every channel is closed, its session has ended, and every
    /// run bound to a peer-opened channel has been settled (interrupted, or
    /// failed if it never started).
    pub async fn run(mut self, mut close: Option<oneshot::Receiver<()>>) {
        let peer = self.peer_addr;
        debug!(peer = ?peer, "connection started");

        let ending = loop {
            let result = tokio::select! {
                _ = closed(&mut close) => break Ending::Local,
                result = self.reader.read_packet_with_timeout(DEFAULT_IDLE_TIMEOUT, DEFAULT_FRAME_TIMEOUT) => result,
            };

            match result {
                Ok(Some(packet)) => {
                    if let Some(ending) = self.handle_packet(packet).await {
                        break ending;
                    }
                }
                Ok(None) => {
                    debug!(peer = ?peer, "peer disconnected");
                    break Ending::Transport;
                }
                Err(e) => {
                    self.handle_read_error(e).await;
                    break Ending::Transport;
                }
            }

            // Reap finished sessions
            while self.sessions.try_join_next().is_some() {}
        };

        if ending == Ending::Local {
            self.mux.send_control(&LocalPacket::Shutdown);
        }
        self.teardown(ending).await;
    }

    async fn handle_packet(&mut self, packet: Packet) -> Option<Ending> {
        match self.mux.dispatch(packet).await {
            Dispatch::Delivered | Dispatch::Dropped => None,
            Dispatch::Stalled {
                local_id,
                remote_id,
                run_id,
            } => {
                let reply = LocalPacket::Error {
                    info: INFO_CHANNEL_STALLED.to_string(),
                };
                self.mux.send_detached(local_id, remote_id, &reply);
                if let Some(run_id) = run_id {
                    self.fail_stalled_run(run_id).await;
                }
                None
            }
            Dispatch::Opened(channel) => {
                debug!(
                    peer = ?self.peer_addr,
                    local_id = channel.local_id(),
                    remote_id = channel.remote_id(),
                    "channel opened"
                );
                self.sessions.spawn(run_receiver(self.ctx.clone(), channel));
                None
            }
            Dispatch::Control(packet) => match LocalPacket::decode(packet.payload()) {
                // Receiving anything already reset the idle timer
                Ok(LocalPacket::KeepAlive) => None,
                Ok(LocalPacket::Shutdown) => {
                    info!(peer = ?self.peer_addr, "peer is shutting down");
                    Some(Ending::PeerShutdown)
                }
                Ok(other) => {
                    debug!(peer = ?self.peer_addr, kind = other.kind(), "control packet ignored");
                    None
                }
                Err(e) => {
                    debug!(peer = ?self.peer_addr, error = %e, "malformed control packet dropped");
                    None
                }
            },
        }
    }

    /// Fail the run of a channel whose session stopped reading
    ///
    /// The peer was told with an `Error`, so the run is not resumable.
    async fn fail_stalled_run(&self, run_id: i64) {
        match self
            .ctx
            .db
            .runs
            .update_status(run_id, RunStatus::Error, Some(INFO_CHANNEL_STALLED))
            .await
        {
            Ok(()) => warn!(peer = ?self.peer_addr, run_id, "run failed, channel stalled"),
            Err(StoreError::StateConflict { from, .. }) => {
                debug!(run_id, %from, "stalled run already settled");
            }
            Err(e) => error!(run_id, error = %e, "failed to fail stalled run"),
        }
    }

    async fn handle_read_error(&self, e: FrameError) {
        let peer = self.peer_addr;
        if !e.is_violation() {
            // Timeouts and resets are routine
            info!(peer = ?peer, error = %e, "connection lost");
            return;
        }

        warn!(peer = ?peer, error = %e, "framing violation, closing connection");
        self.ctx.punish_peer(&e.to_string()).await;
    }

    async fn teardown(mut self, ending: Ending) {
        let peer = self.peer_addr;
        let lost_runs = self.mux.close_all();

        // Sessions end before their runs are judged lost: one that already
        // holds its last packets may still finish the run
        let drained = timeout(SESSION_DRAIN_TIMEOUT, async {
            while self.sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            debug!(peer = ?peer, "sessions did not stop in time");
            self.sessions.shutdown().await;
        }

        let _ = self.stop_writer.send(());
        if timeout(WRITER_DRAIN_TIMEOUT, &mut self.writer).await.is_err() {
            debug!(peer = ?peer, "writer did not drain in time");
            self.writer.abort();
        }

        for run_id in lost_runs {
            if let Err(e) = settle_lost_run(&self.ctx.db.runs, run_id).await {
                error!(peer = ?peer, run_id, error = %e, "failed to settle run");
            }
        }

        debug!(peer = ?peer, ?ending, "connection closed");
    }
}

/// Resolves when the close signal fires or its sender is dropped
async fn closed(signal: &mut Option<oneshot::Receiver<()>>) {
    match signal {
        Some(rx) => {
            let _ = rx.await;
        }
        None => std::future::pending().await,
    }
}

/// Drain the outbound queue onto the socket
///
/// Sends a keep-alive packet whenever nothing was written for
/// `KEEP_ALIVE_INTERVAL`. On stop, packets already queued are still written.
async fn write_loop<W>(
    mut writer: FrameWriter<WriteHalf<W>>,
    mut outbound: mpsc::Receiver<Packet>,
    mut stop: oneshot::Receiver<()>,
    peer: Option<SocketAddr>,
) where
    W: AsyncRead + AsyncWrite + Unpin,
{
    let ping = Packet::new(
        NO_CHANNEL,
        NO_CHANNEL,
        LocalPacket::KeepAlive.encode().unwrap_or_default(),
    );
    let mut keep_alive = interval_at(Instant::now() + KEEP_ALIVE_INTERVAL, KEEP_ALIVE_INTERVAL);
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let packet = tokio::select! {
            biased;
            _ = &mut stop => break,
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
            _ = keep_alive.tick() => ping.clone(),
        };

        if let Err(e) = writer.write_packet(&packet).await {
            debug!(peer = ?peer, error = %e, "write failed");
            return;
        }
        keep_alive.reset();
    }

    while let Ok(packet) = outbound.try_recv() {
        if writer.write_packet(&packet).await.is_err() {
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::create_test_database;
    use crate::db::{IdStrategy, NewRun};
    use r66_common::run::{RunStatus, TransferRequest};
    use tempfile::TempDir;
    use tokio::io::{DuplexStream, duplex};

    async fn context(dir: &TempDir) -> SessionContext {
        let db = create_test_database(IdStrategy::Sequence).await;
        SessionContext::new(db, dir.path())
    }

    /// Open a channel the way a peer's startup packet does
    async fn opened_by_peer(mux: &Arc<Multiplexer>, remote_id: i32) -> crate::mux::Channel {
        let startup = Packet::new(NO_CHANNEL, remote_id, LocalPacket::KeepAlive.encode().unwrap());
        match mux.dispatch(startup).await {
            Dispatch::Opened(channel) => channel,
            other => panic!("expected a new channel, got {other:?}"),
        }
    }

    fn peer(stream: DuplexStream) -> (FrameReader<ReadHalf<DuplexStream>>, FrameWriter<WriteHalf<DuplexStream>>) {
        let (r, w) = tokio::io::split(stream);
        (FrameReader::new(r), FrameWriter::new(w))
    }

    #[tokio::test]
    async fn test_local_close_sends_shutdown() {
        let dir = TempDir::new().unwrap();
        let (ours, theirs) = duplex(4096);
        let connection = Connection::new(ours, None, context(&dir).await);
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(connection.run(Some(close_rx)));

        close_tx.send(()).unwrap();
        task.await.unwrap();

        let (mut reader, _writer) = peer(theirs);
        let packet = reader.read_packet().await.unwrap().unwrap();
        assert_eq!(packet.local_id(), NO_CHANNEL);
        assert_eq!(
            LocalPacket::decode(packet.payload()).unwrap(),
            LocalPacket::Shutdown
        );
        assert!(reader.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_peer_shutdown_ends_connection() {
        let dir = TempDir::new().unwrap();
        let (ours, theirs) = duplex(4096);
        let connection = Connection::new(ours, None, context(&dir).await);
        let task = tokio::spawn(connection.run(None));

        let (_reader, mut writer) = peer(theirs);
        let shutdown = Packet::new(NO_CHANNEL, NO_CHANNEL, LocalPacket::Shutdown.encode().unwrap());
        writer.write_packet(&shutdown).await.unwrap();

        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_framing_violation_ends_connection() {
        let dir = TempDir::new().unwrap();
        let (ours, mut theirs) = duplex(4096);
        let connection = Connection::new(ours, None, context(&dir).await);
        let task = tokio::spawn(connection.run(None));

        // Length 3 is shorter than the two channel ids
        tokio::io::AsyncWriteExt::write_all(&mut theirs, &[0, 0, 0, 3, 1, 2, 3])
            .await
            .unwrap();

        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_transport_loss_settles_bound_runs() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let runs = ctx.db.runs.clone();

        let new_run = |name: &str| NewRun {
            request: TransferRequest::new("default", "a", "b", name),
            block_size: 8,
            is_sender: true,
            peer_run_id: None,
        };
        let running = runs.create(&new_run("a.txt")).await.unwrap();
        runs.update_status(running, RunStatus::Running, None).await.unwrap();
        runs.update_rank(running, 3).await.unwrap();
        let unstarted = runs.create(&new_run("b.txt")).await.unwrap();
        let outgoing = runs.create(&new_run("c.txt")).await.unwrap();
        runs.update_status(outgoing, RunStatus::Running, None).await.unwrap();

        let (ours, theirs) = duplex(4096);
        let connection = Connection::new(ours, None, ctx);
        let mux = connection.multiplexer();
        let first = opened_by_peer(&mux, 11).await;
        let second = opened_by_peer(&mux, 12).await;
        let local = mux.open(NO_CHANNEL).unwrap();
        assert!(first.bind_run(running));
        assert!(second.bind_run(unstarted));
        assert!(local.bind_run(outgoing));

        let task = tokio::spawn(connection.run(None));
        drop(theirs);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        let run = runs.get(running).await.unwrap();
        assert_eq!(run.status, RunStatus::Interrupted);
        assert_eq!(run.rank, 3);
        assert_eq!(runs.get(unstarted).await.unwrap().status, RunStatus::Error);
        assert!(first.is_cancelled());

        // The channel this side opened is cancelled; its run is left to the opener
        assert!(local.is_cancelled());
        assert_eq!(runs.get(outgoing).await.unwrap().status, RunStatus::Running);
    }
}
