//! Outbound connector
//!
//! Opens a TCP connection to the requested host, runs the same connection
//! machinery the server uses and drives one sender session on it.

use std::io;
use std::net::{IpAddr, SocketAddr};

use r66_common::run::{RunStatus, TransferRequest};
use r66_common::{DEFAULT_PORT, MAX_BLOCK_SIZE, NO_CHANNEL};
use tokio::net::{TcpStream, lookup_host};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::db::{NewRun, StoreError, TransferRun};
use crate::session::{SessionContext, run_sender, settle_lost_run};

/// Errors raised before or around an outbound transfer
///
/// A transfer that starts and then fails is not an error here: the returned
/// run carries the outcome.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot resolve peer '{0}'")]
    Resolve(String),

    #[error("cannot connect to {addr}: {source}")]
    Connect { addr: SocketAddr, source: io::Error },

    #[error("block size {0} out of range")]
    InvalidBlockSize(u32),

    #[error("run {0} cannot be resumed ({1})")]
    NotResumable(i64, RunStatus),

    #[error("connection closed before the transfer started")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Send a file as a new run
///
/// `request.filename` is the local path of the file; the peer only sees its
/// last component. `request.requested` is the peer's address.
pub async fn send(
    ctx: &SessionContext,
    request: TransferRequest,
    block_size: u32,
) -> Result<TransferRun, ClientError> {
    if block_size == 0 || block_size > MAX_BLOCK_SIZE {
        return Err(ClientError::InvalidBlockSize(block_size));
    }

    let run_id = ctx
        .db
        .runs
        .create(&NewRun {
            request,
            block_size,
            is_sender: true,
            peer_run_id: None,
        })
        .await?;
    execute(ctx, run_id).await
}

/// Resume an interrupted outbound run from the peer's last confirmed block
pub async fn resume(ctx: &SessionContext, run_id: i64) -> Result<TransferRun, ClientError> {
    let run = ctx.db.runs.get(run_id).await?;
    if !run.is_sender || !run.status.is_resumable() || run.peer_run_id.is_none() {
        return Err(ClientError::NotResumable(run_id, run.status));
    }
    execute(ctx, run_id).await
}

/// Carry out a stored outbound run: fresh when `Init`, resumed when `Interrupted`
///
/// A fresh run that cannot reach its peer ends in `Error`; an interrupted
/// one stays `Interrupted` so it can be tried again.
pub async fn execute(ctx: &SessionContext, run_id: i64) -> Result<TransferRun, ClientError> {
    let runs = &ctx.db.runs;
    let run = runs.get(run_id).await?;
    let fresh = match run.status {
        RunStatus::Init => true,
        RunStatus::Interrupted if run.is_sender && run.peer_run_id.is_some() => false,
        status => return Err(ClientError::NotResumable(run_id, status)),
    };

    let stream = match connect(&run.requested).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(run_id, peer = %run.requested, error = %e, "cannot reach peer");
            if fresh
                && let Err(store_err) = runs
                    .update_status(run_id, RunStatus::Error, Some(&e.to_string()))
                    .await
            {
                debug!(run_id, error = %store_err, "run not moved to error");
            }
            return Err(e);
        }
    };

    let peer = stream.peer_addr().ok();
    let connection = Connection::new(stream, peer, ctx.clone());
    let Some(channel) = connection.multiplexer().open(NO_CHANNEL) else {
        return Err(ClientError::Closed);
    };

    if !fresh {
        runs.update_status(run_id, RunStatus::Running, None).await?;
    }
    // The connection is not running yet, so the channel is still open
    channel.bind_run(run_id);

    let (close_tx, close_rx) = oneshot::channel();
    let connection_task = tokio::spawn(connection.run(Some(close_rx)));

    info!(run_id, peer = ?peer, file = %run.filename, resume = !fresh, "starting transfer");
    let run = runs.get(run_id).await?;
    run_sender(ctx, channel, run).await;

    let _ = close_tx.send(());
    if let Err(e) = connection_task.await {
        warn!(run_id, error = %e, "connection task failed");
    }
    // Covers a session that stopped without the connection seeing its run
    settle_lost_run(runs, run_id).await?;

    Ok(runs.get(run_id).await?)
}

async fn connect(requested: &str) -> Result<TcpStream, ClientError> {
    let addr = resolve_peer(requested).await?;
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ClientError::Connect { addr, source })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%addr, error = %e, "cannot set TCP_NODELAY");
    }
    Ok(stream)
}

/// Turn a host id into a socket address
///
/// Accepts `ip:port`, a bare IP (default port) or a host name with or
/// without a port.
pub async fn resolve_peer(requested: &str) -> Result<SocketAddr, ClientError> {
    if requested.trim().is_empty() {
        return Err(ClientError::Resolve(requested.to_string()));
    }
    if let Ok(addr) = requested.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = requested.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    let target = if requested.contains(':') {
        requested.to_string()
    } else {
        format!("{requested}:{DEFAULT_PORT}")
    };
    lookup_host(target)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ClientError::Resolve(requested.to_string()))
}
