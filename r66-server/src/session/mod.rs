//! Transfer sessions
//!
//! A session drives one run over one local channel. The receiving side is
//! started by the peer's `Request` arriving on a fresh channel; the sending
//! side is started by the client connector.
//!
//! Receiver sessions never settle a run after a transport loss themselves:
//! when the connection goes away it closes every channel, waits for the
//! sessions to end, then marks the runs still bound to peer-opened channels
//! (see [`settle_lost_run`]). The client connector does the same for the
//! channel it opened.

mod receiver;
mod sender;

pub use receiver::run_receiver;
pub use sender::run_sender;

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use r66_common::NO_CHANNEL;
use r66_common::run::RunStatus;
use r66_common::session::{LocalPacket, SessionCodecError};
use tracing::{debug, error, info, warn};

use crate::constants::{INFO_CONNECTION_LOST, INFO_CONNECTION_LOST_BEFORE_START};
use crate::db::{Database, RunStore, StoreError};
use crate::mux::{Channel, ChannelError};
use crate::pipeline::{PipelineError, PipelineRunner, TaskContext, TaskSpec};
use crate::registry::ConnectionRegistry;

/// Everything a session needs besides its channel
#[derive(Clone)]
pub struct SessionContext {
    pub db: Database,
    /// Directory received files land in
    pub spool: PathBuf,
    /// Present on the server side; used for blacklist checks
    pub registry: Option<Arc<ConnectionRegistry>>,
    /// Remote address of the connection the session rides on
    pub peer: Option<SocketAddr>,
    /// Key presented when this side opens a channel
    pub host_key: Option<String>,
    /// Blacklist the peer's address when it fails authentication or breaks
    /// the framing
    pub blacklist_bad_auth: bool,
}

impl SessionContext {
    pub fn new(db: Database, spool: impl Into<PathBuf>) -> Self {
        Self {
            db,
            spool: spool.into(),
            registry: None,
            peer: None,
            host_key: None,
            blacklist_bad_auth: false,
        }
    }

    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_host_key(mut self, key: Option<String>) -> Self {
        self.host_key = key;
        self
    }

    pub fn blacklist_bad_auth(mut self, enabled: bool) -> Self {
        self.blacklist_bad_auth = enabled;
        self
    }

    /// Copy of this context for sessions on a connection with `peer`
    pub(crate) fn for_peer(&self, peer: Option<SocketAddr>) -> Self {
        Self {
            peer,
            ..self.clone()
        }
    }

    /// Blacklist the peer's address and close its connections, if enabled
    pub(crate) async fn punish_peer(&self, reason: &str) {
        if !self.blacklist_bad_auth {
            return;
        }
        if let Some(registry) = &self.registry
            && let Some(addr) = self.peer
            && let Err(e) = registry.blacklist_and_close(addr.ip(), reason).await
        {
            error!(peer = %addr, error = %e, "failed to blacklist address");
        }
    }
}

/// Errors that end a session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Protocol or data problem; the run fails with this message
    #[error("{0}")]
    Abort(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("malformed packet: {0}")]
    Codec(#[from] SessionCodecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Whether the connection is gone, leaving the run to the connection teardown
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Channel(ChannelError::Closed))
    }
}

/// Mark a run whose connection went away
///
/// `Running` becomes `Interrupted` (resumable); `Init` becomes `Error` since
/// no block was moved. Runs already settled are left alone. Returns the new
/// status when one was written.
pub async fn settle_lost_run(runs: &RunStore, run_id: i64) -> Result<Option<RunStatus>, StoreError> {
    let run = runs.get(run_id).await?;
    let (status, info) = match run.status {
        RunStatus::Running => (RunStatus::Interrupted, INFO_CONNECTION_LOST),
        RunStatus::Init => (RunStatus::Error, INFO_CONNECTION_LOST_BEFORE_START),
        _ => return Ok(None),
    };

    match runs.update_status(run_id, status, Some(info)).await {
        Ok(()) => {
            info!(run_id, rank = run.rank, %status, "run settled after connection loss");
            Ok(Some(status))
        }
        Err(StoreError::StateConflict { from, .. }) => {
            debug!(run_id, %from, "run settled concurrently");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Attach a run to its channel, settling the run if the channel is already gone
async fn bind_or_settle(channel: &Channel, runs: &RunStore, run_id: i64) -> Result<bool, StoreError> {
    if channel.bind_run(run_id) {
        return Ok(true);
    }
    settle_lost_run(runs, run_id).await?;
    Ok(false)
}

/// Fail a run: error tasks, `Error` status, then tell the peer
async fn abort_run(
    pipeline: &PipelineRunner,
    runs: &RunStore,
    channel: &Channel,
    error_tasks: &[TaskSpec],
    task_ctx: &mut TaskContext,
    info: &str,
) {
    let run_id = task_ctx.run_id;
    warn!(run_id, local_id = channel.local_id(), info, "aborting run");

    if let Err(e) = pipeline.fail_with(error_tasks, task_ctx, info).await {
        warn!(run_id, error = %e, "error tasks not completed");
        if let Err(e) = runs.update_status(run_id, RunStatus::Error, Some(info)).await {
            debug!(run_id, error = %e, "run not moved to error");
        }
    }

    // Nothing to tell a peer that has not answered yet
    if channel.remote_id() == NO_CHANNEL {
        return;
    }
    let reply = LocalPacket::Error {
        info: info.to_string(),
    };
    if let Err(e) = channel.send(&reply).await {
        debug!(run_id, error = %e, "error not sent to peer");
    }
}

/// Last path component, if it is a usable file name
pub fn base_name(filename: &str) -> Option<String> {
    Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::create_test_database;
    use crate::db::{IdStrategy, NewRun};
    use r66_common::run::TransferRequest;

    async fn run_in(db: &Database, status: RunStatus) -> i64 {
        let id = db
            .runs
            .create(&NewRun {
                request: TransferRequest::new("default", "a", "b", "f.txt"),
                block_size: 16,
                is_sender: false,
                peer_run_id: None,
            })
            .await
            .unwrap();
        match status {
            RunStatus::Init => {}
            RunStatus::Running => {
                db.runs.update_status(id, RunStatus::Running, None).await.unwrap();
            }
            RunStatus::Finished => {
                db.runs.update_status(id, RunStatus::Running, None).await.unwrap();
                db.runs.update_status(id, RunStatus::Finished, None).await.unwrap();
            }
            _ => unreachable!(),
        }
        id
    }

    #[tokio::test]
    async fn test_settle_running_is_interrupted() {
        let db = create_test_database(IdStrategy::Sequence).await;
        let id = run_in(&db, RunStatus::Running).await;
        db.runs.update_rank(id, 4).await.unwrap();

        let settled = settle_lost_run(&db.runs, id).await.unwrap();
        assert_eq!(settled, Some(RunStatus::Interrupted));

        let run = db.runs.get(id).await.unwrap();
        assert_eq!(run.status, RunStatus::Interrupted);
        assert_eq!(run.rank, 4);
    }

    #[tokio::test]
    async fn test_settle_init_is_error() {
        let db = create_test_database(IdStrategy::Sequence).await;
        let id = run_in(&db, RunStatus::Init).await;

        assert_eq!(
            settle_lost_run(&db.runs, id).await.unwrap(),
            Some(RunStatus::Error)
        );
        let run = db.runs.get(id).await.unwrap();
        assert_eq!(
            run.error_info.as_deref(),
            Some(INFO_CONNECTION_LOST_BEFORE_START)
        );
    }

    #[tokio::test]
    async fn test_settle_leaves_terminal_alone() {
        let db = create_test_database(IdStrategy::Sequence).await;
        let id = run_in(&db, RunStatus::Finished).await;

        assert_eq!(settle_lost_run(&db.runs, id).await.unwrap(), None);
        assert_eq!(db.runs.get(id).await.unwrap().status, RunStatus::Finished);
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("report.csv").as_deref(), Some("report.csv"));
        assert_eq!(base_name("/data/out/report.csv").as_deref(), Some("report.csv"));
        assert_eq!(base_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(base_name(".."), None);
        assert_eq!(base_name(""), None);
        assert_eq!(base_name("/"), None);
    }

    #[test]
    fn test_transport_errors() {
        assert!(SessionError::Channel(ChannelError::Closed).is_transport());
        assert!(!SessionError::Abort("x".into()).is_transport());
    }
}
