//! Receiving side of a transfer

use std::io::{self, SeekFrom};
use std::path::PathBuf;

use bytes::Bytes;
use r66_common::MAX_BLOCK_SIZE;
use r66_common::run::{RunStatus, TaskStep, TransferRequest};
use r66_common::session::LocalPacket;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{SessionContext, SessionError, abort_run, base_name, bind_or_settle, settle_lost_run};
use crate::constants::*;
use crate::db::host_key::verify_key;
use crate::db::rules::Rule;
use crate::db::{NewRun, RunStore, StoreError};
use crate::mux::Channel;
use crate::pipeline::{PhaseOutcome, PipelineRunner, TaskContext};

/// Serve one inbound channel until its run ends or the connection goes away
///
/// The peer must authenticate with `Authent` before its `Request`. Problems
/// found before a run exists are answered with an `Error` packet and no run
/// is created.
pub async fn run_receiver(ctx: SessionContext, mut channel: Channel) {
    let local_id = channel.local_id();

    let accepted = match accept(&ctx, &mut channel).await {
        Ok(Some(accepted)) => accepted,
        Ok(None) => return,
        Err(e) => {
            if !e.is_transport() {
                warn!(local_id, error = %e, "request not accepted");
            }
            return;
        }
    };

    let mut session = ReceiverSession::new(&ctx, channel, accepted);
    if let Err(e) = session.run().await {
        if e.is_transport() || session.channel.is_cancelled() {
            debug!(run_id = session.run_id, error = %e, "receiver stopped with its connection");
            return;
        }
        let info = e.to_string();
        abort_run(
            &session.pipeline,
            &session.runs,
            &session.channel,
            &session.rule.error_tasks,
            &mut session.task_ctx,
            &info,
        )
        .await;
    }
}

/// A request that passed validation and has a run bound to the channel
struct Accepted {
    run_id: i64,
    rule: Rule,
    filename: String,
    block_size: u32,
    rank: i32,
    resumed: bool,
    /// Every block was received and the file renamed before the run stopped
    data_complete: bool,
}

/// Check the peer's `Authent` against the known hosts
///
/// Returns the authenticated host id, or `None` once the channel has been
/// refused. A failed check blacklists the peer when that is enabled.
async fn authenticate(ctx: &SessionContext, channel: &mut Channel) -> Result<Option<String>, SessionError> {
    let (host_id, key) = match channel.recv_local().await {
        None => return Ok(None),
        Some(Ok(LocalPacket::Authent { host_id, key })) => (host_id, key),
        Some(Ok(other)) => {
            return reject(channel, format!("expected Authent, got {}", other.kind())).await;
        }
        Some(Err(e)) => return reject(channel, format!("malformed authentication: {e}")).await,
    };

    if let Some(registry) = &ctx.registry
        && registry.is_host_blacklisted(&host_id)
    {
        info!(host_id = %host_id, "blacklisted host refused");
        return reject(channel, INFO_HOST_BLACKLISTED.to_string()).await;
    }

    let verified = match ctx.db.hosts.key_hash(&host_id).await? {
        Some(key_hash) => tokio::task::spawn_blocking(move || verify_key(&key, &key_hash))
            .await
            .map_err(io::Error::other)?
            .unwrap_or_else(|e| {
                warn!(host_id = %host_id, error = %e, "stored host key unusable");
                false
            }),
        None => false,
    };
    if !verified {
        warn!(host_id = %host_id, peer = ?ctx.peer, "host authentication failed");
        let refused = reject(channel, INFO_BAD_AUTHENTICATION.to_string()).await;
        ctx.punish_peer(&format!("authentication failed for host {host_id}"))
            .await;
        return refused;
    }

    debug!(local_id = channel.local_id(), host_id = %host_id, "host authenticated");
    channel.send(&LocalPacket::AuthentValid).await?;
    Ok(Some(host_id))
}

async fn accept(ctx: &SessionContext, channel: &mut Channel) -> Result<Option<Accepted>, SessionError> {
    let Some(host_id) = authenticate(ctx, channel).await? else {
        return Ok(None);
    };

    let (request, block_size, resume_id) = match channel.recv_local().await {
        None => return Ok(None),
        Some(Ok(LocalPacket::Request {
            request,
            block_size,
            resume_id,
        })) => (request, block_size, resume_id),
        Some(Ok(other)) => {
            return reject(channel, format!("expected Request, got {}", other.kind())).await;
        }
        Some(Err(e)) => return reject(channel, format!("malformed request: {e}")).await,
    };

    debug!(
        local_id = channel.local_id(),
        remote_id = channel.remote_id(),
        rule = %request.rule,
        requester = %request.requester,
        file = %request.filename,
        resume_id,
        "transfer requested"
    );

    if request.requester != host_id {
        return reject(channel, format!("{INFO_REQUESTER_MISMATCH}{}", request.requester)).await;
    }

    if block_size == 0 || block_size > MAX_BLOCK_SIZE {
        return reject(channel, format!("{INFO_INVALID_BLOCK_SIZE}{block_size}")).await;
    }

    let Some(filename) = base_name(&request.filename) else {
        return reject(channel, format!("{INFO_INVALID_FILENAME}{}", request.filename)).await;
    };

    let Some(rule) = ctx.db.rules.get(&request.rule).await? else {
        return reject(channel, format!("{INFO_UNKNOWN_RULE}{}", request.rule)).await;
    };

    let runs = &ctx.db.runs;
    match resume_id {
        Some(run_id) => {
            let run = match runs.get(run_id).await {
                Ok(run) => run,
                Err(StoreError::NotFound(_)) => {
                    return reject(channel, format!("{INFO_NOT_RESUMABLE}run {run_id} not found")).await;
                }
                Err(e) => return Err(e.into()),
            };

            if run.is_sender
                || !run.status.is_resumable()
                || run.filename != filename
                || run.rule_name != request.rule
                || run.block_size != block_size
            {
                return reject(channel, format!("{INFO_NOT_RESUMABLE}run {run_id} ({})", run.status)).await;
            }

            match runs.update_status(run_id, RunStatus::Running, None).await {
                Ok(()) => {}
                Err(StoreError::StateConflict { from, .. }) => {
                    return reject(channel, format!("{INFO_NOT_RESUMABLE}run {run_id} ({from})")).await;
                }
                Err(e) => return Err(e.into()),
            }
            if !bind_or_settle(channel, runs, run_id).await? {
                return Ok(None);
            }

            let data_complete = run.global_step == TaskStep::PostTask;
            info!(run_id, rank = run.rank, file = %filename, data_complete, "resuming transfer");
            Ok(Some(Accepted {
                run_id,
                rule,
                filename,
                block_size,
                rank: run.rank.max(0),
                resumed: true,
                data_complete,
            }))
        }
        None => {
            let run_id = runs
                .create(&NewRun {
                    request: TransferRequest {
                        filename: filename.clone(),
                        ..request
                    },
                    block_size,
                    is_sender: false,
                    peer_run_id: None,
                })
                .await?;
            if !bind_or_settle(channel, runs, run_id).await? {
                return Ok(None);
            }

            info!(run_id, rule = %rule.name, file = %filename, block_size, "transfer accepted");
            Ok(Some(Accepted {
                run_id,
                rule,
                filename,
                block_size,
                rank: 0,
                resumed: false,
                data_complete: false,
            }))
        }
    }
}

/// Refuse a request that has no run yet
async fn reject<T>(channel: &Channel, info: String) -> Result<Option<T>, SessionError> {
    info!(local_id = channel.local_id(), info = %info, "request refused");
    channel.send(&LocalPacket::Error { info }).await?;
    Ok(None)
}

struct ReceiverSession {
    channel: Channel,
    runs: RunStore,
    pipeline: PipelineRunner,
    rule: Rule,
    run_id: i64,
    block_size: u32,
    /// Next block expected; equals the number of blocks written
    rank: i32,
    /// Whether the run is already `Running`
    started: bool,
    resumed: bool,
    data_complete: bool,
    target: PathBuf,
    partial: PathBuf,
    task_ctx: TaskContext,
    cancel: watch::Receiver<bool>,
}

impl ReceiverSession {
    fn new(ctx: &SessionContext, channel: Channel, accepted: Accepted) -> Self {
        let target = ctx.spool.join(&accepted.filename);
        let partial = ctx
            .spool
            .join(format!("{}.{}.part", accepted.filename, accepted.run_id));
        let cancel = channel.cancel_signal();

        Self {
            channel,
            runs: ctx.db.runs.clone(),
            pipeline: PipelineRunner::new(ctx.db.runs.clone()),
            task_ctx: TaskContext::new(accepted.run_id, accepted.rule.name.clone(), target.clone()),
            rule: accepted.rule,
            run_id: accepted.run_id,
            block_size: accepted.block_size,
            rank: accepted.rank,
            started: accepted.resumed,
            resumed: accepted.resumed,
            data_complete: accepted.data_complete,
            target,
            partial,
            cancel,
        }
    }

    async fn run(&mut self) -> Result<(), SessionError> {
        if !self.resumed {
            let outcome = self
                .pipeline
                .execute(
                    TaskStep::PreTask,
                    &self.rule.pre_tasks,
                    &self.rule.error_tasks,
                    &mut self.task_ctx,
                    &self.cancel,
                )
                .await?;
            if !self.continue_after(outcome).await {
                return Ok(());
            }
        }

        let mut file = if self.data_complete {
            if !fs::try_exists(&self.target).await? {
                return Err(SessionError::Abort(format!(
                    "{INFO_NOT_RESUMABLE}{} is missing",
                    self.target.display()
                )));
            }
            None
        } else {
            Some(self.open_partial().await?)
        };
        self.channel
            .send(&LocalPacket::Valid {
                run_id: self.run_id,
                rank: self.rank,
            })
            .await?;

        loop {
            let packet = match self.channel.recv_local().await {
                // The connection settles the run
                None => return Ok(()),
                Some(packet) => packet?,
            };

            match packet {
                LocalPacket::Data { rank, block } => match file.as_mut() {
                    Some(file) => self.write_block(file, rank, &block).await?,
                    None => {
                        return Err(SessionError::Abort(format!(
                            "{INFO_BLOCK_OUT_OF_ORDER}block {rank} after the last one"
                        )));
                    }
                },
                LocalPacket::EndTransfer { block_count } => return self.finish(file, block_count).await,
                LocalPacket::Error { info } => {
                    info!(run_id = self.run_id, info = %info, "sender aborted transfer");
                    self.pipeline
                        .fail_with(&self.rule.error_tasks, &mut self.task_ctx, &info)
                        .await?;
                    return Ok(());
                }
                other => {
                    return Err(SessionError::Abort(format!("unexpected {} packet", other.kind())));
                }
            }
        }
    }

    /// Open the partial file positioned at the resume point
    async fn open_partial(&self) -> Result<File, SessionError> {
        let offset = self.rank as u64 * self.block_size as u64;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.partial)
            .await?;

        if self.resumed && file.metadata().await?.len() < offset {
            return Err(SessionError::Abort(format!(
                "{INFO_NOT_RESUMABLE}partial file shorter than {offset} bytes"
            )));
        }
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(file)
    }

    async fn write_block(&mut self, file: &mut File, rank: i32, block: &Bytes) -> Result<(), SessionError> {
        if rank < self.rank {
            debug!(run_id = self.run_id, rank, "duplicate block ignored");
            return Ok(());
        }
        if rank > self.rank {
            return Err(SessionError::Abort(format!(
                "{INFO_BLOCK_OUT_OF_ORDER}expected {}, got {rank}",
                self.rank
            )));
        }
        if block.len() > self.block_size as usize {
            return Err(SessionError::Abort(format!(
                "block {rank} is {} bytes, larger than block size {}",
                block.len(),
                self.block_size
            )));
        }

        self.start().await?;
        file.write_all(block).await?;
        file.flush().await?;

        self.rank += 1;
        self.runs.update_rank(self.run_id, self.rank).await?;
        Ok(())
    }

    /// Move the run to `Running` on the first block
    async fn start(&mut self) -> Result<(), SessionError> {
        if !self.started {
            self.runs
                .update_status(self.run_id, RunStatus::Running, None)
                .await?;
            self.runs
                .update_step(self.run_id, TaskStep::TransferTask, 0)
                .await?;
            self.started = true;
        }
        Ok(())
    }

    /// Close out the data and run the post phase
    ///
    /// `file` is `None` when a resumed run already had all its data.
    async fn finish(&mut self, file: Option<File>, block_count: i32) -> Result<(), SessionError> {
        if block_count != self.rank {
            return Err(SessionError::Abort(format!(
                "{INFO_BLOCK_COUNT_MISMATCH}received {}, sender reports {block_count}",
                self.rank
            )));
        }

        if let Some(mut file) = file {
            file.flush().await?;
            file.sync_all().await?;
            drop(file);

            // An empty file has no first block
            self.start().await?;
            fs::rename(&self.partial, &self.target).await?;
            self.task_ctx.path = self.target.clone();
            self.runs
                .update_step(self.run_id, TaskStep::PostTask, 0)
                .await?;
        }

        let outcome = self
            .pipeline
            .execute(
                TaskStep::PostTask,
                &self.rule.post_tasks,
                &self.rule.error_tasks,
                &mut self.task_ctx,
                &self.cancel,
            )
            .await?;
        if !self.continue_after(outcome).await {
            return Ok(());
        }

        self.pipeline.complete(self.run_id).await?;
        info!(
            run_id = self.run_id,
            file = %self.task_ctx.path.display(),
            blocks = self.rank,
            "transfer finished"
        );
        self.channel
            .send(&LocalPacket::EndRequest {
                run_id: self.run_id,
            })
            .await?;
        Ok(())
    }

    /// Handle a phase outcome; false when the session must stop
    async fn continue_after(&mut self, outcome: PhaseOutcome) -> bool {
        match outcome {
            PhaseOutcome::Completed | PhaseOutcome::Stopped { .. } => true,
            PhaseOutcome::Failed { info, .. } => {
                // Error tasks already ran and the run is in `Error`
                if let Err(e) = self.channel.send(&LocalPacket::Error { info }).await {
                    debug!(run_id = self.run_id, error = %e, "error not sent to peer");
                }
                false
            }
            PhaseOutcome::Cancelled => {
                if let Err(e) = settle_lost_run(&self.runs, self.run_id).await {
                    debug!(run_id = self.run_id, error = %e, "cancelled run not settled");
                }
                false
            }
        }
    }
}
