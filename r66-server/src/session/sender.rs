//! Sending side of a transfer

use std::io::SeekFrom;

use bytes::{Bytes, BytesMut};
use r66_common::NO_CHANNEL;
use r66_common::run::{RunStatus, TaskStep};
use r66_common::session::LocalPacket;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use super::{SessionContext, SessionError, abort_run, base_name, settle_lost_run};
use crate::constants::*;
use crate::db::rules::Rule;
use crate::db::{RunStore, TransferRun};
use crate::mux::Channel;
use crate::pipeline::{PhaseOutcome, PipelineRunner, TaskContext};

/// Drive an outbound run over `channel`
///
/// The run must already be bound to the channel. A fresh run (`Init`) runs
/// its pre tasks and sends a new request; an `Interrupted` run the caller
/// has moved back to `Running` sends a resume request instead. Returns once
/// the run has ended or the connection went away.
pub async fn run_sender(ctx: &SessionContext, channel: Channel, run: TransferRun) {
    let run_id = run.id;
    let rule = match ctx.db.rules.get(&run.rule_name).await {
        Ok(Some(rule)) => rule,
        Ok(None) => {
            let info = format!("{INFO_UNKNOWN_RULE}{}", run.rule_name);
            warn!(run_id, info = %info, "run cannot start");
            if let Err(e) = ctx.db.runs.update_status(run_id, RunStatus::Error, Some(&info)).await {
                debug!(run_id, error = %e, "run not moved to error");
            }
            return;
        }
        Err(e) => {
            warn!(run_id, error = %e, "cannot load rule");
            return;
        }
    };

    let mut session = SenderSession {
        runs: ctx.db.runs.clone(),
        pipeline: PipelineRunner::new(ctx.db.runs.clone()),
        task_ctx: TaskContext::new(run_id, rule.name.clone(), &run.filename),
        rule,
        run,
        channel,
        host_key: ctx.host_key.clone().unwrap_or_default(),
    };

    if let Err(e) = session.run().await {
        if e.is_transport() || session.channel.is_cancelled() {
            debug!(run_id, error = %e, "sender stopped with its connection");
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

struct SenderSession {
    channel: Channel,
    runs: RunStore,
    pipeline: PipelineRunner,
    rule: Rule,
    run: TransferRun,
    task_ctx: TaskContext,
    host_key: String,
}

impl SenderSession {
    async fn run(&mut self) -> Result<(), SessionError> {
        let run_id = self.run.id;
        let resume_id = match self.run.status {
            RunStatus::Init => None,
            _ => self.run.peer_run_id,
        };

        if resume_id.is_none() {
            let cancel = self.channel.cancel_signal();
            let outcome = self
                .pipeline
                .execute(
                    TaskStep::PreTask,
                    &self.rule.pre_tasks,
                    &self.rule.error_tasks,
                    &mut self.task_ctx,
                    &cancel,
                )
                .await?;
            if !self.continue_after(outcome).await {
                return Ok(());
            }
        }

        // The receiver only ever sees the file's name
        let Some(filename) = base_name(&self.run.filename) else {
            return Err(SessionError::Abort(format!(
                "{INFO_INVALID_FILENAME}{}",
                self.run.filename
            )));
        };
        let mut request = self.run.request();
        request.filename = filename;

        // Fail early rather than after the receiver set up its side
        let mut file = File::open(&self.run.filename).await?;

        self.channel
            .send(&LocalPacket::Authent {
                host_id: request.requester.clone(),
                key: self.host_key.clone(),
            })
            .await?;
        match self.channel.recv_local().await {
            None => return Ok(()),
            Some(packet) => match packet? {
                LocalPacket::AuthentValid => {}
                LocalPacket::Error { info } => return self.peer_failed(&info).await,
                other => {
                    return Err(SessionError::Abort(format!("unexpected {} packet", other.kind())));
                }
            },
        }
        self.channel
            .send(&LocalPacket::Request {
                request,
                block_size: self.run.block_size,
                resume_id,
            })
            .await?;

        let rank = match self.channel.recv_local().await {
            None => return Ok(()),
            Some(packet) => match packet? {
                LocalPacket::Valid { run_id: peer_run_id, rank } => {
                    self.runs.set_peer_run_id(run_id, peer_run_id).await?;
                    if self.run.status == RunStatus::Init {
                        self.runs
                            .update_status(run_id, RunStatus::Running, None)
                            .await?;
                    }
                    self.runs
                        .update_step(run_id, TaskStep::TransferTask, 0)
                        .await?;
                    info!(run_id, peer_run_id, rank, "transfer accepted by peer");
                    rank
                }
                LocalPacket::Error { info } => return self.peer_failed(&info).await,
                other => {
                    return Err(SessionError::Abort(format!("unexpected {} packet", other.kind())));
                }
            },
        };

        let Some(block_count) = self.stream(&mut file, rank).await? else {
            return Ok(());
        };
        self.channel
            .send(&LocalPacket::EndTransfer { block_count })
            .await?;

        loop {
            let packet = match self.channel.recv_local().await {
                None => return Ok(()),
                Some(packet) => packet?,
            };
            match packet {
                LocalPacket::EndRequest { .. } => break,
                LocalPacket::Error { info } => return self.peer_failed(&info).await,
                other => {
                    debug!(run_id, kind = other.kind(), "packet ignored while waiting for end");
                }
            }
        }

        let cancel = self.channel.cancel_signal();
        let outcome = self
            .pipeline
            .execute(
                TaskStep::PostTask,
                &self.rule.post_tasks,
                &self.rule.error_tasks,
                &mut self.task_ctx,
                &cancel,
            )
            .await?;
        if !self.continue_after(outcome).await {
            return Ok(());
        }

        self.pipeline.complete(run_id).await?;
        info!(run_id, blocks = block_count, "transfer finished");
        Ok(())
    }

    /// Send blocks from `rank` to the end of the file
    ///
    /// Returns the total block count, or `None` if the peer aborted while
    /// blocks were flowing.
    async fn stream(&mut self, file: &mut File, rank: i32) -> Result<Option<i32>, SessionError> {
        let run_id = self.run.id;
        let block_size = self.run.block_size as usize;
        let mut rank = rank.max(0);

        // A receiver holding every block resumes at the block count, which
        // points past the end when the last block is partial
        let len = file.metadata().await?.len();
        let offset = rank as u64 * block_size as u64;
        if rank as u64 > len.div_ceil(block_size as u64) {
            return Err(SessionError::Abort(format!(
                "{INFO_NOT_RESUMABLE}source shorter than resume offset {offset}"
            )));
        }
        file.seek(SeekFrom::Start(offset.min(len))).await?;

        loop {
            // An error from the peer stops the stream early
            while let Some(packet) = self.channel.try_recv_local() {
                match packet? {
                    LocalPacket::Error { info } => {
                        self.peer_failed(&info).await?;
                        return Ok(None);
                    }
                    other => {
                        return Err(SessionError::Abort(format!("unexpected {} packet", other.kind())));
                    }
                }
            }

            let block = read_block(file, block_size).await?;
            if block.is_empty() {
                return Ok(Some(rank));
            }
            let last = block.len() < block_size;

            self.channel.send(&LocalPacket::Data { rank, block }).await?;
            rank = rank
                .checked_add(1)
                .ok_or_else(|| SessionError::Abort("too many blocks".to_string()))?;
            self.runs.update_rank(run_id, rank).await?;

            if last {
                return Ok(Some(rank));
            }
        }
    }

    /// The peer failed the transfer; fail ours with its message
    async fn peer_failed(&mut self, info: &str) -> Result<(), SessionError> {
        info!(run_id = self.run.id, info, "peer refused transfer");
        self.pipeline
            .fail_with(&self.rule.error_tasks, &mut self.task_ctx, info)
            .await?;
        Ok(())
    }

    async fn continue_after(&mut self, outcome: PhaseOutcome) -> bool {
        match outcome {
            PhaseOutcome::Completed | PhaseOutcome::Stopped { .. } => true,
            PhaseOutcome::Failed { info, .. } => {
                if self.channel.remote_id() == NO_CHANNEL {
                    return false;
                }
                if let Err(e) = self.channel.send(&LocalPacket::Error { info }).await {
                    debug!(run_id = self.run.id, error = %e, "error not sent to peer");
                }
                false
            }
            PhaseOutcome::Cancelled => {
                if let Err(e) = settle_lost_run(&self.runs, self.run.id).await {
                    debug!(run_id = self.run.id, error = %e, "cancelled run not settled");
                }
                false
            }
        }
    }
}

/// Read up to `size` bytes; shorter only at end of file
async fn read_block(file: &mut File, size: usize) -> std::io::Result<Bytes> {
    let mut buf = BytesMut::zeroed(size);
    let mut filled = 0;
    while filled < size {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf.freeze())
}
