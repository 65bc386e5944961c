//! Inbound collaborator interface
//!
//! What an operator CLI, an admin API or a directory watcher uses to hand
//! transfers to the engine: `submit` a request, then poll its `status`.

use r66_common::run::TransferRequest;
use r66_common::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};
use tracing::{info, warn};

use crate::client;
use crate::db::{NewRun, StoreError, TransferRun};
use crate::session::SessionContext;

/// Submits outbound runs and reports their status
#[derive(Clone)]
pub struct TransferService {
    ctx: SessionContext,
    block_size: u32,
}

impl TransferService {
    /// Create a service sending with `block_size` (clamped to the valid range)
    pub fn new(ctx: SessionContext, block_size: u32) -> Self {
        Self {
            ctx,
            block_size: block_size.clamp(1, MAX_BLOCK_SIZE),
        }
    }

    /// Persist a new run and start it in the background
    ///
    /// Returns the run id as soon as the run is stored; the transfer itself
    /// proceeds asynchronously and is observed through [`status`](Self::status).
    pub async fn submit(&self, request: TransferRequest) -> Result<i64, StoreError> {
        let run_id = self
            .ctx
            .db
            .runs
            .create(&NewRun {
                request,
                block_size: self.block_size,
                is_sender: true,
                peer_run_id: None,
            })
            .await?;
        info!(run_id, "transfer submitted");

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            match client::execute(&ctx, run_id).await {
                Ok(run) => info!(run_id, status = %run.status, "transfer ended"),
                Err(e) => warn!(run_id, error = %e, "transfer failed"),
            }
        });

        Ok(run_id)
    }

    /// Current state of a run
    pub async fn status(&self, run_id: i64) -> Result<TransferRun, StoreError> {
        self.ctx.db.runs.get(run_id).await
    }
}

impl From<SessionContext> for TransferService {
    fn from(ctx: SessionContext) -> Self {
        Self::new(ctx, DEFAULT_BLOCK_SIZE)
    }
}
