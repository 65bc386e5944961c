//! Run ownership across processes sharing one database
//!
//! A process registers an instance and keeps its heartbeat fresh while it
//! runs. Runs belong to the instance that created or last resumed them.
//! Recovery only settles runs whose owner stopped beating, so a second
//! process starting against the same database leaves live transfers alone.

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{HEARTBEAT_INTERVAL, INFO_OWNER_STOPPED, INSTANCE_EXPIRY};
use crate::db::{Database, StoreError, now};

/// Runs settled by one recovery pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Recovered {
    /// `Running` runs moved to `Interrupted`
    pub interrupted: u64,
    /// `Init` runs moved to `Error`
    pub failed: u64,
}

impl Recovered {
    pub fn is_empty(&self) -> bool {
        self.interrupted == 0 && self.failed == 0
    }
}

/// Settle the runs of instances that stopped beating
///
/// Running runs become resumable, runs that never started are failed, and
/// the dead instance rows are removed afterwards.
pub async fn recover_orphaned_runs(db: &Database) -> Result<Recovered, StoreError> {
    let live_since = now() - INSTANCE_EXPIRY.as_secs() as i64;

    let interrupted = db.runs.interrupt_orphaned(live_since).await?;
    let failed = db.runs.fail_orphaned(INFO_OWNER_STOPPED, live_since).await?;

    let removed = db.instances.remove_stale(live_since).await?;
    if removed > 0 {
        debug!(removed, "removed dead instances");
    }

    Ok(Recovered {
        interrupted,
        failed,
    })
}

/// This process's registration, kept alive by a heartbeat task
pub struct Instance {
    db: Database,
    id: i64,
    heartbeat: JoinHandle<()>,
}

impl Instance {
    /// Register the process and start beating
    ///
    /// Returns the database stamped with the new instance. With `sweep`, every
    /// beat also recovers runs of dead instances; the listener enables it so
    /// a crashed peer process's runs become resumable without a restart.
    pub async fn start(db: Database, sweep: bool) -> Result<(Database, Instance), sqlx::Error> {
        let db = db.register_instance().await?;
        let id = db.instance_id().unwrap_or_default();
        info!(instance = id, "instance registered");

        let heartbeat = tokio::spawn(heartbeat(db.clone(), id, sweep));
        Ok((db.clone(), Instance { db, id, heartbeat }))
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Stop beating and remove the instance row
    ///
    /// Runs still owned by the instance become orphans for the next sweep.
    pub async fn stop(self) {
        self.heartbeat.abort();
        if let Err(e) = self.db.instances.release(self.id).await {
            warn!(instance = self.id, error = %e, "failed to release instance");
        }
    }
}

async fn heartbeat(db: Database, id: i64, sweep: bool) {
    loop {
        tokio::time::sleep(HEARTBEAT_INTERVAL).await;

        if let Err(e) = db.instances.heartbeat(id).await {
            warn!(instance = id, error = %e, "heartbeat failed");
            continue;
        }

        if sweep {
            match recover_orphaned_runs(&db).await {
                Ok(recovered) if !recovered.is_empty() => info!(
                    interrupted = recovered.interrupted,
                    failed = recovered.failed,
                    "recovered runs of stopped instances"
                ),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "run recovery failed"),
            }
        }
    }
}
