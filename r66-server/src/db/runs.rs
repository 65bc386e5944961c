//! Transfer run store
//!
//! Persists runs and their progress. Status changes go through the
//! transition graph on [`RunStatus`] and are applied with a compare-and-swap
//! on the stored status, so a rejected or lost-race transition writes nothing.

use std::str::FromStr;
use std::sync::Arc;

use r66_common::run::{RunStatus, TaskStep, TransferRequest};
use sqlx::SqlitePool;

use super::ids::IdAllocator;
use super::sql::{
    SQL_ADVANCE_RANK, SQL_FAIL_ORPHANED, SQL_INSERT_RUN, SQL_INTERRUPT_ORPHANED, SQL_SELECT_RUN,
    SQL_SELECT_RUN_STATUS, SQL_SELECT_RUNS_BY_STATUS, SQL_SWAP_RUN_STATUS, SQL_UPDATE_PEER_RUN_ID,
    SQL_UPDATE_RUN_STEP,
};
use super::{StoreError, now};

/// A persisted transfer run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRun {
    pub id: i64,
    pub rule_name: String,
    pub requester: String,
    pub requested: String,
    pub filename: String,
    /// Whether this side sends the file
    pub is_sender: bool,
    /// The other side's id for the same transfer, once known
    pub peer_run_id: Option<i64>,
    pub block_size: u32,
    /// Number of blocks confirmed written; the resume cursor
    pub rank: i32,
    pub status: RunStatus,
    pub global_step: TaskStep,
    pub step: i32,
    pub start_time: i64,
    pub stop_time: Option<i64>,
    pub error_info: Option<String>,
    /// Instance that created or last resumed the run
    pub owner: Option<i64>,
}

impl TransferRun {
    /// Byte offset where a resumed transfer continues
    pub fn resume_offset(&self) -> u64 {
        self.rank.max(0) as u64 * u64::from(self.block_size)
    }

    /// The request this run was created from
    pub fn request(&self) -> TransferRequest {
        TransferRequest::new(
            self.rule_name.clone(),
            self.requester.clone(),
            self.requested.clone(),
            self.filename.clone(),
        )
    }
}

/// Row type for run queries
type RunRow = (
    i64,
    String,
    String,
    String,
    String,
    bool,
    Option<i64>,
    i64,
    i32,
    String,
    String,
    i32,
    i64,
    Option<i64>,
    Option<String>,
    Option<i64>,
);

impl TryFrom<RunRow> for TransferRun {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.0,
            rule_name: row.1,
            requester: row.2,
            requested: row.3,
            filename: row.4,
            is_sender: row.5,
            peer_run_id: row.6,
            block_size: u32::try_from(row.7)
                .map_err(|_| StoreError::InvalidData(format!("block size {}", row.7)))?,
            rank: row.8,
            status: parse_status(&row.9)?,
            global_step: TaskStep::from_str(&row.10)
                .map_err(|_| StoreError::InvalidData(format!("task step '{}'", row.10)))?,
            step: row.11,
            start_time: row.12,
            stop_time: row.13,
            error_info: row.14,
            owner: row.15,
        })
    }
}

fn parse_status(s: &str) -> Result<RunStatus, StoreError> {
    RunStatus::from_str(s).map_err(|_| StoreError::InvalidData(format!("run status '{s}'")))
}

/// Input for [`RunStore::create`]
#[derive(Debug, Clone)]
pub struct NewRun {
    pub request: TransferRequest,
    pub block_size: u32,
    pub is_sender: bool,
    pub peer_run_id: Option<i64>,
}

/// Database access for transfer runs
#[derive(Clone)]
pub struct RunStore {
    pool: SqlitePool,
    ids: Arc<dyn IdAllocator>,
    owner: Option<i64>,
}

impl RunStore {
    pub fn new(pool: SqlitePool, ids: Arc<dyn IdAllocator>) -> Self {
        Self {
            pool,
            ids,
            owner: None,
        }
    }

    /// Stamp runs created or resumed through this store with `instance`
    pub fn with_owner(self, instance: i64) -> Self {
        Self {
            owner: Some(instance),
            ..self
        }
    }

    /// Instance this store stamps runs with
    pub fn owner(&self) -> Option<i64> {
        self.owner
    }

    /// Persist a new run in `Init` status and return its id
    pub async fn create(&self, run: &NewRun) -> Result<i64, StoreError> {
        let id = self.ids.allocate().await?;

        sqlx::query(SQL_INSERT_RUN)
            .bind(id)
            .bind(&run.request.rule)
            .bind(&run.request.requester)
            .bind(&run.request.requested)
            .bind(&run.request.filename)
            .bind(run.is_sender)
            .bind(run.peer_run_id)
            .bind(i64::from(run.block_size))
            .bind(now())
            .bind(self.owner)
            .execute(&self.pool)
            .await?;

        Ok(id)
    }

    /// Fetch a run
    pub async fn get(&self, id: i64) -> Result<TransferRun, StoreError> {
        let row: Option<RunRow> = sqlx::query_as(SQL_SELECT_RUN)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or(StoreError::NotFound(id))?.try_into()
    }

    /// All runs currently in `status`, oldest first
    pub async fn list_by_status(&self, status: RunStatus) -> Result<Vec<TransferRun>, StoreError> {
        let rows: Vec<RunRow> = sqlx::query_as(SQL_SELECT_RUNS_BY_STATUS)
            .bind(status.as_ref())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TransferRun::try_from).collect()
    }

    /// Raise the rank of a run
    ///
    /// A value at or below the stored rank is a no-op, as is any update on a
    /// run that is not `Running`. Returns whether the stored rank changed.
    pub async fn update_rank(&self, id: i64, rank: i32) -> Result<bool, StoreError> {
        let result = sqlx::query(SQL_ADVANCE_RANK)
            .bind(rank)
            .bind(id)
            .bind(rank)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // Distinguish a stale value from a missing run
        self.current_status(id).await?;
        Ok(false)
    }

    /// Move a run to `status`
    ///
    /// `error_info`, when given, replaces the stored error text. Terminal and
    /// interrupted statuses stamp `stop_time`; `Running` clears it and hands
    /// the run to this store's owner.
    ///
    /// # Errors
    ///
    /// [`StoreError::StateConflict`] if the transition is not allowed from the
    /// current status, or if another writer changed the status first. The
    /// stored row is untouched in both cases.
    pub async fn update_status(
        &self,
        id: i64,
        status: RunStatus,
        error_info: Option<&str>,
    ) -> Result<(), StoreError> {
        let current = self.current_status(id).await?;
        if !current.can_transition_to(status) {
            return Err(StoreError::StateConflict {
                id,
                from: current,
                to: status,
            });
        }

        let stop_time = match status {
            RunStatus::Init | RunStatus::Running => None,
            RunStatus::Finished | RunStatus::Error | RunStatus::Interrupted => Some(now()),
        };

        let owner = match status {
            RunStatus::Running => self.owner,
            _ => None,
        };

        let result = sqlx::query(SQL_SWAP_RUN_STATUS)
            .bind(status.as_ref())
            .bind(error_info)
            .bind(stop_time)
            .bind(owner)
            .bind(id)
            .bind(current.as_ref())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            // Lost the race; report what is stored now
            let now_stored = self.current_status(id).await?;
            return Err(StoreError::StateConflict {
                id,
                from: now_stored,
                to: status,
            });
        }

        Ok(())
    }

    /// Record the pipeline phase and task index a run has reached
    pub async fn update_step(&self, id: i64, global_step: TaskStep, step: i32) -> Result<(), StoreError> {
        let result = sqlx::query(SQL_UPDATE_RUN_STEP)
            .bind(global_step.as_ref())
            .bind(step)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Record the peer's id for a run
    pub async fn set_peer_run_id(&self, id: i64, peer_run_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(SQL_UPDATE_PEER_RUN_ID)
            .bind(peer_run_id)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Mark `Running` runs of dead instances `Interrupted`
    ///
    /// An instance whose heartbeat is at or before `live_since` is dead, and
    /// runs with no owner always qualify. Returns the number of runs changed.
    pub async fn interrupt_orphaned(&self, live_since: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(SQL_INTERRUPT_ORPHANED)
            .bind(now())
            .bind(live_since)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Mark `Init` runs of dead instances `Error`
    ///
    /// Companion to [`interrupt_orphaned`](Self::interrupt_orphaned): a run
    /// that never moved a block has nothing to resume.
    pub async fn fail_orphaned(&self, error_info: &str, live_since: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(SQL_FAIL_ORPHANED)
            .bind(error_info)
            .bind(now())
            .bind(live_since)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn current_status(&self, id: i64) -> Result<RunStatus, StoreError> {
        let status: Option<String> = sqlx::query_scalar(SQL_SELECT_RUN_STATUS)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        parse_status(&status.ok_or(StoreError::NotFound(id))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ids::{IdStrategy, allocator_for};
    use crate::db::instances::InstanceDb;
    use crate::db::testing::create_test_db;

    async fn store() -> RunStore {
        let pool = create_test_db().await;
        RunStore::new(pool.clone(), allocator_for(IdStrategy::Sequence, pool))
    }

    fn new_run() -> NewRun {
        NewRun {
            request: TransferRequest::new("default", "hosta", "hostb", "report.csv"),
            block_size: 1024,
            is_sender: false,
            peer_run_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = store().await;
        let id = store.create(&new_run()).await.unwrap();

        let run = store.get(id).await.unwrap();
        assert_eq!(run.id, id);
        assert_eq!(run.rule_name, "default");
        assert_eq!(run.requester, "hosta");
        assert_eq!(run.requested, "hostb");
        assert_eq!(run.filename, "report.csv");
        assert_eq!(run.block_size, 1024);
        assert_eq!(run.rank, 0);
        assert_eq!(run.status, RunStatus::Init);
        assert_eq!(run.global_step, TaskStep::NoTask);
        assert!(run.stop_time.is_none());
        assert!(run.error_info.is_none());
        assert_eq!(run.request(), new_run().request);
    }

    #[tokio::test]
    async fn test_ids_never_reused() {
        let store = store().await;
        let a = store.create(&new_run()).await.unwrap();
        let b = store.create(&new_run()).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = store().await;
        assert!(matches!(store.get(999).await, Err(StoreError::NotFound(999))));
    }

    // =========================================================================
    // Rank
    // =========================================================================

    #[tokio::test]
    async fn test_rank_stale_value_is_noop() {
        let store = store().await;
        let id = store.create(&new_run()).await.unwrap();
        store.update_status(id, RunStatus::Running, None).await.unwrap();

        assert!(store.update_rank(id, 5).await.unwrap());
        assert!(!store.update_rank(id, 4).await.unwrap());
        assert!(!store.update_rank(id, 5).await.unwrap());

        assert_eq!(store.get(id).await.unwrap().rank, 5);
    }

    #[tokio::test]
    async fn test_rank_frozen_after_terminal() {
        let store = store().await;
        let id = store.create(&new_run()).await.unwrap();
        store.update_status(id, RunStatus::Running, None).await.unwrap();
        store.update_rank(id, 3).await.unwrap();
        store.update_status(id, RunStatus::Finished, None).await.unwrap();

        assert!(!store.update_rank(id, 10).await.unwrap());
        assert_eq!(store.get(id).await.unwrap().rank, 3);
    }

    #[tokio::test]
    async fn test_rank_frozen_while_interrupted() {
        let store = store().await;
        let id = store.create(&new_run()).await.unwrap();
        assert!(!store.update_rank(id, 2).await.unwrap());

        store.update_status(id, RunStatus::Running, None).await.unwrap();
        store.update_rank(id, 4).await.unwrap();
        store.update_status(id, RunStatus::Interrupted, None).await.unwrap();

        // A late block from the lost connection must not move the resume cursor
        assert!(!store.update_rank(id, 9).await.unwrap());
        assert_eq!(store.get(id).await.unwrap().rank, 4);
    }

    #[tokio::test]
    async fn test_rank_missing_run() {
        let store = store().await;
        assert!(matches!(
            store.update_rank(42, 1).await,
            Err(StoreError::NotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_resume_offset() {
        let store = store().await;
        let id = store.create(&new_run()).await.unwrap();
        store.update_status(id, RunStatus::Running, None).await.unwrap();
        store.update_rank(id, 7).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().resume_offset(), 7 * 1024);
    }

    // =========================================================================
    // Status
    // =========================================================================

    #[tokio::test]
    async fn test_illegal_transition_leaves_status() {
        let store = store().await;
        let id = store.create(&new_run()).await.unwrap();

        let result = store.update_status(id, RunStatus::Finished, None).await;
        assert!(matches!(
            result,
            Err(StoreError::StateConflict {
                from: RunStatus::Init,
                to: RunStatus::Finished,
                ..
            })
        ));
        assert_eq!(store.get(id).await.unwrap().status, RunStatus::Init);
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let store = store().await;
        let id = store.create(&new_run()).await.unwrap();
        store
            .update_status(id, RunStatus::Error, Some("disk full"))
            .await
            .unwrap();

        for next in [RunStatus::Running, RunStatus::Interrupted, RunStatus::Finished] {
            assert!(store.update_status(id, next, None).await.is_err());
        }
        let run = store.get(id).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error_info.as_deref(), Some("disk full"));
        assert!(run.stop_time.is_some());
    }

    #[tokio::test]
    async fn test_interrupt_and_resume_keeps_rank() {
        let store = store().await;
        let id = store.create(&new_run()).await.unwrap();
        store.update_status(id, RunStatus::Running, None).await.unwrap();

        for rank in 1..=10 {
            store.update_rank(id, rank).await.unwrap();
        }

        store.update_status(id, RunStatus::Interrupted, None).await.unwrap();
        let run = store.get(id).await.unwrap();
        assert_eq!(run.status, RunStatus::Interrupted);
        assert_eq!(run.rank, 10);
        assert!(run.stop_time.is_some());

        store.update_status(id, RunStatus::Running, None).await.unwrap();
        let run = store.get(id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.rank, 10);
        assert!(run.stop_time.is_none());
    }

    #[tokio::test]
    async fn test_error_info_kept_when_not_replaced() {
        let store = store().await;
        let id = store.create(&new_run()).await.unwrap();
        store.update_status(id, RunStatus::Running, None).await.unwrap();
        store
            .update_status(id, RunStatus::Interrupted, Some("connection lost"))
            .await
            .unwrap();
        store.update_status(id, RunStatus::Running, None).await.unwrap();

        let run = store.get(id).await.unwrap();
        assert_eq!(run.error_info.as_deref(), Some("connection lost"));
    }

    #[tokio::test]
    async fn test_status_missing_run() {
        let store = store().await;
        assert!(matches!(
            store.update_status(5, RunStatus::Running, None).await,
            Err(StoreError::NotFound(5))
        ));
    }

    // =========================================================================
    // Orphan recovery and listing
    // =========================================================================

    #[tokio::test]
    async fn test_orphan_recovery_skips_live_owners() {
        let pool = create_test_db().await;
        let instances = InstanceDb::new(pool.clone());
        let live = instances.register().await.unwrap();
        let dead = instances.register().await.unwrap();
        sqlx::query("UPDATE instances SET heartbeat_at = 0 WHERE id = ?")
            .bind(dead)
            .execute(&pool)
            .await
            .unwrap();

        let ids = allocator_for(IdStrategy::Sequence, pool.clone());
        let ours = RunStore::new(pool.clone(), ids.clone()).with_owner(live);
        let theirs = RunStore::new(pool.clone(), ids.clone()).with_owner(dead);
        let unowned = RunStore::new(pool, ids);

        let live_running = ours.create(&new_run()).await.unwrap();
        let live_init = ours.create(&new_run()).await.unwrap();
        let dead_running = theirs.create(&new_run()).await.unwrap();
        let dead_init = theirs.create(&new_run()).await.unwrap();
        let unowned_running = unowned.create(&new_run()).await.unwrap();
        let finished = theirs.create(&new_run()).await.unwrap();
        for id in [live_running, dead_running, unowned_running, finished] {
            ours.update_status(id, RunStatus::Running, None).await.unwrap();
        }
        // Resuming hands the run to the resumer
        theirs.update_status(dead_running, RunStatus::Interrupted, None).await.unwrap();
        theirs.update_status(dead_running, RunStatus::Running, None).await.unwrap();
        ours.update_status(finished, RunStatus::Finished, None).await.unwrap();

        let live_since = now() - 60;
        assert_eq!(ours.interrupt_orphaned(live_since).await.unwrap(), 2);
        assert_eq!(ours.fail_orphaned("owner stopped", live_since).await.unwrap(), 1);

        assert_eq!(ours.get(live_running).await.unwrap().status, RunStatus::Running);
        assert_eq!(ours.get(live_init).await.unwrap().status, RunStatus::Init);
        assert_eq!(ours.get(dead_running).await.unwrap().status, RunStatus::Interrupted);
        assert_eq!(ours.get(unowned_running).await.unwrap().status, RunStatus::Interrupted);
        let failed = ours.get(dead_init).await.unwrap();
        assert_eq!(failed.status, RunStatus::Error);
        assert_eq!(failed.error_info.as_deref(), Some("owner stopped"));
        assert_eq!(ours.get(finished).await.unwrap().status, RunStatus::Finished);
    }

    #[tokio::test]
    async fn test_running_transition_takes_ownership() {
        let pool = create_test_db().await;
        let ids = allocator_for(IdStrategy::Sequence, pool.clone());
        let first = RunStore::new(pool.clone(), ids.clone()).with_owner(1);
        let second = RunStore::new(pool, ids).with_owner(2);

        let id = first.create(&new_run()).await.unwrap();
        assert_eq!(first.get(id).await.unwrap().owner, Some(1));

        first.update_status(id, RunStatus::Running, None).await.unwrap();
        first.update_status(id, RunStatus::Interrupted, None).await.unwrap();
        assert_eq!(first.get(id).await.unwrap().owner, Some(1));

        second.update_status(id, RunStatus::Running, None).await.unwrap();
        assert_eq!(second.get(id).await.unwrap().owner, Some(2));
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let store = store().await;
        let a = store.create(&new_run()).await.unwrap();
        let b = store.create(&new_run()).await.unwrap();
        store.update_status(b, RunStatus::Running, None).await.unwrap();

        let init: Vec<i64> = store
            .list_by_status(RunStatus::Init)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(init, vec![a]);

        let running = store.list_by_status(RunStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, b);
    }

    #[tokio::test]
    async fn test_step_and_peer_id() {
        let store = store().await;
        let id = store.create(&new_run()).await.unwrap();

        store.update_step(id, TaskStep::PostTask, 2).await.unwrap();
        store.set_peer_run_id(id, 77).await.unwrap();

        let run = store.get(id).await.unwrap();
        assert_eq!(run.global_step, TaskStep::PostTask);
        assert_eq!(run.step, 2);
        assert_eq!(run.peer_run_id, Some(77));

        assert!(matches!(
            store.update_step(999, TaskStep::PreTask, 0).await,
            Err(StoreError::NotFound(999))
        ));
    }
}
