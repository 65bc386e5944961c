//! Phase execution and outcome mapping

use r66_common::run::{RunStatus, TaskStep};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::builtin::build_task;
use super::task::{Task, TaskContext, TaskError, TaskOutcome, TaskSpec};
use crate::db::{RunStore, StoreError};

/// Errors that stop the runner itself (as opposed to task failures)
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid task configuration: {0}")]
    Task(#[from] TaskError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a phase ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Every task succeeded
    Completed,
    /// Task `index` asked to skip the rest of the phase
    Stopped { index: usize },
    /// Task `index` failed; error tasks have run and the run is in `Error`
    Failed { index: usize, info: String },
    /// The channel was closed; the run is left for the connection to settle
    Cancelled,
}

impl PhaseOutcome {
    /// Whether the transfer may continue after this phase
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped { .. })
    }
}

/// Runs rule phases against a run, recording progress in the store
#[derive(Clone)]
pub struct PipelineRunner {
    runs: RunStore,
}

impl PipelineRunner {
    pub fn new(runs: RunStore) -> Self {
        Self { runs }
    }

    /// Build and run one phase from configuration
    ///
    /// On a task failure the error tasks run and the run moves to `Error`
    /// with the failing task's message.
    pub async fn execute(
        &self,
        phase: TaskStep,
        specs: &[TaskSpec],
        error_specs: &[TaskSpec],
        ctx: &mut TaskContext,
        cancel: &watch::Receiver<bool>,
    ) -> Result<PhaseOutcome, PipelineError> {
        let tasks = build_tasks(specs)?;
        let error_tasks = build_tasks(error_specs)?;
        self.execute_tasks(phase, &tasks, &error_tasks, ctx, cancel)
            .await
    }

    /// Run already built tasks; see [`execute`](Self::execute)
    pub async fn execute_tasks(
        &self,
        phase: TaskStep,
        tasks: &[Box<dyn Task>],
        error_tasks: &[Box<dyn Task>],
        ctx: &mut TaskContext,
        cancel: &watch::Receiver<bool>,
    ) -> Result<PhaseOutcome, PipelineError> {
        let outcome = self.run_phase(phase, tasks, ctx, cancel).await?;

        if let PhaseOutcome::Failed { index, info } = &outcome {
            warn!(run_id = ctx.run_id, %phase, index, info = %info, "task failed");
            self.fail(error_tasks, ctx, info).await?;
        }
        Ok(outcome)
    }

    /// Run the tasks of one phase in order
    ///
    /// The channel's cancel signal is checked before each task. Records the
    /// phase and task index on the run as it goes.
    pub async fn run_phase(
        &self,
        phase: TaskStep,
        tasks: &[Box<dyn Task>],
        ctx: &mut TaskContext,
        cancel: &watch::Receiver<bool>,
    ) -> Result<PhaseOutcome, PipelineError> {
        for (index, task) in tasks.iter().enumerate() {
            if *cancel.borrow() {
                info!(run_id = ctx.run_id, %phase, index, "pipeline cancelled");
                return Ok(PhaseOutcome::Cancelled);
            }

            self.runs.update_step(ctx.run_id, phase, index as i32).await?;
            debug!(run_id = ctx.run_id, %phase, index, task = task.name(), "running task");

            match task.run(ctx).await {
                TaskOutcome::Success => {}
                TaskOutcome::EarlyStop => {
                    info!(run_id = ctx.run_id, %phase, index, "remaining tasks skipped");
                    return Ok(PhaseOutcome::Stopped { index });
                }
                TaskOutcome::RecoverableFailure(info) => {
                    return Ok(PhaseOutcome::Failed { index, info });
                }
            }
        }
        Ok(PhaseOutcome::Completed)
    }

    /// Run error tasks, then move the run to `Error` with `info`
    ///
    /// Error tasks run to completion regardless of cancellation; their own
    /// failures are logged and do not replace `info`. Nothing short of the
    /// status write itself keeps the run from reaching `Error`.
    pub async fn fail(
        &self,
        error_tasks: &[Box<dyn Task>],
        ctx: &mut TaskContext,
        info: &str,
    ) -> Result<(), PipelineError> {
        for (index, task) in error_tasks.iter().enumerate() {
            if let Err(e) = self
                .runs
                .update_step(ctx.run_id, TaskStep::ErrorTask, index as i32)
                .await
            {
                warn!(run_id = ctx.run_id, index, error = %e, "failed to record error task step");
            }
            match task.run(ctx).await {
                TaskOutcome::Success => {}
                TaskOutcome::EarlyStop => break,
                TaskOutcome::RecoverableFailure(e) => {
                    warn!(run_id = ctx.run_id, index, error = %e, "error task failed");
                }
            }
        }

        self.runs
            .update_status(ctx.run_id, RunStatus::Error, Some(info))
            .await?;
        Ok(())
    }

    /// Build error tasks from configuration and run [`fail`](Self::fail)
    pub async fn fail_with(
        &self,
        error_specs: &[TaskSpec],
        ctx: &mut TaskContext,
        info: &str,
    ) -> Result<(), PipelineError> {
        let error_tasks = build_tasks(error_specs)?;
        self.fail(&error_tasks, ctx, info).await
    }

    /// Mark a run done: all phases passed
    pub async fn complete(&self, run_id: i64) -> Result<(), PipelineError> {
        self.runs.update_step(run_id, TaskStep::AllDone, 0).await?;
        self.runs
            .update_status(run_id, RunStatus::Finished, None)
            .await?;
        Ok(())
    }
}

fn build_tasks(specs: &[TaskSpec]) -> Result<Vec<Box<dyn Task>>, TaskError> {
    specs.iter().map(build_task).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::create_test_db;
    use crate::db::{Database, IdStrategy, NewRun};
    use async_trait::async_trait;
    use r66_common::run::TransferRequest;
    use sqlx::SqlitePool;
    use std::sync::{Arc, Mutex};

    /// Records its name, then returns a fixed outcome
    struct Scripted {
        name: &'static str,
        outcome: TaskOutcome,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Task for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, _ctx: &mut TaskContext) -> TaskOutcome {
            self.log.lock().unwrap().push(self.name);
            self.outcome.clone()
        }
    }

    fn scripted(
        log: &Arc<Mutex<Vec<&'static str>>>,
        steps: &[(&'static str, TaskOutcome)],
    ) -> Vec<Box<dyn Task>> {
        steps
            .iter()
            .map(|(name, outcome)| {
                Box::new(Scripted {
                    name,
                    outcome: outcome.clone(),
                    log: log.clone(),
                }) as Box<dyn Task>
            })
            .collect()
    }

    async fn running_run() -> (RunStore, i64) {
        running_run_in(create_test_db().await).await
    }

    async fn running_run_in(pool: SqlitePool) -> (RunStore, i64) {
        let db = Database::new(pool, IdStrategy::Sequence);
        let id = db
            .runs
            .create(&NewRun {
                request: TransferRequest::new("default", "a", "b", "f.txt"),
                block_size: 1024,
                is_sender: false,
                peer_run_id: None,
            })
            .await
            .unwrap();
        db.runs.update_status(id, RunStatus::Running, None).await.unwrap();
        (db.runs, id)
    }

    #[tokio::test]
    async fn test_early_stop_skips_rest_and_finishes() {
        let (runs, id) = running_run().await;
        let runner = PipelineRunner::new(runs.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        let tasks = scripted(
            &log,
            &[
                ("A", TaskOutcome::Success),
                ("B", TaskOutcome::EarlyStop),
                ("C", TaskOutcome::Success),
            ],
        );
        let (_tx, cancel) = watch::channel(false);
        let mut ctx = TaskContext::new(id, "default", "/tmp/f.txt");

        let outcome = runner
            .execute_tasks(TaskStep::PostTask, &tasks, &[], &mut ctx, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, PhaseOutcome::Stopped { index: 1 });
        assert!(outcome.is_success());
        assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);

        runner.complete(id).await.unwrap();
        let run = runs.get(id).await.unwrap();
        assert_eq!(run.status, RunStatus::Finished);
        assert_eq!(run.global_step, TaskStep::AllDone);
        assert!(run.error_info.is_none());
    }

    #[tokio::test]
    async fn test_failure_runs_cleanup_and_errors() {
        let (runs, id) = running_run().await;
        let runner = PipelineRunner::new(runs.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        let tasks = scripted(
            &log,
            &[
                ("A", TaskOutcome::Success),
                ("B", TaskOutcome::RecoverableFailure("disk quota exceeded".into())),
                ("C", TaskOutcome::Success),
            ],
        );
        let cleanup = scripted(&log, &[("Cleanup", TaskOutcome::Success)]);
        let (_tx, cancel) = watch::channel(false);
        let mut ctx = TaskContext::new(id, "default", "/tmp/f.txt");

        let outcome = runner
            .execute_tasks(TaskStep::PostTask, &tasks, &cleanup, &mut ctx, &cancel)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PhaseOutcome::Failed {
                index: 1,
                info: "disk quota exceeded".to_string()
            }
        );
        assert_eq!(*log.lock().unwrap(), vec!["A", "B", "Cleanup"]);

        let run = runs.get(id).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error_info.as_deref(), Some("disk quota exceeded"));
        assert_eq!(run.global_step, TaskStep::ErrorTask);
    }

    #[tokio::test]
    async fn test_failing_error_task_keeps_original_info() {
        let (runs, id) = running_run().await;
        let runner = PipelineRunner::new(runs.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        let tasks = scripted(&log, &[("A", TaskOutcome::RecoverableFailure("first".into()))]);
        let cleanup = scripted(
            &log,
            &[
                ("E1", TaskOutcome::RecoverableFailure("second".into())),
                ("E2", TaskOutcome::Success),
            ],
        );
        let (_tx, cancel) = watch::channel(false);
        let mut ctx = TaskContext::new(id, "default", "/tmp/f.txt");

        runner
            .execute_tasks(TaskStep::PreTask, &tasks, &cleanup, &mut ctx, &cancel)
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["A", "E1", "E2"]);
        assert_eq!(
            runs.get(id).await.unwrap().error_info.as_deref(),
            Some("first")
        );
    }

    #[tokio::test]
    async fn test_step_write_failure_still_reaches_error() {
        let pool = create_test_db().await;
        sqlx::query(
            "CREATE TRIGGER reject_error_step BEFORE UPDATE OF global_step ON runs
             WHEN NEW.global_step = 'error_task'
             BEGIN SELECT RAISE(ABORT, 'step write rejected'); END",
        )
        .execute(&pool)
        .await
        .unwrap();
        let (runs, id) = running_run_in(pool).await;
        let runner = PipelineRunner::new(runs.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        let tasks = scripted(&log, &[("A", TaskOutcome::RecoverableFailure("bad input".into()))]);
        let cleanup = scripted(&log, &[("E1", TaskOutcome::Success), ("E2", TaskOutcome::Success)]);
        let (_tx, cancel) = watch::channel(false);
        let mut ctx = TaskContext::new(id, "default", "/tmp/f.txt");

        runner
            .execute_tasks(TaskStep::PreTask, &tasks, &cleanup, &mut ctx, &cancel)
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["A", "E1", "E2"]);
        let run = runs.get(id).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error_info.as_deref(), Some("bad input"));
        assert_eq!(run.global_step, TaskStep::PreTask);
    }

    #[tokio::test]
    async fn test_cancel_between_tasks() {
        let (runs, id) = running_run().await;
        let runner = PipelineRunner::new(runs.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        let tasks = scripted(&log, &[("A", TaskOutcome::Success)]);
        let (tx, cancel) = watch::channel(false);
        tx.send(true).unwrap();
        let mut ctx = TaskContext::new(id, "default", "/tmp/f.txt");

        let outcome = runner
            .execute_tasks(TaskStep::PostTask, &tasks, &[], &mut ctx, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, PhaseOutcome::Cancelled);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(runs.get(id).await.unwrap().status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_step_recorded() {
        let (runs, id) = running_run().await;
        let runner = PipelineRunner::new(runs.clone());
        let (_tx, cancel) = watch::channel(false);
        let mut ctx = TaskContext::new(id, "default", "/tmp/f.txt");
        let specs = vec![
            TaskSpec::new(super::super::TaskKind::Log, "one"),
            TaskSpec::new(super::super::TaskKind::Log, "two"),
        ];

        let outcome = runner
            .execute(TaskStep::PreTask, &specs, &[], &mut ctx, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, PhaseOutcome::Completed);

        let run = runs.get(id).await.unwrap();
        assert_eq!(run.global_step, TaskStep::PreTask);
        assert_eq!(run.step, 1);
    }

    #[tokio::test]
    async fn test_bad_configuration_is_pipeline_error() {
        let (runs, id) = running_run().await;
        let runner = PipelineRunner::new(runs);
        let (_tx, cancel) = watch::channel(false);
        let mut ctx = TaskContext::new(id, "default", "/tmp/f.txt");
        let specs = vec![TaskSpec::new(super::super::TaskKind::Copy, "")];

        assert!(matches!(
            runner
                .execute(TaskStep::PreTask, &specs, &[], &mut ctx, &cancel)
                .await,
            Err(PipelineError::Task(_))
        ));
    }
}
