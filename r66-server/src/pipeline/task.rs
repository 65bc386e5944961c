//! Task trait, outcomes and configuration

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Result of running one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Continue with the next task
    Success,
    /// The task failed while the transfer was in progress; the message
    /// becomes the run's error info
    RecoverableFailure(String),
    /// Skip the remaining tasks of the phase; not a failure
    EarlyStop,
}

/// Built-in task types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum TaskKind {
    Log,
    Copy,
    Move,
    Rename,
    Delete,
    ValidPath,
    Stop,
    Fail,
}

/// One task as configured in a rule
///
/// Stored as JSON, e.g. `{"type": "COPY", "args": "/srv/archive"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default)]
    pub args: String,
}

impl TaskSpec {
    pub fn new(kind: TaskKind, args: impl Into<String>) -> Self {
        Self {
            kind,
            args: args.into(),
        }
    }
}

/// Errors building a task from its configuration
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0} task requires an argument")]
    MissingArgument(TaskKind),
}

/// The run a task executes against
///
/// Tasks that move the file update `path` so later tasks see the new location.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: i64,
    pub rule: String,
    pub path: PathBuf,
}

impl TaskContext {
    pub fn new(run_id: i64, rule: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            run_id,
            rule: rule.into(),
            path: path.into(),
        }
    }

    /// Current file name (last path component)
    pub fn filename(&self) -> String {
        file_name(&self.path)
    }

    /// Replace `#FILENAME#`, `#RULE#` and `#RUNID#` in a task argument
    pub fn substitute(&self, template: &str) -> String {
        template
            .replace("#FILENAME#", &self.filename())
            .replace("#RULE#", &self.rule)
            .replace("#RUNID#", &self.run_id.to_string())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// One step of a pipeline
///
/// Tasks are not preemptible: cancellation is only observed between tasks.
#[async_trait]
pub trait Task: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn run(&self, ctx: &mut TaskContext) -> TaskOutcome;
}
