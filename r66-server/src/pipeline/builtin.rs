//! Built-in tasks

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::info;

use super::task::{Task, TaskContext, TaskError, TaskKind, TaskOutcome, TaskSpec};

/// Build a task from its configuration
///
/// # Errors
///
/// Returns an error if a task that needs an argument has none.
pub fn build_task(spec: &TaskSpec) -> Result<Box<dyn Task>, TaskError> {
    let args = spec.args.trim().to_string();
    let require = |args: String| {
        if args.is_empty() {
            Err(TaskError::MissingArgument(spec.kind))
        } else {
            Ok(args)
        }
    };

    Ok(match spec.kind {
        TaskKind::Log => Box::new(LogTask { message: args }),
        TaskKind::Copy => Box::new(CopyTask { dir: require(args)? }),
        TaskKind::Move => Box::new(MoveTask { dir: require(args)? }),
        TaskKind::Rename => Box::new(RenameTask { name: require(args)? }),
        TaskKind::Delete => Box::new(DeleteTask),
        TaskKind::ValidPath => Box::new(ValidPathTask {
            roots: require(args)?
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect(),
        }),
        TaskKind::Stop => Box::new(StopTask),
        TaskKind::Fail => Box::new(FailTask { message: args }),
    })
}

fn failure(action: &str, path: &Path, e: io::Error) -> TaskOutcome {
    TaskOutcome::RecoverableFailure(format!("{action} {}: {e}", path.display()))
}

/// Emit an info event
struct LogTask {
    message: String,
}

#[async_trait]
impl Task for LogTask {
    fn name(&self) -> &str {
        "LOG"
    }

    async fn run(&self, ctx: &mut TaskContext) -> TaskOutcome {
        let message = ctx.substitute(&self.message);
        info!(run_id = ctx.run_id, rule = %ctx.rule, "{message}");
        TaskOutcome::Success
    }
}

/// Copy the file into a directory, keeping its name
struct CopyTask {
    dir: String,
}

#[async_trait]
impl Task for CopyTask {
    fn name(&self) -> &str {
        "COPY"
    }

    async fn run(&self, ctx: &mut TaskContext) -> TaskOutcome {
        let dir = PathBuf::from(ctx.substitute(&self.dir));
        if let Err(e) = fs::create_dir_all(&dir).await {
            return failure("cannot create", &dir, e);
        }
        let target = dir.join(ctx.filename());
        match fs::copy(&ctx.path, &target).await {
            Ok(_) => TaskOutcome::Success,
            Err(e) => failure("cannot copy", &ctx.path, e),
        }
    }
}

/// Move the file into a directory, keeping its name
struct MoveTask {
    dir: String,
}

#[async_trait]
impl Task for MoveTask {
    fn name(&self) -> &str {
        "MOVE"
    }

    async fn run(&self, ctx: &mut TaskContext) -> TaskOutcome {
        let dir = PathBuf::from(ctx.substitute(&self.dir));
        if let Err(e) = fs::create_dir_all(&dir).await {
            return failure("cannot create", &dir, e);
        }
        let target = dir.join(ctx.filename());
        match move_file(&ctx.path, &target).await {
            Ok(()) => {
                ctx.path = target;
                TaskOutcome::Success
            }
            Err(e) => failure("cannot move", &ctx.path, e),
        }
    }
}

/// Rename the file within its directory
struct RenameTask {
    name: String,
}

#[async_trait]
impl Task for RenameTask {
    fn name(&self) -> &str {
        "RENAME"
    }

    async fn run(&self, ctx: &mut TaskContext) -> TaskOutcome {
        let name = ctx.substitute(&self.name);
        if Path::new(&name).file_name().is_none_or(|n| n != name.as_str()) {
            return TaskOutcome::RecoverableFailure(format!("invalid file name: {name}"));
        }
        let target = ctx.path.with_file_name(&name);
        match fs::rename(&ctx.path, &target).await {
            Ok(()) => {
                ctx.path = target;
                TaskOutcome::Success
            }
            Err(e) => failure("cannot rename", &ctx.path, e),
        }
    }
}

/// Remove the file
struct DeleteTask;

#[async_trait]
impl Task for DeleteTask {
    fn name(&self) -> &str {
        "DELETE"
    }

    async fn run(&self, ctx: &mut TaskContext) -> TaskOutcome {
        match fs::remove_file(&ctx.path).await {
            Ok(()) => TaskOutcome::Success,
            Err(e) => failure("cannot delete", &ctx.path, e),
        }
    }
}

/// Fail unless the file lies under one of the allowed roots
struct ValidPathTask {
    roots: Vec<PathBuf>,
}

#[async_trait]
impl Task for ValidPathTask {
    fn name(&self) -> &str {
        "VALIDPATH"
    }

    async fn run(&self, ctx: &mut TaskContext) -> TaskOutcome {
        // The file may not exist yet (pre-transfer on the receiving side)
        let Some(parent) = ctx.path.parent() else {
            return TaskOutcome::RecoverableFailure("path has no parent".to_string());
        };
        let dir = match fs::canonicalize(parent).await {
            Ok(dir) => dir,
            Err(e) => return failure("cannot resolve", parent, e),
        };

        for root in &self.roots {
            if let Ok(root) = fs::canonicalize(root).await
                && dir.starts_with(&root)
            {
                return TaskOutcome::Success;
            }
        }
        TaskOutcome::RecoverableFailure(format!(
            "{} is outside the allowed paths",
            ctx.path.display()
        ))
    }
}

/// Skip the rest of the phase
struct StopTask;

#[async_trait]
impl Task for StopTask {
    fn name(&self) -> &str {
        "STOP"
    }

    async fn run(&self, _ctx: &mut TaskContext) -> TaskOutcome {
        TaskOutcome::EarlyStop
    }
}

/// Always fail
struct FailTask {
    message: String,
}

#[async_trait]
impl Task for FailTask {
    fn name(&self) -> &str {
        "FAIL"
    }

    async fn run(&self, ctx: &mut TaskContext) -> TaskOutcome {
        let message = if self.message.is_empty() {
            "task failed".to_string()
        } else {
            ctx.substitute(&self.message)
        };
        TaskOutcome::RecoverableFailure(message)
    }
}

/// Rename, falling back to copy and delete across file systems
async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(from, to).await?;
            fs::remove_file(from).await
        }
        Err(e) => Err(e),
    }
}
