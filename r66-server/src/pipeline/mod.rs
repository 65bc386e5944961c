//! Task pipeline
//!
//! A rule lists tasks for three phases around the data movement: pre-transfer,
//! post-transfer and error. Each task ends in one of three outcomes (see
//! [`TaskOutcome`]). The runner turns those into a phase outcome and never
//! lets a task failure escape as an error: a failing task is recorded on the
//! run, the error tasks run, and the run moves to `Error`.

mod builtin;
mod runner;
mod task;

pub use builtin::build_task;
pub use runner::{PhaseOutcome, PipelineError, PipelineRunner};
pub use task::{Task, TaskContext, TaskError, TaskKind, TaskOutcome, TaskSpec};
