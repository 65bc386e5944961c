//! Transfer run status model and request types

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Lifecycle status of a transfer run
///
/// `Finished` and `Error` are terminal. `Interrupted` is the only state that
/// can go back to `Running` (on resume).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepted, no block moved yet
    Init,
    /// Blocks are flowing
    Running,
    /// Last block written and post tasks succeeded
    Finished,
    /// Unrecoverable failure
    Error,
    /// Transport lost mid-transfer; can resume from `rank`
    Interrupted,
}

impl RunStatus {
    /// Whether a run may move from `self` to `next`
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Init, Running)
                | (Init, Error)
                | (Running, Running)
                | (Running, Finished)
                | (Running, Error)
                | (Running, Interrupted)
                | (Interrupted, Running)
        )
    }

    /// Whether no further status change is allowed
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Finished | RunStatus::Error)
    }

    /// Whether a run in this status can be picked up again by a resume request
    pub fn is_resumable(self) -> bool {
        matches!(self, RunStatus::Interrupted)
    }
}

/// Pipeline phase last reached by a run
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStep {
    NoTask,
    PreTask,
    TransferTask,
    PostTask,
    AllDone,
    ErrorTask,
}

/// A request to move one file under a named rule
///
/// This is what a collaborator (operator CLI, directory watcher, admin API)
/// hands to the engine; the engine turns it into a persisted run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Rule that selects the task pipeline
    pub rule: String,
    /// Host id of the side that asked for the transfer
    pub requester: String,
    /// Host id of the side asked to take part
    pub requested: String,
    /// File name; the receiver keeps only its last component, under its spool
    pub filename: String,
}

impl TransferRequest {
    pub fn new(
        rule: impl Into<String>,
        requester: impl Into<String>,
        requested: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            rule: rule.into(),
            requester: requester.into(),
            requested: requested.into(),
            filename: filename.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const ALL: [RunStatus; 5] = [
        RunStatus::Init,
        RunStatus::Running,
        RunStatus::Finished,
        RunStatus::Error,
        RunStatus::Interrupted,
    ];

    #[test]
    fn test_terminal_states_have_no_exit() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_resume_only_from_interrupted() {
        assert!(RunStatus::Interrupted.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Finished.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Error.can_transition_to(RunStatus::Running));
    }

    #[test]
    fn test_init_cannot_finish_directly() {
        assert!(!RunStatus::Init.can_transition_to(RunStatus::Finished));
        assert!(!RunStatus::Init.can_transition_to(RunStatus::Interrupted));
        assert!(RunStatus::Init.can_transition_to(RunStatus::Error));
    }

    #[test]
    fn test_interrupted_cannot_fail_or_finish() {
        assert!(!RunStatus::Interrupted.can_transition_to(RunStatus::Finished));
        assert!(!RunStatus::Interrupted.can_transition_to(RunStatus::Error));
        assert!(!RunStatus::Interrupted.can_transition_to(RunStatus::Interrupted));
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in ALL {
            let s = status.to_string();
            assert_eq!(RunStatus::from_str(&s).unwrap(), status);
        }
        assert_eq!(RunStatus::Interrupted.as_ref(), "interrupted");
    }

    #[test]
    fn test_task_step_strings() {
        assert_eq!(TaskStep::PreTask.as_ref(), "pre_task");
        assert_eq!(TaskStep::from_str("all_done").unwrap(), TaskStep::AllDone);
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&RunStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
