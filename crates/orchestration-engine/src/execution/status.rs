//! Node and plan execution statuses and the allowed transitions between them.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a node execution or plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Running,
    AsyncWaiting,
    TaskWaiting,
    InterventionWaiting,
    Paused,
    /// Abort in progress; the node is being torn down.
    Discontinuing,
    Succeeded,
    Failed,
    Aborted,
    Expired,
    Skipped,
    IgnoreFailed,
    Errored,
}

impl Status {
    pub const TERMINAL: [Status; 7] = [
        Status::Succeeded,
        Status::Failed,
        Status::Aborted,
        Status::Expired,
        Status::Skipped,
        Status::IgnoreFailed,
        Status::Errored,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Suspended on an external correlation id.
    pub fn is_waiting(self) -> bool {
        matches!(self, Status::AsyncWaiting | Status::TaskWaiting)
    }

    /// Terminal outcomes that count as a failure for aggregation.
    pub fn is_broken(self) -> bool {
        matches!(
            self,
            Status::Failed | Status::Aborted | Status::Expired | Status::Errored
        )
    }

    /// Whether the state machine permits moving from `self` to `to`.
    ///
    /// Terminal statuses permit nothing; callers treat such attempts as no-ops.
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        if self.is_terminal() || self == to {
            return false;
        }
        match self {
            Queued => matches!(to, Running | Paused | Discontinuing) || to.is_terminal(),
            Running => {
                matches!(
                    to,
                    AsyncWaiting | TaskWaiting | InterventionWaiting | Paused | Discontinuing
                ) || to.is_terminal()
            }
            AsyncWaiting | TaskWaiting => {
                matches!(to, Running | Paused | InterventionWaiting | Discontinuing)
                    || to.is_terminal()
            }
            InterventionWaiting => {
                matches!(to, Running | Paused | Discontinuing) || to.is_terminal()
            }
            Paused => !matches!(to, Queued),
            Discontinuing => to.is_terminal(),
            _ => false,
        }
    }

    /// Aggregate the statuses of finished nodes into one outcome.
    ///
    /// Priority: ABORTED > ERRORED > EXPIRED > FAILED > SUCCEEDED. Skipped and
    /// ignored failures count as success.
    pub fn aggregate<I>(statuses: I) -> Status
    where
        I: IntoIterator<Item = Status>,
    {
        let mut result = Status::Succeeded;
        for status in statuses {
            if status.aggregate_rank() > result.aggregate_rank() {
                result = status;
            }
        }
        result
    }

    fn aggregate_rank(self) -> u8 {
        match self {
            Status::Aborted => 4,
            Status::Errored => 3,
            Status::Expired => 2,
            Status::Failed => 1,
            _ => 0,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::AsyncWaiting => "ASYNC_WAITING",
            Status::TaskWaiting => "TASK_WAITING",
            Status::InterventionWaiting => "INTERVENTION_WAITING",
            Status::Paused => "PAUSED",
            Status::Discontinuing => "DISCONTINUING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Aborted => "ABORTED",
            Status::Expired => "EXPIRED",
            Status::Skipped => "SKIPPED",
            Status::IgnoreFailed => "IGNORE_FAILED",
            Status::Errored => "ERRORED",
        };
        f.write_str(name)
    }
}
