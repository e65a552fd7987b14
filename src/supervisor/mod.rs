pub mod copier;
pub mod copy_task;
pub mod escalation;
pub mod process;
pub mod registry;
pub mod scheduler;

pub use copier::{Copier, FileCopier};
pub use copy_task::CopyTask;
pub use escalation::{EscalationPlan, EscalationStep};
pub use process::{PollOutcome, ProcessController, StartOutcome};
pub use registry::{Indexed, TaskRegistry};
pub use scheduler::{Scheduler, Snapshot};

use serde::Serialize;
use std::fmt;

/// Lifecycle of a supervised child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// No process; eligible to start.
    Idle,
    Starting,
    Running,
    /// Termination requested, escalation in progress.
    Stopping,
    /// Exited with status 0, or ended by our own stop request.
    Stopped,
    /// Vanished abnormally or could not be stopped.
    Dead,
    /// Exited with a non-zero status.
    Failed,
}

impl TaskState {
    /// States a task never leaves again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Stopped | TaskState::Dead | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Idle => "idle",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Stopping => "stopping",
            TaskState::Stopped => "stopped",
            TaskState::Dead => "dead",
            TaskState::Failed => "failed",
        };
        f.write_str(name)
    }
}
