use std::collections::TryReserveError;
use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

use crate::supervisor::TaskState;

/// Errors raised by the supervisor core.
///
/// Every variant is local to one task's lifecycle except `PathTooLong` raised
/// while composing base directories, which aborts a whole reconciliation.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("operation not permitted while task is {0}")]
    InvalidState(TaskState),

    #[error("task credentials can only change while idle")]
    Busy,

    #[error("task registry could not grow: {0}")]
    OutOfMemory(#[from] TryReserveError),

    #[error("task registry slot {index} does not hold the expected task")]
    Inconsistent { index: usize },

    #[error("cannot read source {}: {source}", .path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("path exceeds {max} bytes: {}", .path.display())]
    PathTooLong { path: PathBuf, max: usize },

    #[error("fork failed: {0}")]
    Fork(#[source] Errno),

    #[error("waitpid({pid}) failed: {source}")]
    Wait {
        pid: Pid,
        #[source]
        source: Errno,
    },

    #[error("waitpid({pid}) reaped unexpected process {reaped}")]
    UnexpectedWait { pid: Pid, reaped: Pid },

    #[error("child {pid} ended {state} instead of stopped")]
    StopFailed { pid: Pid, state: TaskState },

    #[error("unknown user {0}")]
    UnknownUser(String),

    #[error("credential lookup failed: {0}")]
    Credentials(#[source] Errno),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
