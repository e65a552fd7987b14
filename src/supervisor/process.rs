use std::fmt::Display;
use std::io::Write;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use nix::sys::resource::{getrlimit, Resource};
use nix::sys::signal::{kill, signal, sigprocmask, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::stat::{umask, Mode};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, error, warn};

use super::escalation::EscalationPlan;
use super::TaskState;
use crate::error::{Result, SupervisorError};
use crate::utils::credentials::Credentials;

/// Highest descriptor number swept when the soft limit is unbounded.
const MAX_FD_SWEEP: u64 = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(Pid),
    /// The task already had a live child; nothing was forked.
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The task has no child to check on.
    NotApplicable,
    StillRunning,
    Reaped(TaskState),
}

/// Supervises one child process at a time, independent of what it runs.
#[derive(Debug)]
pub struct ProcessController {
    name: String,
    state: TaskState,
    pid: Option<Pid>,
    credentials: Credentials,
    umask: Mode,
    /// Signals delivered by the current `stop()`.
    delivered: SigSet,
}

impl ProcessController {
    pub fn new(name: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            name: name.into(),
            state: TaskState::Idle,
            pid: None,
            credentials,
            umask: Mode::from_bits_truncate(0o077),
            delivered: SigSet::empty(),
        }
    }

    /// File creation mask installed in the child.
    pub fn with_umask(mut self, mask: Mode) -> Self {
        self.umask = mask;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn set_credentials(&mut self, credentials: Credentials) -> Result<()> {
        if self.state != TaskState::Idle {
            return Err(SupervisorError::Busy);
        }
        self.credentials = credentials;
        Ok(())
    }

    /// Fork a child that assumes the task credentials and runs `entry`.
    ///
    /// The child exits 0 when `entry` succeeds and 1 otherwise, including
    /// when it cannot drop privileges. The parent never waits here.
    ///
    /// A panicking `entry` exits 1 when panics unwind; under `panic = "abort"`
    /// the child dies of SIGABRT and the task ends `Dead`.
    pub fn start<F, E>(&mut self, entry: F) -> Result<StartOutcome>
    where
        F: FnOnce() -> std::result::Result<(), E>,
        E: Display,
    {
        debug!("{}: start", self.name);

        match self.state {
            TaskState::Running => return Ok(StartOutcome::AlreadyRunning),
            TaskState::Idle => {}
            state => return Err(SupervisorError::InvalidState(state)),
        }
        self.state = TaskState::Starting;

        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();

        // SAFETY: the scheduler is single-threaded; the child only runs the
        // entrypoint and leaves through _exit().
        match unsafe { unistd::fork() } {
            Err(e) => {
                error!("{}: fork failed: {}", self.name, e);
                self.state = TaskState::Dead;
                Err(SupervisorError::Fork(e))
            }
            Ok(ForkResult::Child) => {
                let status = run_child(&self.name, &self.credentials, self.umask, entry);
                // SAFETY: skips atexit handlers and stdio buffers inherited
                // from the parent.
                unsafe { nix::libc::_exit(status) }
            }
            Ok(ForkResult::Parent { child }) => {
                debug!("{}: child {} started", self.name, child);
                self.pid = Some(child);
                self.state = TaskState::Running;
                Ok(StartOutcome::Started(child))
            }
        }
    }

    /// Check on the child without blocking.
    pub fn poll(&mut self) -> Result<PollOutcome> {
        if !matches!(self.state, TaskState::Running | TaskState::Stopping) {
            return Ok(PollOutcome::NotApplicable);
        }
        let Some(pid) = self.pid else {
            self.state = TaskState::Dead;
            return Ok(PollOutcome::Reaped(self.state));
        };

        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Err(source) => {
                // already reaped, or something is badly wrong
                warn!("{}: waitpid({}): {}", self.name, pid, source);
                self.state = TaskState::Dead;
                self.pid = None;
                Err(SupervisorError::Wait { pid, source })
            }
            Ok(WaitStatus::StillAlive)
            | Ok(WaitStatus::Stopped(..))
            | Ok(WaitStatus::Continued(..)) => Ok(PollOutcome::StillRunning),
            Ok(WaitStatus::Exited(reaped, code)) if reaped == pid => {
                self.state = if code == 0 {
                    TaskState::Stopped
                } else {
                    TaskState::Failed
                };
                debug!("{}: child {} exited with {}", self.name, pid, code);
                self.pid = None;
                Ok(PollOutcome::Reaped(self.state))
            }
            Ok(WaitStatus::Signaled(reaped, signal, _)) if reaped == pid => {
                // only a signal we delivered is a successful stop
                let requested = self.delivered.contains(signal);
                self.state = if self.state == TaskState::Stopping && requested {
                    TaskState::Stopped
                } else {
                    TaskState::Dead
                };
                debug!("{}: child {} killed by {}", self.name, pid, signal);
                self.pid = None;
                Ok(PollOutcome::Reaped(self.state))
            }
            Ok(other) => {
                error!("{}: waitpid({}) returned {:?}", self.name, pid, other);
                Err(SupervisorError::UnexpectedWait {
                    pid,
                    reaped: other.pid().unwrap_or(pid),
                })
            }
        }
    }

    /// Terminate the child, escalating through `plan`.
    ///
    /// Each round checks whether the child is gone, then delivers the
    /// round's signal followed by SIGCONT and sleeps for the round's grace.
    /// Succeeds only if the child ends up `Stopped`.
    pub fn stop(&mut self, plan: &EscalationPlan) -> Result<()> {
        debug!("{}: stop", self.name);

        if self.state != TaskState::Running {
            return Err(SupervisorError::InvalidState(self.state));
        }
        let Some(pid) = self.pid else {
            self.state = TaskState::Dead;
            return Err(SupervisorError::InvalidState(self.state));
        };
        self.state = TaskState::Stopping;
        self.delivered = SigSet::empty();

        for step in plan.steps() {
            self.poll_logged();
            if self.state != TaskState::Stopping {
                break;
            }
            if let Some(signal) = step.signal {
                if kill(pid, signal).is_ok() {
                    self.delivered.add(signal);
                }
            }
            let _ = kill(pid, Signal::SIGCONT);
            thread::sleep(step.grace);
        }
        if self.state == TaskState::Stopping {
            self.poll_logged();
        }

        if self.state == TaskState::Stopping {
            warn!("{}: gave up waiting for child {}", self.name, pid);
            self.state = TaskState::Dead;
        }
        self.pid = None;

        match self.state {
            TaskState::Stopped => Ok(()),
            state => Err(SupervisorError::StopFailed { pid, state }),
        }
    }

    fn poll_logged(&mut self) {
        if let Err(e) = self.poll() {
            debug!("{}: {}", self.name, e);
        }
    }
}

/// Body of the forked child. Returns the exit status.
fn run_child<F, E>(name: &str, credentials: &Credentials, mask: Mode, entry: F) -> i32
where
    F: FnOnce() -> std::result::Result<(), E>,
    E: Display,
{
    debug!("{}: child running as {}", name, credentials);

    if !credentials.is_current() {
        if let Err(e) = credentials.assume() {
            warn!("{}: failed to switch to {}: {}", name, credentials, e);
            return 1;
        }
    }
    if unistd::geteuid().is_root() {
        warn!("{}: running with uid 0", name);
    }
    if unistd::getegid().as_raw() == 0 {
        warn!("{}: running with gid 0", name);
    }

    reset_signal_handling();
    umask(mask);
    close_inherited_fds();

    match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            warn!("{}: {}", name, e);
            1
        }
        Err(_) => 1,
    }
}

/// Undo handlers and masks inherited from the supervisor so the
/// escalation signals have their default effect.
fn reset_signal_handling() {
    for sig in [
        Signal::SIGTERM,
        Signal::SIGINT,
        Signal::SIGHUP,
        Signal::SIGQUIT,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
    ] {
        // SAFETY: restores the default disposition, no handler code runs.
        let _ = unsafe { signal(sig, SigHandler::SigDfl) };
    }
    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
}

fn close_inherited_fds() {
    let limit = getrlimit(Resource::RLIMIT_NOFILE)
        .map(|(soft, _)| soft)
        .unwrap_or(1024)
        .min(MAX_FD_SWEEP);
    for fd in 3..limit as RawFd {
        let _ = unistd::close(fd);
    }
}
