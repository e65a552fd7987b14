use std::path::Path;

use nix::sys::stat::Mode;
use nix::unistd::{Gid, Pid, Uid};
use tracing::debug;

use super::copier::Copier;
use super::escalation::EscalationPlan;
use super::process::{PollOutcome, ProcessController, StartOutcome};
use super::registry::Indexed;
use super::scheduler::RunGauge;
use super::TaskState;
use crate::error::Result;
use crate::utils::bounded_path::BoundedPath;
use crate::utils::credentials::Credentials;

/// Copy one file as the user who owns it.
#[derive(Debug)]
pub struct CopyTask {
    source: BoundedPath,
    destination: BoundedPath,
    index: usize,
    process: ProcessController,
}

impl CopyTask {
    /// Prepare a copy of `source` to `destination`.
    ///
    /// The child will run as the owner of `source` as reported by lstat.
    pub fn new(source: BoundedPath, destination: BoundedPath) -> Result<Self> {
        debug!("{} -> {}", source, destination);

        let credentials = Credentials::of_path(source.as_path())?;
        let process = ProcessController::new(format!("copy {source} to {destination}"), credentials)
            .with_umask(Mode::from_bits_truncate(0o007));

        Ok(Self {
            source,
            destination,
            index: usize::MAX,
            process,
        })
    }

    pub fn source(&self) -> &Path {
        self.source.as_path()
    }

    pub fn destination(&self) -> &Path {
        self.destination.as_path()
    }

    pub fn uid(&self) -> Uid {
        self.process.credentials().uid
    }

    pub fn gid(&self) -> Gid {
        self.process.credentials().gid
    }

    pub fn state(&self) -> TaskState {
        self.process.state()
    }

    pub fn pid(&self) -> Option<Pid> {
        self.process.pid()
    }

    /// Whether this task copies `source` and / or to `destination`.
    /// `None` matches anything.
    pub fn matches(&self, source: Option<&Path>, destination: Option<&Path>) -> bool {
        source.map_or(true, |s| self.source == *s)
            && destination.map_or(true, |d| self.destination == *d)
    }

    /// Fork the copier child.
    pub fn start(&mut self, gauge: &mut RunGauge, copier: &dyn Copier) -> Result<StartOutcome> {
        debug!("start {} -> {}", self.source, self.destination);

        let outcome = self
            .process
            .start(|| copier.copy(self.source.as_path(), self.destination.as_path()))?;
        if let StartOutcome::Started(_) = outcome {
            gauge.acquire();
        }
        Ok(outcome)
    }

    pub fn poll(&mut self, gauge: &mut RunGauge) -> Result<PollOutcome> {
        let before = self.process.state();
        let result = self.process.poll();
        if before == TaskState::Running && self.process.state() != TaskState::Running {
            gauge.release();
        }
        result
    }

    /// Stop the copier child, escalating through `plan`.
    pub fn stop(&mut self, gauge: &mut RunGauge, plan: &EscalationPlan) -> Result<()> {
        debug!("stop {} -> {}", self.source, self.destination);

        if self.process.state() == TaskState::Running {
            gauge.release();
        }
        self.process.stop(plan)
    }
}

impl Indexed for CopyTask {
    fn index(&self) -> usize {
        self.index
    }

    fn set_index(&mut self, index: usize) {
        self.index = index;
    }
}
