use std::time::Duration;

use nix::sys::signal::Signal;

/// One round of the termination protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationStep {
    /// Signal to deliver, or `None` to only resume a suspended child.
    pub signal: Option<Signal>,
    /// How long to wait before checking on the child again.
    pub grace: Duration,
}

/// Ordered signal rounds used to stop a child.
///
/// Every round is followed by SIGCONT so a suspended child gets to act on
/// the pending signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationPlan {
    steps: Vec<EscalationStep>,
}

impl EscalationPlan {
    pub fn new(steps: Vec<EscalationStep>) -> Self {
        Self { steps }
    }

    /// Continue, then SIGTERM, then SIGKILL, with the same grace after each.
    pub fn standard(grace: Duration) -> Self {
        Self::new(vec![
            EscalationStep { signal: None, grace },
            EscalationStep {
                signal: Some(Signal::SIGTERM),
                grace,
            },
            EscalationStep {
                signal: Some(Signal::SIGKILL),
                grace,
            },
        ])
    }

    pub fn steps(&self) -> &[EscalationStep] {
        &self.steps
    }

    /// Upper bound on the time spent sleeping while stopping one child.
    pub fn total_grace(&self) -> Duration {
        self.steps.iter().map(|s| s.grace).sum()
    }
}

impl Default for EscalationPlan {
    fn default() -> Self {
        Self::standard(Duration::from_millis(10))
    }
}
