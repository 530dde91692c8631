//! Recovery strategies for failed pulse cycles.
//
// A failed cycle never halts an experiment on its own. The loop marks the
// experiment as errored, backs off for a fixed delay, and tries again. Store
// outages are the one case where operators may prefer to stop instead; that
// choice is configured per deployment.

use crate::experiment::CancelSignal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

/// What to do when the result store rejects a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Treat like any transient failure: error status, back off, retry.
    #[default]
    Retry,
    /// End the experiment loop, leaving the status at `error`.
    Stop,
}

/// Failure categories the loop distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Gateway timeout, malformed waveform, busy instrument.
    Acquisition,
    /// Result store unavailable or write rejected.
    Persistence,
}

/// Outcome of applying the policy to one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Back off and continue the loop.
    Retry,
    /// Leave the loop.
    Abort,
}

/// Policy applied by the controller and scheduler after a failed cycle.
#[derive(Clone, Debug)]
pub struct RecoveryPolicy {
    /// Fixed delay before the next attempt.
    pub recovery_delay: Duration,
    /// What a failed write does to the run.
    pub on_store_failure: StoreFailurePolicy,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            recovery_delay: Duration::from_secs(10),
            on_store_failure: StoreFailurePolicy::Retry,
        }
    }
}

impl RecoveryPolicy {
    /// Decide how to continue after a failure of the given kind.
    pub fn action_for(&self, kind: FailureKind) -> RecoveryAction {
        match (kind, self.on_store_failure) {
            (FailureKind::Persistence, StoreFailurePolicy::Stop) => RecoveryAction::Abort,
            _ => RecoveryAction::Retry,
        }
    }

    /// Sleep for the recovery delay, waking early on cancellation.
    ///
    /// Returns `true` if the wait was cut short by cancellation.
    pub async fn backoff(&self, cancel: &mut CancelSignal) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = sleep(self.recovery_delay) => false,
        }
    }
}
