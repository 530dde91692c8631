//! Common test utilities for acoustics_daq integration tests
//!
//! This module provides reusable test helpers for:
//! - Timing assertions with appropriate tolerances
//! - Building controllers and schedulers over the mock rig

#![allow(dead_code)] // Not every test binary uses every helper

use acoustics_daq::config::JigDefinition;
use acoustics_daq::error_recovery::RecoveryPolicy;
use acoustics_daq::experiment::Controller;
use acoustics_daq::gateway::MockGateway;
use acoustics_daq::scheduler::{Scheduler, SchedulerHandle, SchedulerTiming};
use acoustics_daq::sequencer::PulseSequencer;
use acoustics_daq::storage::ResultStore;
use std::sync::Arc;
use std::time::Duration;

/// Tolerance levels for real-time timing assertions.
///
/// Use these when `start_paused = true` is not appropriate, e.g. when the
/// SQLite store pushes work onto the blocking pool.
#[derive(Debug, Clone, Copy)]
pub enum TimingTolerance {
    /// Exact match - only for simulated time with `start_paused = true`
    Exact,
    /// 20% tolerance - default for local development
    Normal,
    /// 50% tolerance - for CI environments with variable load
    Relaxed,
}

impl TimingTolerance {
    pub fn factor(&self) -> f64 {
        match self {
            TimingTolerance::Exact => 0.0,
            TimingTolerance::Normal => 0.20,
            TimingTolerance::Relaxed => 0.50,
        }
    }
}

/// Assert that a duration is within tolerance of an expected value.
///
/// # Panics
/// Panics if the actual duration is outside the tolerance range.
pub fn assert_duration_near(
    actual: Duration,
    expected: Duration,
    tolerance: TimingTolerance,
    context: &str,
) {
    let factor = tolerance.factor();
    let min = expected.mul_f64(1.0 - factor);
    let max = expected.mul_f64(1.0 + factor);

    assert!(
        actual >= min && actual <= max,
        "{}: expected {:?} +/-{:.0}%, got {:?} (acceptable range: {:?} to {:?})",
        context,
        expected,
        factor * 100.0,
        actual,
        min,
        max
    );
}

/// `Relaxed` in CI, `Normal` otherwise.
pub fn env_timing_tolerance() -> TimingTolerance {
    if std::env::var("CI").is_ok() {
        TimingTolerance::Relaxed
    } else {
        TimingTolerance::Normal
    }
}

/// Sequencer over the mock rig with the production settle time.
pub fn mock_sequencer(gateway: &MockGateway) -> Arc<PulseSequencer> {
    Arc::new(PulseSequencer::new(Arc::new(gateway.clone())).with_switch_settle(Duration::from_millis(50)))
}

pub fn mock_controller(
    gateway: &MockGateway,
    store: Arc<dyn ResultStore>,
    policy: RecoveryPolicy,
) -> Controller {
    Controller::new(mock_sequencer(gateway), store).with_policy(policy)
}

/// Jigs `jig0..jigN` on switches `0..N` of module 0.
pub fn jig_definitions(count: u16) -> Vec<JigDefinition> {
    (0..count)
        .map(|switch| JigDefinition {
            name: format!("jig{}", switch),
            module: 0,
            switch,
        })
        .collect()
}

pub fn mock_scheduler(
    gateway: &MockGateway,
    store: Arc<dyn ResultStore>,
    jigs: u16,
    timing: SchedulerTiming,
    policy: RecoveryPolicy,
) -> SchedulerHandle {
    Scheduler::spawn(&jig_definitions(jigs), mock_sequencer(gateway), store, timing, policy)
}

/// Recovery policy with a short delay for tests.
pub fn fast_recovery(delay: Duration) -> RecoveryPolicy {
    RecoveryPolicy {
        recovery_delay: delay,
        ..RecoveryPolicy::default()
    }
}
