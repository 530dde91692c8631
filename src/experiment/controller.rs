//! Single-experiment controller.
//!
//! Owns one experiment at a time and the worker task that drives it. The
//! worker waits one interval, runs a pulse cycle, persists the waveform and
//! repeats until the duration is spent or `stop` is called. A failed cycle
//! sets the status to `error`, backs off, and carries on.
//!
//! Every `start` bumps a generation counter and issues a fresh
//! [`Cancellation`]. A worker only writes state while its generation is
//! current, so a slow worker from an earlier run can never overwrite the
//! status of a newer one.

use super::cancel::{CancelSignal, Cancellation};
use super::settings::ExperimentSettings;
use super::status::Status;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{FailureKind, RecoveryAction, RecoveryPolicy};
use crate::instrument::PulseParameters;
use crate::sequencer::PulseSequencer;
use crate::storage::{last_folder_update, ResultHandle, ResultStore, RowId, Waveform, WaveformRecord};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Default)]
struct RunState {
    status: Status,
    generation: u64,
    started_at: Option<Instant>,
    settings: Option<ExperimentSettings>,
    run_id: Option<Uuid>,
    cancellation: Option<Cancellation>,
    task: Option<JoinHandle<()>>,
    handle: Option<Arc<dyn ResultHandle>>,
    last_error: Option<String>,
    pulse_count: u64,
}

impl RunState {
    fn is_active(&self) -> bool {
        self.cancellation.is_some() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// Drives one experiment at a time on a dedicated worker task.
pub struct Controller {
    sequencer: Arc<PulseSequencer>,
    store: Arc<dyn ResultStore>,
    policy: RecoveryPolicy,
    data_dir: Option<PathBuf>,
    state: Arc<Mutex<RunState>>,
    starting: tokio::sync::Mutex<()>,
}

impl Controller {
    /// Idle controller over one rig and one store.
    pub fn new(sequencer: Arc<PulseSequencer>, store: Arc<dyn ResultStore>) -> Self {
        Self {
            sequencer,
            store,
            policy: RecoveryPolicy::default(),
            data_dir: None,
            state: Arc::new(Mutex::new(RunState::default())),
            starting: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the default recovery policy.
    pub fn with_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Directory consulted by [`last_updated`](Self::last_updated) when this
    /// process has not written anything yet.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Validate, open the result store and spawn the worker.
    ///
    /// Returns as soon as the worker is spawned. Rejected with
    /// [`DaqError::AlreadyRunning`] while a previous run is still active,
    /// including while it is backing off in `error`.
    pub async fn start(
        &self,
        settings: ExperimentSettings,
        params: PulseParameters,
    ) -> AppResult<Status> {
        settings.validate()?;
        let _starting = self.starting.lock().await;

        if let Some(current) = self.active_identifier() {
            return Err(DaqError::AlreadyRunning(current));
        }

        let handle = self.store.open(&settings.identifier).await?;

        let (cancellation, signal) = Cancellation::new();
        let run_id = Uuid::new_v4();
        let started_at = Instant::now();

        let mut state = self.state.lock();
        state.generation += 1;
        let generation = state.generation;
        let previous = state.task.take();

        state.status = Status::Running;
        state.started_at = Some(started_at);
        state.settings = Some(settings.clone());
        state.run_id = Some(run_id);
        state.cancellation = Some(cancellation);
        state.handle = Some(handle.clone());
        state.last_error = None;
        state.pulse_count = 0;

        let worker = Worker {
            state: self.state.clone(),
            generation,
            sequencer: self.sequencer.clone(),
            handle,
            policy: self.policy.clone(),
            cancel: signal,
            settings: settings.clone(),
            params,
            run_id,
            started_at,
            started_wall: Utc::now(),
        };
        let span = info_span!("experiment", experiment = %settings.identifier, run_id = %run_id);
        state.task = Some(tokio::spawn(worker.run(previous).instrument(span)));
        drop(state);

        info!(
            experiment = %settings.identifier,
            run_id = %run_id,
            duration_s = settings.duration().as_secs_f64(),
            interval_s = settings.interval_s,
            "Experiment started"
        );
        Ok(Status::Running)
    }

    /// Cancel the current run, if any, and set the status to `stopped`.
    ///
    /// Safe to call repeatedly and when nothing is running. A cycle already
    /// in flight is allowed to finish.
    pub fn stop(&self) -> Status {
        let mut state = self.state.lock();
        state.generation += 1;
        if let Some(cancellation) = state.cancellation.take() {
            cancellation.cancel();
            info!(
                experiment = state.settings.as_ref().map_or("", |s| s.identifier.as_str()),
                "Experiment stopped"
            );
        }
        state.status = Status::Stopped;
        state.status
    }

    /// Current lifecycle state.
    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    /// Time since the last start, `None` if never started.
    pub fn elapsed_time(&self) -> Option<Duration> {
        self.state.lock().started_at.map(|t| t.elapsed())
    }

    /// Row key (UNIX seconds) of the newest persisted record.
    pub fn last_updated(&self) -> Option<f64> {
        let written = self
            .state
            .lock()
            .handle
            .as_ref()
            .and_then(|h| h.last_written());
        written.or_else(|| self.data_dir.as_deref().and_then(last_folder_update))
    }

    /// Message of the most recent failed cycle, kept until the next start.
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    /// Successful cycles in the current (or last) run.
    pub fn pulse_count(&self) -> u64 {
        self.state.lock().pulse_count
    }

    /// Identity of the current (or last) run.
    pub fn run_id(&self) -> Option<Uuid> {
        self.state.lock().run_id
    }

    /// Settings the current (or last) run was started with.
    pub fn settings(&self) -> Option<ExperimentSettings> {
        self.state.lock().settings.clone()
    }

    /// One calibration cycle outside the timed loop. Nothing is persisted.
    pub async fn pulse(&self, params: &PulseParameters) -> AppResult<Waveform> {
        Ok(self.sequencer.pulse(params).await?)
    }

    /// Stop and wait up to `timeout` for the worker to exit.
    ///
    /// A worker still stuck in a gateway call after `timeout` is aborted.
    pub async fn shutdown(&self, timeout: Duration) {
        self.stop();
        let task = self.state.lock().task.take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(timeout, task).await.is_err() {
                warn!(timeout_ms = timeout.as_millis() as u64, "Experiment worker did not exit, aborting");
                abort.abort();
            }
        }
    }

    fn active_identifier(&self) -> Option<String> {
        let state = self.state.lock();
        if !state.is_active() {
            return None;
        }
        Some(
            state
                .settings
                .as_ref()
                .map(|s| s.identifier.clone())
                .unwrap_or_default(),
        )
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Some(cancellation) = self.state.lock().cancellation.take() {
            cancellation.cancel();
        }
    }
}

struct Worker {
    state: Arc<Mutex<RunState>>,
    generation: u64,
    sequencer: Arc<PulseSequencer>,
    handle: Arc<dyn ResultHandle>,
    policy: RecoveryPolicy,
    cancel: CancelSignal,
    settings: ExperimentSettings,
    params: PulseParameters,
    run_id: Uuid,
    started_at: Instant,
    started_wall: DateTime<Utc>,
}

impl Worker {
    async fn run(mut self, previous: Option<JoinHandle<()>>) {
        // Cycles never overlap, even across runs
        if let Some(previous) = previous {
            let _ = previous.await;
        }

        let interval = self.settings.interval();
        let Some(deadline) = self.started_at.checked_add(self.settings.duration()) else {
            error!(duration_h = self.settings.duration_h, "Experiment end is out of clock range");
            self.update(|state| {
                state.status = Status::Error;
                state.last_error = Some("experiment end is out of clock range".to_string());
            });
            return;
        };
        let mut next = self.started_at.checked_add(interval).unwrap_or(deadline);

        loop {
            if next > deadline {
                if !self.wait_until(deadline).await {
                    self.update(|state| state.status = Status::Stopped);
                    info!(pulses = self.pulse_count(), "Experiment duration reached");
                }
                return;
            }
            if self.wait_until(next).await || self.cancel.is_cancelled() {
                return;
            }

            match self.cycle().await {
                Ok(row_id) => {
                    let was_error = self.update(|state| {
                        let was_error = state.status == Status::Error;
                        state.status = Status::Running;
                        state.pulse_count += 1;
                        was_error
                    });
                    if was_error == Some(true) {
                        info!("Experiment recovered");
                    }
                    info!(row_id, "Pulse completed");
                }
                Err((kind, e)) => {
                    error!(error = %e, ?kind, "Pulse cycle failed");
                    let message = e.to_string();
                    self.update(|state| {
                        state.status = Status::Error;
                        state.last_error = Some(message);
                    });
                    match self.policy.action_for(kind) {
                        RecoveryAction::Abort => {
                            error!("Store failure policy is 'stop', ending experiment");
                            return;
                        }
                        RecoveryAction::Retry => {
                            if self.policy.backoff(&mut self.cancel).await {
                                return;
                            }
                        }
                    }
                }
            }

            let now = Instant::now();
            next = next.checked_add(interval).unwrap_or(deadline);
            if next <= now {
                next = now.checked_add(interval).unwrap_or(deadline);
            }
        }
    }

    /// Returns `true` if cancelled before `target`.
    async fn wait_until(&mut self, target: Instant) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => true,
            _ = sleep_until(target) => false,
        }
    }

    async fn cycle(&self) -> Result<RowId, (FailureKind, DaqError)> {
        let waveform = self
            .sequencer
            .pulse(&self.params)
            .await
            .map_err(|e| (FailureKind::Acquisition, e.into()))?;

        let record = WaveformRecord::new(waveform, Some(self.params.clone())).with_metadata(json!({
            "run_id": self.run_id.to_string(),
            "experiment": self.settings.identifier,
            "started_at": self.started_wall.to_rfc3339(),
            "interval_s": self.settings.interval_s,
        }));
        self.handle
            .write(record)
            .await
            .map_err(|e| (FailureKind::Persistence, e.into()))
    }

    /// Apply `f` only while this worker's run is current.
    fn update<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> Option<R> {
        let mut state = self.state.lock();
        (state.generation == self.generation).then(|| f(&mut state))
    }

    fn pulse_count(&self) -> u64 {
        self.state.lock().pulse_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockGateway;
    use crate::storage::MemoryStore;
    use tracing_test::traced_test;

    fn controller(gateway: &MockGateway, store: &MemoryStore) -> Controller {
        let sequencer = PulseSequencer::new(Arc::new(gateway.clone()));
        Controller::new(Arc::new(sequencer), Arc::new(store.clone()))
    }

    #[tokio::test]
    async fn test_invalid_settings_spawn_nothing() {
        let store = MemoryStore::new();
        let controller = controller(&MockGateway::new(), &store);

        let result = controller
            .start(ExperimentSettings::new(-1.0, 1.0, "bad"), PulseParameters::default())
            .await;

        assert!(matches!(result, Err(DaqError::InvalidSettings(_))));
        assert_eq!(controller.status(), Status::NotStarted);
        assert_eq!(store.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_pulse() {
        let gateway = MockGateway::new();
        let store = MemoryStore::new();
        let controller = controller(&gateway, &store);

        controller
            .start(ExperimentSettings::new(1.0, 5.0, "early"), PulseParameters::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(controller.stop(), Status::Stopped);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(gateway.acquisition_count(), 0);
        assert_eq!(store.record_count("early"), 0);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_failed_cycle_is_logged_then_recovery() {
        let gateway = MockGateway::new();
        let store = MemoryStore::new();
        let controller = controller(&gateway, &store).with_policy(RecoveryPolicy {
            recovery_delay: Duration::from_secs(1),
            ..RecoveryPolicy::default()
        });
        gateway.fail_next_acquisitions(1);

        controller
            .start(ExperimentSettings::new(1.0, 1.0, "logged"), PulseParameters::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        controller.stop();

        assert!(logs_contain("Pulse cycle failed"));
        assert!(logs_contain("Experiment recovered"));
    }
}
