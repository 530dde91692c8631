//! Control-plane handle onto the scheduler.
//!
//! Start, stop and status calls only edit the shared jig table and return
//! immediately; pulses are always executed by the scheduler task.

use super::jig::JigSnapshot;
use super::{JigRequest, JigTable, SchedulerCommand};
use crate::error::{AppResult, DaqError};
use crate::experiment::{Cancellation, Status};
use crate::instrument::PulseParameters;
use crate::storage::{ResultStore, Waveform};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

struct Lifecycle {
    cancellation: Mutex<Option<Cancellation>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle; the scheduler task ends when the last clone is dropped
/// or [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct SchedulerHandle {
    jigs: JigTable,
    store: Arc<dyn ResultStore>,
    commands: mpsc::Sender<SchedulerCommand>,
    wake: Arc<Notify>,
    lifecycle: Arc<Lifecycle>,
    starting: Arc<tokio::sync::Mutex<()>>,
}

impl SchedulerHandle {
    pub(crate) fn new(
        jigs: JigTable,
        store: Arc<dyn ResultStore>,
        commands: mpsc::Sender<SchedulerCommand>,
        wake: Arc<Notify>,
        cancellation: Cancellation,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            jigs,
            store,
            commands,
            wake,
            lifecycle: Arc::new(Lifecycle {
                cancellation: Mutex::new(Some(cancellation)),
                task: Mutex::new(Some(task)),
            }),
            starting: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Jig names in service order.
    pub fn jig_names(&self) -> Vec<String> {
        self.jigs.lock().iter().map(|jig| jig.name.clone()).collect()
    }

    /// Validate, open the jig's result store and mark it running.
    pub async fn start_jig(&self, name: &str, request: JigRequest) -> AppResult<Status> {
        request.settings.validate()?;
        if let Some(properties) = &request.pulser {
            properties.validate().map_err(DaqError::InvalidSettings)?;
        }
        let _starting = self.starting.lock().await;

        self.with_jig(name, |jig| {
            if jig.is_active() {
                Err(DaqError::AlreadyRunning(name.to_string()))
            } else {
                Ok(())
            }
        })??;

        let handle = self.store.open(&request.settings.identifier).await?;
        let run_id = Uuid::new_v4();
        let identifier = request.settings.identifier.clone();

        let status = self.with_jig(name, |jig| {
            jig.generation += 1;
            jig.status = Status::Running;
            jig.started_at = Some(Instant::now());
            jig.started_wall = Some(Utc::now());
            jig.request = Some(request);
            jig.handle = Some(handle);
            jig.run_id = Some(run_id);
            jig.retry_at = None;
            jig.last_error = None;
            jig.pulse_count = 0;
            jig.status
        })?;
        self.wake.notify_one();

        info!(jig = name, experiment = %identifier, run_id = %run_id, "Jig started");
        Ok(status)
    }

    /// Stop a jig. Idempotent; a cycle already in flight still completes.
    pub fn stop_jig(&self, name: &str) -> AppResult<Status> {
        self.with_jig(name, |jig| {
            if jig.is_active() {
                info!(jig = name, pulses = jig.pulse_count, "Jig stopped");
            }
            jig.generation += 1;
            jig.status = Status::Stopped;
            jig.retry_at = None;
            jig.status
        })
    }

    /// Lifecycle state of `name`.
    pub fn status(&self, name: &str) -> AppResult<Status> {
        self.with_jig(name, |jig| jig.status)
    }

    /// Time since the jig was last started.
    pub fn elapsed(&self, name: &str) -> AppResult<Option<Duration>> {
        self.with_jig(name, |jig| jig.started_at.map(|t| t.elapsed()))
    }

    /// Row key of the jig's newest record, `None` before its first write.
    pub fn last_updated(&self, name: &str) -> AppResult<Option<f64>> {
        self.with_jig(name, |jig| jig.handle.as_ref().and_then(|h| h.last_written()))
    }

    /// Most recent failure on this jig.
    pub fn last_error(&self, name: &str) -> AppResult<Option<String>> {
        self.with_jig(name, |jig| jig.last_error.clone())
    }

    /// Successful turns in the jig's current (or last) run.
    pub fn pulse_count(&self, name: &str) -> AppResult<u64> {
        self.with_jig(name, |jig| jig.pulse_count)
    }

    /// Everything the API reports about one jig.
    pub fn snapshot(&self, name: &str) -> AppResult<JigSnapshot> {
        self.with_jig(name, |jig| jig.snapshot())
    }

    /// Snapshots of every jig, in configuration order.
    pub fn snapshots(&self) -> Vec<JigSnapshot> {
        self.jigs.lock().iter().map(|jig| jig.snapshot()).collect()
    }

    /// Calibration pulse on a jig's channel, run by the scheduler between
    /// turns. Nothing is persisted.
    pub async fn pulse_jig(&self, name: &str, params: PulseParameters) -> AppResult<Waveform> {
        self.with_jig(name, |_| ())?;
        let (command, response) = SchedulerCommand::pulse(name.to_string(), params);
        self.commands
            .send(command)
            .await
            .map_err(|_| DaqError::SchedulerUnavailable)?;
        response.await.map_err(|_| DaqError::SchedulerUnavailable)?
    }

    /// Stop every jig and the scheduler task, waiting up to `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        for name in self.jig_names() {
            let _ = self.stop_jig(&name);
        }
        let cancellation = self.lifecycle.cancellation.lock().take();
        if let Some(cancellation) = cancellation {
            cancellation.cancel();
        }
        let task = self.lifecycle.task.lock().take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(timeout, task).await.is_err() {
                warn!(timeout_ms = timeout.as_millis() as u64, "Scheduler did not exit, aborting");
                abort.abort();
            }
        }
    }

    /// Whether the scheduler task is still alive.
    pub fn is_running(&self) -> bool {
        self.lifecycle
            .task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn with_jig<R>(&self, name: &str, f: impl FnOnce(&mut super::jig::Jig) -> R) -> AppResult<R> {
        let mut jigs = self.jigs.lock();
        let jig = jigs
            .iter_mut()
            .find(|jig| jig.name == name)
            .ok_or_else(|| DaqError::UnknownJig(name.to_string()))?;
        Ok(f(jig))
    }
}
