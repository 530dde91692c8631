//! Fair-share scheduler for rigs shared by several jigs.
//!
//! One scheduler task owns the sequencer. Each round it
//!
//! 1. collects the jigs that are due (running, or errored with an elapsed
//!    retry time), retiring jigs whose duration has run out,
//! 2. idles for `idle_poll` if none are,
//! 3. otherwise serves each due jig once, in configuration order, sleeping
//!    `slice_baseline / (active + 1)` after every turn.
//!
//! The handle never touches the gateway. Calibration pulses are sent to the
//! task as [`SchedulerCommand`]s and run between turns, so there is only ever
//! one gateway call outstanding.

pub mod handle;
pub mod jig;

pub use handle::SchedulerHandle;
pub use jig::{JigRequest, JigSnapshot};

use crate::config::{AppConfig, JigDefinition};
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{FailureKind, RecoveryAction, RecoveryPolicy};
use crate::experiment::{CancelSignal, Cancellation, Status};
use crate::instrument::{MuxChannel, PulseParameters, PulserProperties};
use crate::sequencer::{ChannelTarget, PulseSequencer};
use crate::storage::{ResultHandle, ResultStore, RowId, Waveform, WaveformRecord};
use jig::Jig;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the command queue.
const COMMAND_QUEUE: usize = 16;

/// Time granted after each turn when `active` jigs are due.
pub fn fair_share_slice(baseline: Duration, active: usize) -> Duration {
    baseline / (active as u32 + 1)
}

/// Scheduler pacing.
#[derive(Debug, Clone)]
pub struct SchedulerTiming {
    /// Slice with one due jig; see [`fair_share_slice`]
    pub slice_baseline: Duration,
    /// Re-check period while nothing is due
    pub idle_poll: Duration,
}

impl Default for SchedulerTiming {
    fn default() -> Self {
        Self {
            slice_baseline: Duration::from_secs(10),
            idle_poll: Duration::from_millis(500),
        }
    }
}

impl SchedulerTiming {
    /// Pacing from the `timing` section.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            slice_baseline: config.timing.slice_baseline(),
            idle_poll: config.timing.idle_poll(),
        }
    }
}

/// Requests served by the scheduler task between turns.
#[derive(Debug)]
pub enum SchedulerCommand {
    /// One unrecorded calibration cycle on a jig's channel
    Pulse {
        /// Target jig name
        jig: String,
        /// Acquisition parameters
        params: PulseParameters,
        /// Receives the waveform or the failure
        response: oneshot::Sender<AppResult<Waveform>>,
    },
}

impl SchedulerCommand {
    /// Helper to create a Pulse command
    pub fn pulse(jig: String, params: PulseParameters) -> (Self, oneshot::Receiver<AppResult<Waveform>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Pulse {
                jig,
                params,
                response: tx,
            },
            rx,
        )
    }
}

pub(crate) type JigTable = Arc<Mutex<Vec<Jig>>>;

/// Everything needed to run one turn, copied out of the table.
struct Turn {
    generation: u64,
    channel: MuxChannel,
    params: PulseParameters,
    pulser: Option<PulserProperties>,
    handle: Arc<dyn ResultHandle>,
    experiment: String,
    run_id: Option<Uuid>,
    interval_s: f64,
}

/// The task that owns the rig in multi mode.
///
/// Built with [`Scheduler::spawn`] and driven through the returned
/// [`SchedulerHandle`]. Only this task ever calls the sequencer.
pub struct Scheduler {
    jigs: JigTable,
    sequencer: Arc<PulseSequencer>,
    timing: SchedulerTiming,
    policy: RecoveryPolicy,
    commands: mpsc::Receiver<SchedulerCommand>,
    wake: Arc<Notify>,
    shutdown: CancelSignal,
}

impl Scheduler {
    /// Build the jig table from `definitions` and spawn the scheduler task.
    pub fn spawn(
        definitions: &[JigDefinition],
        sequencer: Arc<PulseSequencer>,
        store: Arc<dyn ResultStore>,
        timing: SchedulerTiming,
        policy: RecoveryPolicy,
    ) -> SchedulerHandle {
        let jigs: JigTable = Arc::new(Mutex::new(definitions.iter().map(Jig::new).collect()));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let wake = Arc::new(Notify::new());
        let (cancellation, shutdown) = Cancellation::new();

        let scheduler = Scheduler {
            jigs: jigs.clone(),
            sequencer,
            timing,
            policy,
            commands: command_rx,
            wake: wake.clone(),
            shutdown,
        };
        info!(jigs = definitions.len(), "Scheduler started");
        let task = tokio::spawn(scheduler.run());

        SchedulerHandle::new(jigs, store, command_tx, wake, cancellation, task)
    }

    async fn run(mut self) {
        'rounds: loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            while let Ok(command) = self.commands.try_recv() {
                self.handle_command(command).await;
            }

            let due = self.due_jigs(Instant::now());
            if due.is_empty() {
                if !self.idle().await {
                    break;
                }
                continue;
            }

            let slice = fair_share_slice(self.timing.slice_baseline, due.len());
            debug!(active = due.len(), slice_ms = slice.as_millis() as u64, "Scheduler round");
            for name in due {
                if self.shutdown.is_cancelled() {
                    break 'rounds;
                }
                // Skipped jigs leave no gap on the rig
                let Some(turn) = self.take_turn(&name, Instant::now()) else {
                    continue;
                };
                self.serve(&name, turn).await;
                if !self.pause(slice).await {
                    break 'rounds;
                }
            }
        }
        info!("Scheduler stopped");
    }

    /// Names of jigs due now, in configuration order.
    fn due_jigs(&self, now: Instant) -> Vec<String> {
        let mut jigs = self.jigs.lock();
        for jig in jigs.iter_mut() {
            jig.retire_if_expired(now);
        }
        jigs.iter()
            .filter(|jig| jig.is_due(now))
            .map(|jig| jig.name.clone())
            .collect()
    }

    /// Re-check a jig right before its turn. It may have been stopped or
    /// expired while earlier jigs were served.
    fn take_turn(&self, name: &str, now: Instant) -> Option<Turn> {
        let mut jigs = self.jigs.lock();
        let jig = jigs.iter_mut().find(|jig| jig.name == name)?;
        if jig.retire_if_expired(now) || !jig.is_due(now) {
            return None;
        }
        let request = jig.request.as_ref()?;
        Some(Turn {
            generation: jig.generation,
            channel: jig.channel,
            params: request.params.clone(),
            pulser: request.pulser.clone(),
            handle: jig.handle.clone()?,
            experiment: request.settings.identifier.clone(),
            run_id: jig.run_id,
            interval_s: request.settings.interval_s,
        })
    }

    async fn serve(&self, name: &str, turn: Turn) {
        let outcome = self.cycle(name, &turn).await;
        let now = Instant::now();

        let mut jigs = self.jigs.lock();
        let Some(jig) = jigs.iter_mut().find(|jig| jig.name == name) else {
            return;
        };
        if jig.generation != turn.generation {
            debug!(jig = name, "Discarding result of a superseded run");
            return;
        }

        match outcome {
            Ok(row_id) => {
                if jig.status == Status::Error {
                    info!(jig = name, "Jig recovered");
                }
                jig.status = Status::Running;
                jig.retry_at = None;
                jig.pulse_count += 1;
                info!(jig = name, row_id, "Pulse completed");
            }
            Err((kind, e)) => {
                error!(jig = name, error = %e, ?kind, "Jig cycle failed");
                jig.status = Status::Error;
                jig.last_error = Some(e.to_string());
                jig.retry_at = match self.policy.action_for(kind) {
                    RecoveryAction::Retry => Some(now + self.policy.recovery_delay),
                    RecoveryAction::Abort => {
                        warn!(jig = name, "Store failure policy is 'stop', jig halted");
                        None
                    }
                };
            }
        }
    }

    async fn cycle(&self, name: &str, turn: &Turn) -> Result<RowId, (FailureKind, DaqError)> {
        let target = ChannelTarget {
            channel: turn.channel,
            properties: turn.pulser.as_ref(),
        };
        let waveform = self
            .sequencer
            .pulse_channel(target, &turn.params)
            .await
            .map_err(|e| (FailureKind::Acquisition, e.into()))?;

        let record = WaveformRecord::new(waveform, Some(turn.params.clone())).with_metadata(json!({
            "jig": name,
            "experiment": turn.experiment,
            "run_id": turn.run_id.map(|id| id.to_string()),
            "interval_s": turn.interval_s,
        }));
        turn.handle
            .write(record)
            .await
            .map_err(|e| (FailureKind::Persistence, e.into()))
    }

    async fn handle_command(&self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Pulse {
                jig,
                params,
                response,
            } => {
                let result = self.calibration_pulse(&jig, &params).await;
                if let Err(e) = &result {
                    warn!(jig = %jig, error = %e, "Calibration pulse failed");
                }
                let _ = response.send(result);
            }
        }
    }

    async fn calibration_pulse(&self, name: &str, params: &PulseParameters) -> AppResult<Waveform> {
        let (channel, pulser) = {
            let jigs = self.jigs.lock();
            let jig = jigs
                .iter()
                .find(|jig| jig.name == name)
                .ok_or_else(|| DaqError::UnknownJig(name.to_string()))?;
            let pulser = jig.request.as_ref().and_then(|r| r.pulser.clone());
            (jig.channel, pulser)
        };
        let target = ChannelTarget {
            channel,
            properties: pulser.as_ref(),
        };
        Ok(self.sequencer.pulse_channel(target, params).await?)
    }

    /// Wait while nothing is due. Returns `false` on shutdown.
    async fn idle(&mut self) -> bool {
        let wake = self.wake.clone();
        let event = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Event::Shutdown,
            command = self.commands.recv() => Event::Command(command),
            _ = wake.notified() => Event::Elapsed,
            _ = sleep(self.timing.idle_poll) => Event::Elapsed,
        };
        self.on_event(event).await
    }

    /// Sleep one slice, serving commands meanwhile. Returns `false` on shutdown.
    async fn pause(&mut self, slice: Duration) -> bool {
        let deadline = Instant::now() + slice;
        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Event::Shutdown,
                command = self.commands.recv() => Event::Command(command),
                _ = sleep_until(deadline) => return true,
            };
            if !self.on_event(event).await {
                return false;
            }
        }
    }

    async fn on_event(&self, event: Event) -> bool {
        match event {
            Event::Shutdown | Event::Command(None) => false,
            Event::Command(Some(command)) => {
                self.handle_command(command).await;
                true
            }
            Event::Elapsed => true,
        }
    }
}

enum Event {
    Shutdown,
    /// `None` once every handle is gone
    Command(Option<SchedulerCommand>),
    Elapsed,
}
