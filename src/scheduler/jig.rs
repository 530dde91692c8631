//! Jig state as seen by the scheduler.

use crate::config::JigDefinition;
use chrono::{DateTime, Utc};
use crate::experiment::{ExperimentSettings, Status};
use crate::instrument::{MuxChannel, PulseParameters, PulserProperties};
use crate::storage::ResultHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

/// Start payload for one jig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JigRequest {
    /// Duration and store key; the interval is recorded but turns follow the slice
    #[serde(flatten)]
    pub settings: ExperimentSettings,
    /// Acquisition parameters for every turn
    #[serde(flatten)]
    pub params: PulseParameters,
    /// Applied after the multiplexer switch on every turn
    #[serde(default)]
    pub pulser: Option<PulserProperties>,
}

impl JigRequest {
    /// Request without pulser tuning.
    pub fn new(settings: ExperimentSettings, params: PulseParameters) -> Self {
        Self {
            settings,
            params,
            pulser: None,
        }
    }

    /// Apply `properties` before every pulse on this jig.
    pub fn with_pulser(mut self, properties: PulserProperties) -> Self {
        self.pulser = Some(properties);
        self
    }
}

/// Point-in-time view of a jig for the control API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JigSnapshot {
    /// Configured jig name
    pub name: String,
    /// Multiplexer address
    pub channel: MuxChannel,
    /// Lifecycle state
    pub status: Status,
    /// Integer code of `status`
    pub code: u8,
    /// Identifier of the current (or last) experiment
    pub experiment: Option<String>,
    /// Wall-clock start of that experiment
    pub started_at: Option<DateTime<Utc>>,
    /// Seconds since the start
    pub elapsed_s: Option<f64>,
    /// Successful turns
    pub pulse_count: u64,
    /// Row key of the newest record
    pub last_updated: Option<f64>,
    /// Most recent failure, if any
    pub last_error: Option<String>,
}

pub(crate) struct Jig {
    pub(crate) name: String,
    pub(crate) channel: MuxChannel,
    pub(crate) status: Status,
    /// Bumped on every start and stop; stale cycle results are discarded.
    pub(crate) generation: u64,
    pub(crate) started_at: Option<Instant>,
    /// Wall-clock start, for display only
    pub(crate) started_wall: Option<DateTime<Utc>>,
    pub(crate) request: Option<JigRequest>,
    pub(crate) handle: Option<Arc<dyn ResultHandle>>,
    pub(crate) run_id: Option<Uuid>,
    pub(crate) retry_at: Option<Instant>,
    pub(crate) last_error: Option<String>,
    pub(crate) pulse_count: u64,
}

impl Jig {
    pub(crate) fn new(definition: &JigDefinition) -> Self {
        Self {
            name: definition.name.clone(),
            channel: definition.mux_channel(),
            status: Status::NotStarted,
            generation: 0,
            started_at: None,
            started_wall: None,
            request: None,
            handle: None,
            run_id: None,
            retry_at: None,
            last_error: None,
            pulse_count: 0,
        }
    }

    /// Holds a run that has not been stopped, including one backing off.
    pub(crate) fn is_active(&self) -> bool {
        match self.status {
            Status::Running => true,
            Status::Error => self.retry_at.is_some(),
            Status::NotStarted | Status::Stopped => false,
        }
    }

    /// Should get a turn in the current round.
    pub(crate) fn is_due(&self, now: Instant) -> bool {
        match self.status {
            Status::Running => true,
            Status::Error => self.retry_at.is_some_and(|at| at <= now),
            Status::NotStarted | Status::Stopped => false,
        }
    }

    pub(crate) fn duration(&self) -> Option<Duration> {
        self.request.as_ref().map(|r| r.settings.duration())
    }

    pub(crate) fn has_expired(&self, now: Instant) -> bool {
        match (self.started_at, self.duration()) {
            (Some(started), Some(duration)) => now.saturating_duration_since(started) >= duration,
            _ => false,
        }
    }

    /// Move an active jig past its duration to `stopped`.
    pub(crate) fn retire_if_expired(&mut self, now: Instant) -> bool {
        if !(self.is_active() && self.has_expired(now)) {
            return false;
        }
        self.status = Status::Stopped;
        self.retry_at = None;
        info!(jig = %self.name, pulses = self.pulse_count, "Jig duration reached");
        true
    }

    pub(crate) fn snapshot(&self) -> JigSnapshot {
        JigSnapshot {
            name: self.name.clone(),
            channel: self.channel,
            status: self.status,
            code: self.status.code(),
            experiment: self.request.as_ref().map(|r| r.settings.identifier.clone()),
            started_at: self.started_wall,
            elapsed_s: self.started_at.map(|t| t.elapsed().as_secs_f64()),
            pulse_count: self.pulse_count,
            last_updated: self.handle.as_ref().and_then(|h| h.last_written()),
            last_error: self.last_error.clone(),
        }
    }
}
