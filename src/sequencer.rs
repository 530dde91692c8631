//! Pulse sequencer: one measurement cycle against the rig.
//!
//! A cycle is the ordered sequence
//!
//! 1. select the multiplexer channel (multi-jig rigs only), apply pulser
//!    properties, wait for the switch to settle,
//! 2. energize the pulser,
//! 3. acquire a waveform,
//! 4. de-energize the pulser.
//!
//! Step 4 runs whatever happens in step 3. If the cycle future itself is
//! dropped while the pulser is energized, the turn-off is handed to a
//! detached task.
//!
//! Cycles are non-reentrant: the sequencer holds the rig lock for the whole
//! cycle, so two callers sharing one sequencer are serialized.

use crate::gateway::{GatewayResult, InstrumentGateway};
use crate::instrument::pulser::{DEFAULT_REPETITION, TURN_OFF};
use crate::instrument::{MuxChannel, PulseParameters, PulserProperties};
use crate::storage::Waveform;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Shortest settle time after switching the multiplexer, and the default.
/// Pulsing sooner produces cross-talk between channels.
pub const MIN_SWITCH_SETTLE: Duration = Duration::from_millis(50);

/// Target of a multi-jig cycle.
#[derive(Debug, Clone, Copy)]
pub struct ChannelTarget<'a> {
    /// Address to select before pulsing
    pub channel: MuxChannel,
    /// Pulser tuning sent after the switch
    pub properties: Option<&'a PulserProperties>,
}

/// Runs measurement cycles against one rig, one at a time.
///
/// ```
/// use acoustics_daq::gateway::MockGateway;
/// use acoustics_daq::instrument::PulseParameters;
/// use acoustics_daq::sequencer::PulseSequencer;
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let gateway = MockGateway::new();
/// let sequencer = PulseSequencer::new(Arc::new(gateway.clone()));
///
/// let waveform = sequencer.pulse(&PulseParameters::default()).await.unwrap();
/// assert!(waveform.contains_key("amps"));
/// assert!(!gateway.is_energized());
/// # }
/// ```
pub struct PulseSequencer {
    gateway: Arc<dyn InstrumentGateway>,
    rig: Mutex<()>,
    energize_command: String,
    switch_settle: Duration,
}

impl PulseSequencer {
    /// Sequencer with the default energize command and settle time.
    pub fn new(gateway: Arc<dyn InstrumentGateway>) -> Self {
        Self {
            gateway,
            rig: Mutex::new(()),
            energize_command: DEFAULT_REPETITION.to_string(),
            switch_settle: MIN_SWITCH_SETTLE,
        }
    }

    /// Pulser command used to energize, e.g. `P500`.
    pub fn with_energize_command(mut self, command: impl Into<String>) -> Self {
        self.energize_command = command.into();
        self
    }

    /// Settle time after a channel switch, never shorter than [`MIN_SWITCH_SETTLE`].
    pub fn with_switch_settle(mut self, settle: Duration) -> Self {
        self.switch_settle = settle.max(MIN_SWITCH_SETTLE);
        self
    }

    /// Single-channel cycle.
    pub async fn pulse(&self, params: &PulseParameters) -> GatewayResult<Waveform> {
        self.run(None, params).await
    }

    /// Cycle on one jig's multiplexer address.
    pub async fn pulse_channel(
        &self,
        target: ChannelTarget<'_>,
        params: &PulseParameters,
    ) -> GatewayResult<Waveform> {
        self.run(Some(target), params).await
    }

    async fn run(
        &self,
        target: Option<ChannelTarget<'_>>,
        params: &PulseParameters,
    ) -> GatewayResult<Waveform> {
        let _rig = self.rig.lock().await;

        if let Some(target) = target {
            debug!(channel = %target.channel, "Selecting channel");
            self.gateway.mux(&target.channel.select_command()).await?;
            if let Some(properties) = target.properties {
                for command in properties.commands() {
                    self.gateway.pulser(&command).await?;
                }
            }
            tokio::time::sleep(self.switch_settle).await;
        }

        let mut guard = EnergizedGuard::new(self.gateway.clone());
        self.gateway.pulser(&self.energize_command).await?;
        let acquired = self.gateway.acquire(params).await;

        // Disarm before awaiting so a drop during turn-off does not double up
        guard.disarm();
        let turned_off = self.gateway.pulser(TURN_OFF).await;

        let waveform = acquired?;
        if let Err(e) = turned_off {
            warn!(error = %e, "Pulser turn-off failed after acquisition");
            return Err(e);
        }
        Ok(waveform)
    }
}

/// Sends the turn-off command if dropped while still armed.
///
/// Armed before the energize command is sent: if that call times out the
/// pulser may still have latched it.
struct EnergizedGuard {
    gateway: Option<Arc<dyn InstrumentGateway>>,
}

impl EnergizedGuard {
    fn new(gateway: Arc<dyn InstrumentGateway>) -> Self {
        Self {
            gateway: Some(gateway),
        }
    }

    fn disarm(&mut self) {
        self.gateway = None;
    }
}

impl Drop for EnergizedGuard {
    fn drop(&mut self) {
        let Some(gateway) = self.gateway.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = gateway.pulser(TURN_OFF).await {
                        warn!(error = %e, "Deferred pulser turn-off failed");
                    }
                });
            }
            Err(_) => warn!("No runtime available to turn the pulser off"),
        }
    }
}
