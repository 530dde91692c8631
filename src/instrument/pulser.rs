//! Ultrasonic pulser commands.
//!
//! The pulser speaks a one-letter-plus-number protocol relayed by the serial
//! forwarder: `P500` sets the repetition rate to 5 kHz (units of 10 Hz) and
//! so energizes the pulser, `P0` de-energizes it.

use serde::{Deserialize, Serialize};

/// Command that stops pulsing.
pub const TURN_OFF: &str = "P0";

/// Default energize command: 5 kHz repetition.
pub const DEFAULT_REPETITION: &str = "P500";

/// Per-experiment pulser tuning, applied before each pulse on a jig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulserProperties {
    /// Receiver gain [dB]
    pub gain_db: f64,
    /// Centre frequency of the transducer [MHz], sets the pulse width
    #[serde(default = "default_transducer_frequency")]
    pub transducer_frequency_mhz: f64,
    /// Pulser mode, `M1` is pulse-echo
    #[serde(default = "default_mode")]
    pub mode: u8,
}

fn default_transducer_frequency() -> f64 {
    2.25
}

fn default_mode() -> u8 {
    1
}

impl PulserProperties {
    /// Properties with the default transducer and mode.
    pub fn new(gain_db: f64) -> Self {
        Self {
            gain_db,
            transducer_frequency_mhz: default_transducer_frequency(),
            mode: default_mode(),
        }
    }

    /// Pulse width matching half a period of the transducer [ns].
    pub fn pulse_width_ns(&self) -> u32 {
        (1.0 / self.transducer_frequency_mhz * 1e3) as u32
    }

    /// Gain in tenths of a dB, as the pulser expects (`G300` is 30 dB).
    pub fn gain_tenths(&self) -> i32 {
        (self.gain_db * 10.0) as i32
    }

    /// Commands in the order they are sent.
    pub fn commands(&self) -> Vec<String> {
        vec![
            format!("M{}", self.mode),
            format!("W{}", self.pulse_width_ns()),
            format!("G{}", self.gain_tenths()),
        ]
    }

    /// Reject values that would produce a malformed command.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.transducer_frequency_mhz.is_finite() && self.transducer_frequency_mhz > 0.0) {
            return Err(format!(
                "transducer frequency must be positive, got {}",
                self.transducer_frequency_mhz
            ));
        }
        if !self.gain_db.is_finite() {
            return Err("gain must be a finite number".to_string());
        }
        Ok(())
    }
}

/// One-time pulser configuration. Not sent during experiments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulserSetup {
    /// Energize command, e.g. `P500`
    pub pulse_repetition_rate: String,
    /// `D7` is maximum damping
    pub damping: String,
    /// In volts
    pub pulse_voltage: String,
    /// `T0` is internal triggering
    pub trigger_type: String,
}

impl Default for PulserSetup {
    fn default() -> Self {
        Self {
            pulse_repetition_rate: DEFAULT_REPETITION.to_string(),
            damping: "D7".to_string(),
            pulse_voltage: "V350".to_string(),
            trigger_type: "T0".to_string(),
        }
    }
}

impl PulserSetup {
    /// Setup commands in the order they are sent.
    pub fn commands(&self) -> Vec<String> {
        vec![
            self.pulse_repetition_rate.clone(),
            self.damping.clone(),
            self.pulse_voltage.clone(),
            self.trigger_type.clone(),
        ]
    }
}
