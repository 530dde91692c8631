//! Experiment lifecycle.
//!
//! - [`Status`]: the four-state lifecycle shared by experiments and jigs
//! - [`ExperimentSettings`]: duration, cadence and store key
//! - [`Controller`]: runs one experiment on its own worker task
//! - [`Cancellation`]/[`CancelSignal`]: per-run stop signal

pub mod cancel;
pub mod controller;
pub mod settings;
pub mod status;

pub use cancel::{CancelSignal, Cancellation};
pub use controller::Controller;
pub use settings::ExperimentSettings;
pub use status::Status;

use crate::instrument::PulseParameters;
use serde::{Deserialize, Serialize};

/// Body of a start request: settings and acquisition parameters side by side.
///
/// ```
/// use acoustics_daq::experiment::ExperimentRequest;
///
/// let request: ExperimentRequest = serde_json::from_str(
///     r#"{"exp_duration_h": "0.5", "interval": 10, "exp_id": "cell_3",
///         "delay": 26, "duration": 6, "voltage_range": 0.5}"#,
/// ).unwrap();
/// assert_eq!(request.settings.interval_s, 10.0);
/// assert_eq!(request.params.avg_num, 64);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRequest {
    /// Duration, interval and identifier
    #[serde(flatten)]
    pub settings: ExperimentSettings,
    /// Acquisition parameters for every cycle
    #[serde(flatten)]
    pub params: PulseParameters,
}
