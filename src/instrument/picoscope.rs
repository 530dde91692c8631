//! Oscilloscope acquisition parameters and waveform decoding.
//!
//! The acquisition service answers `POST /get_wave` with a JSON object that
//! maps channel names to amplitudes. A channel may hold a flat list of
//! samples or a list of traces; traces are split into `name/0`, `name/1`, ...

use crate::experiment::settings::number_or_string;
use crate::gateway::GatewayError;
use crate::storage::Waveform;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Everything the oscilloscope needs for one acquisition.
///
/// Opaque to the controller, which only passes it through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseParameters {
    /// Trigger delay [us]
    #[serde(deserialize_with = "number_or_string")]
    pub delay: f64,
    /// Capture window [us]
    #[serde(deserialize_with = "number_or_string")]
    pub duration: f64,
    /// Input range [V]
    #[serde(deserialize_with = "number_or_string")]
    pub voltage_range: f64,
    /// Number of captures averaged on the instrument
    #[serde(default = "default_avg_num", deserialize_with = "number_or_string")]
    pub avg_num: u32,
}

fn default_avg_num() -> u32 {
    64
}

impl Default for PulseParameters {
    fn default() -> Self {
        Self {
            delay: 26.0,
            duration: 6.0,
            voltage_range: 0.5,
            avg_num: default_avg_num(),
        }
    }
}

impl PulseParameters {
    /// Form-encoded request body for the acquisition endpoint.
    ///
    /// Only numbers are ever sent, so no percent-encoding is required.
    pub fn to_form(&self) -> String {
        format!(
            "delay={}&duration={}&voltage_range={}&avg_num={}",
            self.delay, self.duration, self.voltage_range, self.avg_num
        )
    }
}

/// Decode the acquisition service's JSON response.
pub fn parse_waveform(body: &[u8]) -> Result<Waveform, GatewayError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::MalformedWaveform(format!("invalid JSON: {}", e)))?;

    let object = value.as_object().ok_or_else(|| {
        GatewayError::MalformedWaveform("expected an object of channels".to_string())
    })?;

    let mut waveform = Waveform::new();
    for (name, samples) in object {
        let array = samples.as_array().ok_or_else(|| {
            GatewayError::MalformedWaveform(format!("channel '{}' is not an array", name))
        })?;

        if array.iter().all(Value::is_array) && !array.is_empty() {
            for (index, trace) in array.iter().enumerate() {
                let trace_name = format!("{}/{}", name, index);
                let values = numbers(&trace_name, trace)?;
                waveform.insert(trace_name, values);
            }
        } else {
            waveform.insert(name.clone(), numbers(name, samples)?);
        }
    }

    if waveform.is_empty() {
        return Err(GatewayError::MalformedWaveform(
            "response carried no channels".to_string(),
        ));
    }
    Ok(waveform)
}

fn numbers(name: &str, value: &Value) -> Result<Vec<f32>, GatewayError> {
    let array = value.as_array().ok_or_else(|| {
        GatewayError::MalformedWaveform(format!("channel '{}' is not an array", name))
    })?;
    array
        .iter()
        .map(|v| {
            v.as_f64().map(|x| x as f32).ok_or_else(|| {
                GatewayError::MalformedWaveform(format!(
                    "channel '{}' holds a non-numeric sample: {}",
                    name, v
                ))
            })
        })
        .collect()
}
