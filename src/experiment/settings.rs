//! Experiment settings.
//!
//! Separate from the acquisition parameters: these describe *how long* and
//! *how often*, not *how* to pulse. Control clients historically post every
//! field as a string, so numeric fields accept either `1.5` or `"1.5"`.

use crate::error::{AppResult, DaqError};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Longest accepted experiment identifier.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Longest accepted experiment, ten years [h].
pub const MAX_DURATION_H: f64 = 24.0 * 365.0 * 10.0;

/// Longest accepted time between pulses, one day [s].
pub const MAX_INTERVAL_S: f64 = 86_400.0;

/// Duration, cadence, and identity of one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSettings {
    /// Total duration [h]
    #[serde(rename = "exp_duration_h", deserialize_with = "number_or_string")]
    pub duration_h: f64,
    /// Time between pulses [s]
    #[serde(rename = "interval", deserialize_with = "number_or_string")]
    pub interval_s: f64,
    /// Result store file key
    #[serde(rename = "exp_id")]
    pub identifier: String,
}

impl ExperimentSettings {
    /// Settings from plain values. Nothing is checked until [`validate`](Self::validate).
    pub fn new(duration_h: f64, interval_s: f64, identifier: impl Into<String>) -> Self {
        Self {
            duration_h,
            interval_s,
            identifier: identifier.into(),
        }
    }

    /// Total duration, converted from hours.
    ///
    /// Saturates at [`Duration::MAX`] for values [`validate`](Self::validate)
    /// would reject.
    pub fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.duration_h * 3600.0).unwrap_or(Duration::MAX)
    }

    /// Time between pulses. Saturates like [`duration`](Self::duration).
    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.interval_s).unwrap_or(Duration::MAX)
    }

    /// Reject settings that could only produce a running-but-broken experiment.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.duration_h.is_finite() && self.duration_h > 0.0) {
            return Err(DaqError::InvalidSettings(format!(
                "duration must be a positive number of hours, got {}",
                self.duration_h
            )));
        }
        if self.duration_h > MAX_DURATION_H {
            return Err(DaqError::InvalidSettings(format!(
                "duration of {} h exceeds the {} h limit",
                self.duration_h, MAX_DURATION_H
            )));
        }
        if !(self.interval_s.is_finite() && self.interval_s > 0.0) {
            return Err(DaqError::InvalidSettings(format!(
                "interval must be a positive number of seconds, got {}",
                self.interval_s
            )));
        }
        if self.interval_s > MAX_INTERVAL_S {
            return Err(DaqError::InvalidSettings(format!(
                "interval of {} s exceeds the {} s limit",
                self.interval_s, MAX_INTERVAL_S
            )));
        }
        validate_identifier(&self.identifier)
    }
}

/// Identifiers become file names, so only a conservative character set passes.
pub fn validate_identifier(identifier: &str) -> AppResult<()> {
    if identifier.is_empty() {
        return Err(DaqError::InvalidSettings(
            "experiment identifier cannot be empty".to_string(),
        ));
    }
    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(DaqError::InvalidSettings(format!(
            "experiment identifier longer than {} characters",
            MAX_IDENTIFIER_LEN
        )));
    }
    if identifier.starts_with('.') {
        return Err(DaqError::InvalidSettings(format!(
            "experiment identifier '{}' cannot start with '.'",
            identifier
        )));
    }
    let safe = identifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !safe {
        return Err(DaqError::InvalidSettings(format!(
            "experiment identifier '{}' may only contain letters, digits, '_', '-' and '.'",
            identifier
        )));
    }
    Ok(())
}

/// Accept a JSON number or a string holding one.
pub(crate) fn number_or_string<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr + serde::Deserialize<'de>,
    T::Err: std::fmt::Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw<T> {
        Number(T),
        Text(String),
    }

    match Raw::<T>::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => text
            .trim()
            .parse::<T>()
            .map_err(|e| de::Error::custom(format!("expected a number, got '{}': {}", text, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_converted_to_seconds() {
        let settings = ExperimentSettings::new(1.0, 10.0, "test");
        assert_eq!(settings.duration(), Duration::from_secs(3600));
        assert_eq!(settings.interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_string_fields_are_parsed() {
        let settings: ExperimentSettings = serde_json::from_str(
            r#"{"exp_duration_h": "0.5", "interval": "10", "exp_id": "cell_07"}"#,
        )
        .unwrap();
        assert_eq!(settings.duration_h, 0.5);
        assert_eq!(settings.interval_s, 10.0);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_non_numeric_duration_rejected() {
        let result: Result<ExperimentSettings, _> = serde_json::from_str(
            r#"{"exp_duration_h": "soon", "interval": 10, "exp_id": "x"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_non_positive_values_rejected() {
        assert!(ExperimentSettings::new(0.0, 1.0, "x").validate().is_err());
        assert!(ExperimentSettings::new(1.0, -1.0, "x").validate().is_err());
        assert!(ExperimentSettings::new(f64::NAN, 1.0, "x").validate().is_err());
        assert!(ExperimentSettings::new(1.0, f64::INFINITY, "x").validate().is_err());
    }

    #[test]
    fn test_oversized_values_rejected() {
        assert!(ExperimentSettings::new(MAX_DURATION_H, MAX_INTERVAL_S, "x").validate().is_ok());
        assert!(ExperimentSettings::new(1e16, 1.0, "x").validate().is_err());
        assert!(ExperimentSettings::new(f64::MAX, 1.0, "x").validate().is_err());
        assert!(ExperimentSettings::new(1.0, 1e20, "x").validate().is_err());
    }

    #[test]
    fn test_unvalidated_conversions_do_not_panic() {
        let settings = ExperimentSettings::new(1e16, -1.0, "x");
        assert_eq!(settings.duration(), Duration::MAX);
        assert_eq!(settings.interval(), Duration::MAX);
    }

    #[test]
    fn test_identifier_must_be_filesystem_safe() {
        assert!(validate_identifier("cell-07_v2.1").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("../etc/passwd").is_err());
        assert!(validate_identifier("a b").is_err());
        assert!(validate_identifier(".hidden").is_err());
        assert!(validate_identifier(&"x".repeat(MAX_IDENTIFIER_LEN + 1)).is_err());
    }
}
