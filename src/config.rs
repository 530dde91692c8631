//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/acoustics.toml`)
//! 2. environment variables prefixed with `ACOUSTICS_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated with a double underscore:
//!
//! ```text
//! ACOUSTICS_APPLICATION__LOG_LEVEL=debug
//! ACOUSTICS_SERVER__BIND=0.0.0.0:5000
//! ACOUSTICS_RECOVERY__ON_STORE_FAILURE=stop
//! ```
//!
//! # Example
//!
//! ```no_run
//! use acoustics_daq::config::AppConfig;
//!
//! let config = AppConfig::load_from("config/acoustics.toml")?;
//! println!("Jigs on this rig: {}", config.jigs.len());
//! # Ok::<(), acoustics_daq::config::ConfigError>(())
//! ```

use crate::error_recovery::{RecoveryPolicy, StoreFailurePolicy};
use crate::instrument::mux::MuxChannel;
use crate::sequencer::MIN_SWITCH_SETTLE;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or parsed.
    #[error("Configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),
    /// Values parsed but break a rule checked by [`AppConfig::validate`].
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Name, log level and deployment mode
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Control API listener
    #[serde(default)]
    pub server: ServerConfig,
    /// Instrument endpoints
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Where result files are written
    #[serde(default)]
    pub storage: StorageConfig,
    /// Loop and scheduler timing
    #[serde(default)]
    pub timing: TimingConfig,
    /// Failure handling
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Logical channels sharing the rig. Only used in `multi` mode.
    #[serde(default)]
    pub jigs: Vec<JigDefinition>,
}

/// Which controller drives the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// One experiment owns the rig.
    #[default]
    Single,
    /// Several jigs time-share the rig through the scheduler.
    Multi,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Service name, used in logs
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Single experiment or multi-jig scheduling
    #[serde(default)]
    pub mode: DeploymentMode,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "acoustics-daq".to_string(),
            log_level: "info".to_string(),
            mode: DeploymentMode::Single,
        }
    }
}

/// Control API listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1:5000`
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 5000)),
        }
    }
}

/// Network locations of the instrument adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Oscilloscope acquisition service, e.g. `http://192.168.0.10:5001`
    pub picoscope_url: String,
    /// Serial forwarder in front of the pulser
    pub pulser_url: String,
    /// Serial forwarder in front of the multiplexer
    pub mux_url: String,
    /// Upper bound on every gateway call [ms]
    #[serde(default = "default_gateway_timeout")]
    pub timeout_ms: u64,
    /// Pulser command that energizes the pulser (repetition rate in 10s of Hz)
    #[serde(default = "default_pulse_repetition")]
    pub pulse_repetition: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            picoscope_url: "http://192.168.0.10:5001".to_string(),
            pulser_url: "http://192.168.0.20:9002".to_string(),
            mux_url: "http://192.168.0.30:9003".to_string(),
            timeout_ms: default_gateway_timeout(),
            pulse_repetition: default_pulse_repetition(),
        }
    }
}

impl GatewayConfig {
    /// Gateway call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Result store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one `{id}.sqlite3` file per experiment
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("acoustics"),
        }
    }
}

/// Loop and scheduler timing, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Back-off after a failed cycle
    #[serde(default = "default_recovery_delay")]
    pub recovery_delay_ms: u64,
    /// Wait after a multiplexer switch, at least 50
    #[serde(default = "default_switch_settle")]
    pub switch_settle_ms: u64,
    /// Scheduler slice for a single due jig, divided as jigs join
    #[serde(default = "default_slice_baseline")]
    pub slice_baseline_ms: u64,
    /// How often an idle scheduler re-checks the jig table
    #[serde(default = "default_idle_poll")]
    pub idle_poll_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            recovery_delay_ms: default_recovery_delay(),
            switch_settle_ms: default_switch_settle(),
            slice_baseline_ms: default_slice_baseline(),
            idle_poll_ms: default_idle_poll(),
        }
    }
}

impl TimingConfig {
    /// Back-off as a [`Duration`].
    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    /// Settle delay as a [`Duration`].
    pub fn switch_settle(&self) -> Duration {
        Duration::from_millis(self.switch_settle_ms)
    }

    /// Slice baseline as a [`Duration`].
    pub fn slice_baseline(&self) -> Duration {
        Duration::from_millis(self.slice_baseline_ms)
    }

    /// Idle poll period as a [`Duration`].
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

/// What the loop does when the result store fails.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecoveryConfig {
    /// Retry or end the run when a write fails
    #[serde(default)]
    pub on_store_failure: StoreFailurePolicy,
}

/// Jig definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JigDefinition {
    /// Name used in `/jigs/{name}/...` routes
    pub name: String,
    /// Multiplexer module, `0` unless the rig has several
    #[serde(default)]
    pub module: u16,
    /// Switch on that module
    pub switch: u16,
}

impl JigDefinition {
    /// Multiplexer address of this jig.
    pub fn mux_channel(&self) -> MuxChannel {
        MuxChannel::new(self.module, self.switch)
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_gateway_timeout() -> u64 {
    30_000
}

fn default_pulse_repetition() -> String {
    "P500".to_string()
}

fn default_recovery_delay() -> u64 {
    10_000
}

fn default_switch_settle() -> u64 {
    MIN_SWITCH_SETTLE.as_millis() as u64
}

fn default_slice_baseline() -> u64 {
    10_000
}

fn default_idle_poll() -> u64 {
    500
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl AppConfig {
    /// Load configuration from `config/acoustics.toml` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/acoustics.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Precedence (highest first): `ACOUSTICS_` environment variables, the
    /// file, built-in defaults. A missing file is not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ACOUSTICS_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (defaults fill gaps).
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Gateway URLs are http URLs and the timeout is non-zero
    /// - Timing values are non-zero and the settle delay is at least 50 ms
    /// - Jig names are unique and non-empty
    /// - Multiplexer addresses are unique
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        for (field, url) in [
            ("picoscope_url", &self.gateway.picoscope_url),
            ("pulser_url", &self.gateway.pulser_url),
            ("mux_url", &self.gateway.mux_url),
        ] {
            if !url.starts_with("http://") {
                return Err(ConfigError::Validation(format!(
                    "gateway.{} must be an http:// URL, got '{}'",
                    field, url
                )));
            }
        }
        if self.gateway.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "gateway.timeout_ms must be > 0".to_string(),
            ));
        }

        // Shorter settle delays produce cross-talk between channels
        let settle_floor = MIN_SWITCH_SETTLE.as_millis() as u64;
        if self.timing.switch_settle_ms < settle_floor {
            return Err(ConfigError::Validation(format!(
                "timing.switch_settle_ms must be at least {}, got {}",
                settle_floor, self.timing.switch_settle_ms
            )));
        }
        for (field, value) in [
            ("recovery_delay_ms", self.timing.recovery_delay_ms),
            ("slice_baseline_ms", self.timing.slice_baseline_ms),
            ("idle_poll_ms", self.timing.idle_poll_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "timing.{} must be > 0",
                    field
                )));
            }
        }

        let mut names = HashSet::new();
        let mut addresses = HashSet::new();
        for jig in &self.jigs {
            if jig.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "Jig name cannot be empty".to_string(),
                ));
            }
            if !names.insert(jig.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate jig name: '{}'",
                    jig.name
                )));
            }
            if !addresses.insert((jig.module, jig.switch)) {
                return Err(ConfigError::Validation(format!(
                    "Jig '{}' reuses multiplexer address {},{}",
                    jig.name, jig.module, jig.switch
                )));
            }
        }

        Ok(())
    }

    /// Recovery behaviour handed to the experiment loop and the scheduler.
    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            recovery_delay: self.timing.recovery_delay(),
            on_store_failure: self.recovery.on_store_failure,
        }
    }
}
