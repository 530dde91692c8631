//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Each subsystem owns a narrower error enum (`GatewayError`, `StoreError`,
//! `ConfigError`) and `DaqError` folds them together through `#[from]`, so the
//! `?` operator works across module boundaries.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: loading or validating the figment configuration failed.
//! - **`Gateway`**: an instrument round-trip failed (timeout, HTTP status,
//!   malformed waveform). Inside the experiment loop these are transient.
//! - **`Store`**: the result store could not be opened or written.
//! - **`InvalidSettings`**: experiment settings rejected before any worker is
//!   spawned.
//! - **`AlreadyRunning`** / **`UnknownJig`**: control-plane rejections.

use crate::config::ConfigError;
use crate::gateway::GatewayError;
use crate::storage::StoreError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Instrument gateway failure.
    #[error("Instrument error: {0}")]
    Gateway(#[from] GatewayError),

    /// Result store failure.
    #[error("Result store error: {0}")]
    Store(#[from] StoreError),

    /// Settings rejected at start.
    #[error("Invalid experiment settings: {0}")]
    InvalidSettings(String),

    /// `start` was called while a loop for the same experiment is active.
    #[error("Experiment '{0}' is already running")]
    AlreadyRunning(String),

    /// No jig with this name exists on the rig.
    #[error("Unknown jig: '{0}'")]
    UnknownJig(String),

    /// The scheduler task is gone, so nothing can reach the rig.
    #[error("Scheduler is not running")]
    SchedulerUnavailable,

    /// The control API could not bind or failed while serving.
    #[error("Control API error: {0}")]
    Server(#[source] hyper::Error),
}
