//! Core library for the acoustics_daq controller.
//!
//! Drives unattended pulse/acquire/persist cycles on an ultrasonic rig:
//!
//! - [`experiment`]: lifecycle state machine and the single-experiment
//!   [`Controller`](experiment::Controller)
//! - [`scheduler`]: fair-share scheduling when several jigs share one rig
//! - [`sequencer`]: one measurement cycle, with guaranteed pulser turn-off
//! - [`gateway`]: network access to the pulser, multiplexer and oscilloscope
//! - [`storage`]: append-only result stores
//! - [`server`]: HTTP control API
//!
//! It is used by the `acoustics-daq` binary and by the integration tests.

pub mod config;
pub mod error;
pub mod error_recovery;
pub mod experiment;
pub mod gateway;
pub mod instrument;
pub mod scheduler;
pub mod sequencer;
pub mod server;
pub mod storage;
