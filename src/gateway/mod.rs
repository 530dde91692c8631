//! Instrument gateway
//!
//! The pulser, multiplexer and oscilloscope each sit behind a small network
//! adapter. This module defines the one seam the core talks through,
//! [`InstrumentGateway`], plus two implementations:
//!
//! - [`HttpGateway`] for the deployed rig,
//! - [`MockGateway`] for tests (latency, failure injection, call log).
//!
//! Gateway calls are plain request/response; none of them is cancellable
//! once sent.

pub mod http;
pub mod mock;

pub use http::{HttpGateway, NodeForwarder};
pub use mock::MockGateway;

use crate::instrument::PulseParameters;
use crate::storage::Waveform;
use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by gateway round-trips.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No answer within the configured timeout.
    #[error("Request to {endpoint} timed out after {timeout_ms} ms")]
    Timeout {
        /// URL that was called
        endpoint: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// Connection or protocol failure.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// The request could not be built, e.g. a malformed URL.
    #[error("Invalid request: {0}")]
    Request(String),

    /// Non-2xx answer.
    #[error("{endpoint} answered with status {status}")]
    Status {
        /// URL that was called
        endpoint: String,
        /// HTTP status code
        status: u16,
    },

    /// The oscilloscope answered with something other than a waveform.
    #[error("Malformed waveform: {0}")]
    MalformedWaveform(String),

    /// Failure injected by [`MockGateway`].
    #[error("Injected failure: {0}")]
    Injected(String),
}

/// Convenience alias for gateway results.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Stateless request/response access to the rig.
#[async_trait]
pub trait InstrumentGateway: Send + Sync {
    /// Trigger an acquisition and wait for the waveform.
    async fn acquire(&self, params: &PulseParameters) -> GatewayResult<Waveform>;

    /// Relay one command to the pulser.
    async fn pulser(&self, command: &str) -> GatewayResult<String>;

    /// Relay one command to the multiplexer.
    async fn mux(&self, command: &str) -> GatewayResult<String>;
}
