//! Mock instrument gateway for testing
//!
//! Simulates the rig without hardware. It provides:
//! - Simulated round-trip latency
//! - Controllable failure injection (any call, or acquisitions only)
//! - Call logging for test verification
//! - Pulser energize tracking and an in-flight counter that records the
//!   highest number of overlapping calls ever observed

use super::{GatewayError, GatewayResult, InstrumentGateway};
use crate::instrument::pulser::TURN_OFF;
use crate::instrument::PulseParameters;
use crate::storage::Waveform;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct MockState {
    latency: Mutex<Duration>,
    waveform: Mutex<Waveform>,
    failing_calls: AtomicUsize,
    failing_acquisitions: AtomicUsize,
    call_log: Mutex<Vec<String>>,
    energized: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    acquisitions: AtomicUsize,
}

/// Mock gateway for tests
///
/// # Example
///
/// ```
/// use acoustics_daq::gateway::MockGateway;
///
/// let gateway = MockGateway::new();
/// gateway.fail_next_acquisitions(1);
/// assert!(!gateway.is_energized());
/// ```
#[derive(Clone)]
pub struct MockGateway {
    state: Arc<MockState>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    /// Healthy rig with no latency and a six-channel waveform.
    pub fn new() -> Self {
        let state = MockState::default();
        *state.waveform.lock() = default_waveform();
        Self {
            state: Arc::new(state),
        }
    }

    /// Set simulated latency for every call
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock() = latency;
        self
    }

    /// Replace the waveform returned by `acquire`
    pub fn with_waveform(self, waveform: Waveform) -> Self {
        *self.state.waveform.lock() = waveform;
        self
    }

    /// Fail the next `count` calls of any kind
    pub fn fail_next_calls(&self, count: usize) {
        self.state.failing_calls.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` acquisitions; pulser and mux calls still succeed
    pub fn fail_next_acquisitions(&self, count: usize) {
        self.state.failing_acquisitions.store(count, Ordering::SeqCst);
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<String> {
        self.state.call_log.lock().clone()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        self.state.call_log.lock().clear();
    }

    /// Whether the last pulser command left the pulser energized
    pub fn is_energized(&self) -> bool {
        self.state.energized.load(Ordering::SeqCst)
    }

    /// Highest number of gateway calls ever in flight at once
    pub fn max_concurrency(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Successful acquisitions so far
    pub fn acquisition_count(&self) -> usize {
        self.state.acquisitions.load(Ordering::SeqCst)
    }

    fn log_call(&self, call: String) {
        self.state.call_log.lock().push(call);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Run one simulated round-trip, tracking overlap with other calls.
    async fn round_trip(&self, call: String, acquisition: bool) -> GatewayResult<()> {
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.log_call(call.clone());

        let latency = *self.state.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

        if Self::take(&self.state.failing_calls)
            || (acquisition && Self::take(&self.state.failing_acquisitions))
        {
            return Err(GatewayError::Injected(call));
        }
        Ok(())
    }
}

fn default_waveform() -> Waveform {
    let mut waveform = Waveform::new();
    waveform.insert("amps".to_string(), vec![0.0, 0.5, 1.0, 0.5, 0.0, -0.5]);
    waveform
}

#[async_trait]
impl InstrumentGateway for MockGateway {
    async fn acquire(&self, params: &PulseParameters) -> GatewayResult<Waveform> {
        self.round_trip(format!("acquire: {}", params.to_form()), true)
            .await?;
        self.state.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.waveform.lock().clone())
    }

    async fn pulser(&self, command: &str) -> GatewayResult<String> {
        self.round_trip(format!("pulser: {}", command), false).await?;
        if command == TURN_OFF {
            self.state.energized.store(false, Ordering::SeqCst);
        } else if command.starts_with('P') {
            self.state.energized.store(true, Ordering::SeqCst);
        }
        Ok(format!("MOCK_RESPONSE: {}", command))
    }

    async fn mux(&self, command: &str) -> GatewayResult<String> {
        self.round_trip(format!("mux: {}", command), false).await?;
        Ok(format!("MOCK_RESPONSE: {}", command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_log_and_energize_tracking() {
        let gateway = MockGateway::new();
        gateway.pulser("P500").await.unwrap();
        assert!(gateway.is_energized());
        gateway.pulser("P0").await.unwrap();
        assert!(!gateway.is_energized());

        assert_eq!(gateway.call_log(), vec!["pulser: P500", "pulser: P0"]);
        gateway.clear_log();
        assert!(gateway.call_log().is_empty());
    }

    #[tokio::test]
    async fn test_acquisition_failure_injection() {
        let gateway = MockGateway::new();
        gateway.fail_next_acquisitions(1);

        assert!(gateway.mux("X0,1").await.is_ok());
        let params = PulseParameters::default();
        assert!(matches!(
            gateway.acquire(&params).await,
            Err(GatewayError::Injected(_))
        ));
        assert!(gateway.acquire(&params).await.is_ok());
        assert_eq!(gateway.acquisition_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_recorded() {
        let gateway = MockGateway::new().with_latency(Duration::from_millis(100));
        let a = gateway.clone();
        let b = gateway.clone();

        let (ra, rb) = tokio::join!(a.mux("X0,1"), b.mux("X0,2"));
        ra.unwrap();
        rb.unwrap();
        assert_eq!(gateway.max_concurrency(), 2);
    }
}
