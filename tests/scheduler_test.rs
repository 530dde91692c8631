//! Fair-share scheduler tests over the mock rig, on the paused clock.

mod common;

use acoustics_daq::error::DaqError;
use acoustics_daq::error_recovery::RecoveryPolicy;
use acoustics_daq::experiment::{ExperimentSettings, Status};
use acoustics_daq::gateway::MockGateway;
use acoustics_daq::instrument::{PulseParameters, PulserProperties};
use acoustics_daq::scheduler::{fair_share_slice, JigRequest, SchedulerHandle, SchedulerTiming};
use acoustics_daq::storage::MemoryStore;
use common::{fast_recovery, mock_scheduler};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn timing() -> SchedulerTiming {
    SchedulerTiming {
        slice_baseline: Duration::from_secs(1),
        idle_poll: Duration::from_millis(100),
    }
}

fn request(id: &str, seconds: f64) -> JigRequest {
    JigRequest::new(
        ExperimentSettings::new(seconds / 3600.0, 1.0, id),
        PulseParameters::default(),
    )
}

async fn start_all(scheduler: &SchedulerHandle, count: usize) {
    for i in 0..count {
        scheduler
            .start_jig(&format!("jig{}", i), request(&format!("exp{}", i), 3600.0))
            .await
            .unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_two_jigs_never_overlap_on_the_rig() {
    let gateway = MockGateway::new().with_latency(Duration::from_millis(20));
    let store = MemoryStore::new();
    let scheduler = mock_scheduler(&gateway, Arc::new(store.clone()), 2, timing(), RecoveryPolicy::default());

    start_all(&scheduler, 2).await;

    // Calibration pulses race the loop from other tasks
    let mut calibrations = Vec::new();
    for _ in 0..3 {
        let handle = scheduler.clone();
        calibrations.push(tokio::spawn(async move {
            handle.pulse_jig("jig1", PulseParameters::default()).await
        }));
    }

    sleep(Duration::from_secs(10)).await;
    for calibration in calibrations {
        assert!(calibration.await.unwrap().is_ok());
    }

    assert_eq!(gateway.max_concurrency(), 1);
    assert!(store.record_count("exp0") >= 3);
    assert!(store.record_count("exp1") >= 3);
    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_records_accumulate_over_time() {
    let gateway = MockGateway::new();
    let store = MemoryStore::new();
    let scheduler = mock_scheduler(&gateway, Arc::new(store.clone()), 2, timing(), RecoveryPolicy::default());
    start_all(&scheduler, 2).await;

    sleep(Duration::from_secs(3)).await;
    let early = (store.record_count("exp0"), store.record_count("exp1"));
    sleep(Duration::from_secs(3)).await;
    let late = (store.record_count("exp0"), store.record_count("exp1"));

    assert!(late.0 > early.0);
    assert!(late.1 > early.1);
    assert_eq!(scheduler.pulse_count("jig0").unwrap(), late.0 as u64);
    assert!(scheduler.last_updated("jig0").unwrap().is_some());

    let record = &store.records("exp1")[0];
    assert_eq!(record.metadata["jig"], "jig1");
    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_per_jig_cadence_lengthens_with_load() {
    let window = Duration::from_secs(11);

    let lone_gateway = MockGateway::new();
    let lone = mock_scheduler(&lone_gateway, Arc::new(MemoryStore::new()), 3, timing(), RecoveryPolicy::default());
    start_all(&lone, 1).await;

    let busy_gateway = MockGateway::new();
    let busy = mock_scheduler(&busy_gateway, Arc::new(MemoryStore::new()), 3, timing(), RecoveryPolicy::default());
    start_all(&busy, 3).await;

    sleep(window).await;

    let lone_pulses = lone.pulse_count("jig0").unwrap();
    let busy_pulses = busy.pulse_count("jig0").unwrap();
    assert!(lone_pulses > 0 && busy_pulses > 0);
    assert!(
        busy_pulses < lone_pulses,
        "jig0 pulsed {} times alone but {} times sharing the rig",
        lone_pulses,
        busy_pulses
    );
    assert!(fair_share_slice(Duration::from_secs(1), 3) < fair_share_slice(Duration::from_secs(1), 1));

    lone.shutdown(Duration::from_secs(1)).await;
    busy.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_jig_does_not_stall_the_rig() {
    let gateway = MockGateway::new();
    let store = MemoryStore::new();
    let scheduler = mock_scheduler(
        &gateway,
        Arc::new(store.clone()),
        2,
        timing(),
        fast_recovery(Duration::from_secs(5)),
    );
    gateway.fail_next_acquisitions(1);
    start_all(&scheduler, 2).await;

    sleep(Duration::from_secs(2)).await;
    assert_eq!(scheduler.status("jig0").unwrap(), Status::Error);
    assert!(scheduler.last_error("jig0").unwrap().is_some());
    assert_eq!(store.record_count("exp0"), 0);
    assert!(store.record_count("exp1") >= 2);
    assert!(!gateway.is_energized());

    sleep(Duration::from_secs(6)).await;
    assert_eq!(scheduler.status("jig0").unwrap(), Status::Running);
    assert!(store.record_count("exp0") >= 1);
    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_expired_jig_is_stopped() {
    let gateway = MockGateway::new();
    let scheduler = mock_scheduler(&gateway, Arc::new(MemoryStore::new()), 1, timing(), RecoveryPolicy::default());

    scheduler.start_jig("jig0", request("short", 2.0)).await.unwrap();
    sleep(Duration::from_secs(4)).await;

    assert_eq!(scheduler.status("jig0").unwrap(), Status::Stopped);
    let pulses = gateway.acquisition_count();
    assert!(pulses > 0);

    sleep(Duration::from_secs(4)).await;
    assert_eq!(gateway.acquisition_count(), pulses);
    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_stopped_jig_gets_no_more_turns() {
    let gateway = MockGateway::new();
    let store = MemoryStore::new();
    let scheduler = mock_scheduler(&gateway, Arc::new(store.clone()), 2, timing(), RecoveryPolicy::default());
    start_all(&scheduler, 2).await;

    sleep(Duration::from_secs(3)).await;
    assert_eq!(scheduler.stop_jig("jig0").unwrap(), Status::Stopped);
    assert_eq!(scheduler.stop_jig("jig0").unwrap(), Status::Stopped);

    // A cycle in flight at the stop still lands its record
    sleep(Duration::from_secs(1)).await;
    let frozen = store.record_count("exp0");

    sleep(Duration::from_secs(3)).await;
    assert_eq!(store.record_count("exp0"), frozen);
    assert_eq!(scheduler.status("jig1").unwrap(), Status::Running);
    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_jig_stopped_mid_round_costs_no_slice() {
    let gateway = MockGateway::new();
    let store = MemoryStore::new();
    let timing = SchedulerTiming {
        slice_baseline: Duration::from_secs(30),
        idle_poll: Duration::from_millis(100),
    };
    let scheduler = mock_scheduler(&gateway, Arc::new(store.clone()), 2, timing, RecoveryPolicy::default());
    start_all(&scheduler, 2).await;

    // Two active jigs share 10 s slices; wait until jig0 has just been served
    sleep(Duration::from_secs(25)).await;
    let served = scheduler.pulse_count("jig0").unwrap();
    for _ in 0..400 {
        if scheduler.pulse_count("jig0").unwrap() > served {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    let served = scheduler.pulse_count("jig0").unwrap();
    let jig1_pulses = scheduler.pulse_count("jig1").unwrap();

    // jig1's turn comes up after one slice and is skipped
    scheduler.stop_jig("jig1").unwrap();
    sleep(Duration::from_secs(11)).await;

    assert_eq!(scheduler.pulse_count("jig0").unwrap(), served + 1);
    assert_eq!(scheduler.pulse_count("jig1").unwrap(), jig1_pulses);
    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_pulser_properties_follow_the_switch() {
    let gateway = MockGateway::new();
    let scheduler = mock_scheduler(&gateway, Arc::new(MemoryStore::new()), 2, timing(), RecoveryPolicy::default());

    let jig_request = request("tuned", 3600.0).with_pulser(PulserProperties::new(30.0));
    scheduler.start_jig("jig1", jig_request).await.unwrap();
    sleep(Duration::from_millis(500)).await;

    let log = gateway.call_log();
    assert_eq!(log[0], "mux: X0,1");
    assert_eq!(&log[1..4], &["pulser: M1", "pulser: W444", "pulser: G300"]);
    assert_eq!(log[4], "pulser: P500");
    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_control_plane_rejections() {
    let gateway = MockGateway::new();
    let store = MemoryStore::new();
    let scheduler = mock_scheduler(&gateway, Arc::new(store.clone()), 1, timing(), RecoveryPolicy::default());

    assert!(matches!(
        scheduler.start_jig("ghost", request("x", 60.0)).await,
        Err(DaqError::UnknownJig(_))
    ));
    assert!(matches!(scheduler.status("ghost"), Err(DaqError::UnknownJig(_))));
    assert!(matches!(
        scheduler.start_jig("jig0", request("", 60.0)).await,
        Err(DaqError::InvalidSettings(_))
    ));
    assert_eq!(store.open_count(), 0);

    scheduler.start_jig("jig0", request("real", 60.0)).await.unwrap();
    assert!(matches!(
        scheduler.start_jig("jig0", request("real", 60.0)).await,
        Err(DaqError::AlreadyRunning(_))
    ));
    assert_eq!(scheduler.jig_names(), vec!["jig0".to_string()]);
    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_out_of_range_duration_leaves_the_scheduler_running() {
    let gateway = MockGateway::new();
    let store = MemoryStore::new();
    let scheduler = mock_scheduler(&gateway, Arc::new(store.clone()), 2, timing(), RecoveryPolicy::default());
    start_all(&scheduler, 1).await;

    let huge = JigRequest::new(ExperimentSettings::new(1e16, 1.0, "huge"), PulseParameters::default());
    assert!(matches!(
        scheduler.start_jig("jig1", huge).await,
        Err(DaqError::InvalidSettings(_))
    ));
    assert_eq!(scheduler.status("jig1").unwrap(), Status::NotStarted);

    sleep(Duration::from_secs(2)).await;
    let before = store.record_count("exp0");
    sleep(Duration::from_secs(3)).await;

    assert!(scheduler.is_running());
    assert!(store.record_count("exp0") > before);
    assert_eq!(store.record_count("huge"), 0);
    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_calibration_pulse_targets_the_jig() {
    let gateway = MockGateway::new();
    let store = MemoryStore::new();
    let scheduler = mock_scheduler(&gateway, Arc::new(store.clone()), 3, timing(), RecoveryPolicy::default());

    let waveform = scheduler.pulse_jig("jig2", PulseParameters::default()).await.unwrap();

    assert!(waveform.contains_key("amps"));
    assert_eq!(gateway.call_log()[0], "mux: X0,2");
    assert_eq!(store.open_count(), 0);
    assert_eq!(scheduler.status("jig2").unwrap(), Status::NotStarted);
    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_everything() {
    let gateway = MockGateway::new();
    let scheduler = mock_scheduler(&gateway, Arc::new(MemoryStore::new()), 2, timing(), RecoveryPolicy::default());
    start_all(&scheduler, 2).await;
    sleep(Duration::from_secs(2)).await;

    scheduler.shutdown(Duration::from_secs(1)).await;

    assert!(!scheduler.is_running());
    assert_eq!(scheduler.status("jig0").unwrap(), Status::Stopped);
    assert!(matches!(
        scheduler.pulse_jig("jig0", PulseParameters::default()).await,
        Err(DaqError::SchedulerUnavailable)
    ));
}
