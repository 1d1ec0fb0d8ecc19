//! Three-line treatment against the simulated bench, through the assembled
//! [`LaserSystem`].
//!
//! | Line | Actions | Expected |
//! |---|---|---|
//! | 0 | move to 5 mm, laser 2 W, dwell 3 s | 3 s |
//! | 1 | move to 10 mm, ramp 2 → 5 W over 5 s | 5 s |
//! | 2 | home, laser 0 W | 2 s (10 mm at 5 mm/s) |

use std::time::{Duration, Instant};

use lasercore_middleware::Topic;
use lasercore_protocol::{LineBasedProtocol, ProtocolAction, ProtocolLine, RampCurve, SafetyLimits};
use lasercore_runtime::LaserSystem;
use lasercore_types::{
    AbortReason, EventPayload, ExecutionEvent, OperatorCommand, RunOutcome, SafetyState,
    StartupConfig,
};

fn scenario() -> LineBasedProtocol {
    LineBasedProtocol::new("three-line", SafetyLimits::default())
        .with_line(
            ProtocolLine::new()
                .with(ProtocolAction::move_absolute(5.0, 5.0))
                .with(ProtocolAction::laser_set(2.0))
                .with(ProtocolAction::dwell(3.0)),
        )
        .with_line(
            ProtocolLine::new()
                .with(ProtocolAction::move_absolute(10.0, 5.0))
                .with(ProtocolAction::ramp(2.0, 5.0, 5.0, RampCurve::Linear)),
        )
        .with_line(
            ProtocolLine::new()
                .with(ProtocolAction::Home)
                .with(ProtocolAction::laser_set(0.0)),
        )
}

async fn armed_system() -> LaserSystem {
    let system = LaserSystem::build(StartupConfig::simulated()).expect("system builds");
    system.connect_all().await.expect("simulated devices connect");
    system
        .bench()
        .expect("simulated")
        .interlock
        .set_footpedal(true);
    system.monitor().command(OperatorCommand::StartSession).unwrap();
    let mut rx = system.monitor().subscribe();
    tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| s.state == SafetyState::Armed))
        .await
        .expect("never armed")
        .unwrap();
    system
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_line_protocol_runs_in_order_for_the_sum_of_line_maxima() {
    let system = armed_system().await;
    let mut execution = system.notifier().bus().subscribe_to(Topic::Execution);

    let estimated = system
        .engine()
        .gate()
        .validator()
        .approve(scenario())
        .unwrap()
        .estimated_duration();
    assert_eq!(estimated, Duration::from_secs(10));

    let report = system.engine().start(scenario()).unwrap().wait().await;
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.lines_completed, 3);
    assert!(report.elapsed >= Duration::from_millis(9_900), "{:?}", report.elapsed);
    assert!(report.elapsed <= Duration::from_millis(12_500), "{:?}", report.elapsed);

    let mut started = Vec::new();
    let mut completed = Vec::new();
    while let Ok(event) = execution.try_recv() {
        match event.payload {
            EventPayload::Execution(ExecutionEvent::LineStarted { line, expected_s, .. }) => {
                started.push((line, expected_s))
            }
            EventPayload::Execution(ExecutionEvent::LineCompleted { line, elapsed_s, .. }) => {
                completed.push((line, elapsed_s))
            }
            _ => {}
        }
    }
    assert_eq!(started.iter().map(|(l, _)| *l).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(completed.iter().map(|(l, _)| *l).collect::<Vec<_>>(), vec![0, 1, 2]);
    for ((_, expected), (line, took)) in started.iter().zip(&completed) {
        assert!(
            *took >= expected - 0.05 && *took <= expected + 0.8,
            "line {line}: took {took:.3}s, expected {expected:.3}s"
        );
    }

    let bench = system.bench().unwrap();
    assert!(bench.actuator.position_mm().abs() < 0.05);
    assert_eq!(bench.optics.output_watts(), 0.0);
    assert_eq!(system.monitor().state(), SafetyState::Armed);
    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn footpedal_release_during_the_ramp_aborts_at_once() {
    let system = armed_system().await;
    let handle = system.engine().start(scenario()).unwrap();

    let mut progress = handle.progress();
    tokio::time::timeout(Duration::from_secs(6), progress.wait_for(|c| c.line_index == 1))
        .await
        .expect("line 1 never started")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let bench = system.bench().unwrap();
    assert!(bench.optics.output_watts() > 2.0);

    let released = Instant::now();
    bench.interlock.set_footpedal(false);
    let report = handle.wait().await;
    let reaction = released.elapsed();

    assert_eq!(
        report.outcome,
        RunOutcome::Aborted {
            reason: AbortReason::PermissionLost {
                state: SafetyState::Unsafe
            }
        }
    );
    assert!(reaction < Duration::from_millis(500), "aborted after {reaction:?}");
    assert_eq!(report.lines_completed, 1);
    assert_eq!(bench.optics.output_watts(), 0.0);
    assert!(!bench.optics.state().emission);
    assert_eq!(system.monitor().state(), SafetyState::Unsafe);
    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nothing_runs_before_the_device_is_armed() {
    let system = LaserSystem::build(StartupConfig::simulated()).unwrap();
    system.connect_all().await.unwrap();
    let err = system.engine().start(scenario()).unwrap_err();
    assert_eq!(
        err,
        lasercore_types::ExecutionError::NotPermitted {
            state: SafetyState::Safe
        }
    );
    assert!(!system.engine().is_running());
    system.shutdown().await;
}
