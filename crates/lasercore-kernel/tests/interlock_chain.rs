//! The full interlock chain against simulated hardware: MCU controller →
//! bus → aggregator → monitor → permission watch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lasercore_hal::SimBench;
use lasercore_kernel::{InterlockAggregator, SafetyMonitor};
use lasercore_middleware::Notifier;
use lasercore_types::{DeviceKind, OperatorCommand, SafetySnapshot, SafetyState, StartupConfig};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

struct Rig {
    bench: SimBench,
    monitor: Arc<SafetyMonitor>,
    cancel: CancellationToken,
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.bench.devices.disconnect_all();
    }
}

async fn wait_until(
    rx: &mut watch::Receiver<SafetySnapshot>,
    within: Duration,
    f: impl FnMut(&SafetySnapshot) -> bool,
) -> SafetySnapshot {
    tokio::time::timeout(within, rx.wait_for(f))
        .await
        .expect("condition not reached in time")
        .expect("monitor dropped")
        .clone()
}

async fn treating(config: StartupConfig) -> Rig {
    let (notifier, _) = Notifier::in_memory();
    let monitor = Arc::new(SafetyMonitor::new(notifier.clone()));
    let cancel = CancellationToken::new();
    InterlockAggregator::new(Arc::clone(&monitor), &config).spawn(notifier.bus(), cancel.clone());

    let bench = SimBench::start_with(&config, notifier).expect("bench connects");
    bench.interlock.set_footpedal(true);
    monitor.command(OperatorCommand::StartSession).unwrap();

    let mut rx = monitor.subscribe();
    wait_until(&mut rx, Duration::from_secs(2), |s| s.state == SafetyState::Armed).await;
    monitor.command(OperatorCommand::BeginTreatment).unwrap();
    assert!(monitor.snapshot().treatment_permitted());
    Rig { bench, monitor, cancel }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn footpedal_release_removes_permission_within_50ms() {
    let config = StartupConfig::simulated();
    let rig = treating(config.clone()).await;
    let mut rx = rig.monitor.subscribe();

    let released = Instant::now();
    rig.bench.interlock.set_footpedal(false);
    let snap = wait_until(&mut rx, Duration::from_secs(1), |s| !s.laser_permitted).await;
    let reaction = released.elapsed();

    assert!(
        reaction <= Duration::from_millis(config.thresholds.footpedal_response_ms),
        "permission lost after {reaction:?}"
    );
    assert_eq!(snap.state, SafetyState::Unsafe);
    assert!(!snap.interlocks.footpedal_pressed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeat_starvation_forces_unsafe() {
    let mut config = StartupConfig::simulated();
    config.interlock.command_timeout_ms = 50;
    let rig = treating(config).await;
    let mut rx = rig.monitor.subscribe();

    let starved = Instant::now();
    rig.bench
        .faults(DeviceKind::Interlock)
        .expect("interlock is simulated")
        .swallow(Some("HB"));

    let snap = wait_until(&mut rx, Duration::from_secs(3), |s| s.state == SafetyState::Unsafe).await;
    assert!(starved.elapsed() >= Duration::from_millis(400), "tripped too early");
    assert!(!snap.interlocks.watchdog_ok);
    assert!(snap.interlocks.footpedal_pressed);
    assert!(snap.interlocks.gpio_link_ok);
    assert!(snap.interlocks.session_valid);
    assert!(snap.interlocks.photodiode_power_ok);
    assert!(!snap.laser_permitted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unplugging_the_mcu_clears_the_link() {
    let rig = treating(StartupConfig::simulated()).await;
    let mut rx = rig.monitor.subscribe();
    rig.bench
        .faults(DeviceKind::Interlock)
        .expect("interlock is simulated")
        .unplug();
    let snap = wait_until(&mut rx, Duration::from_secs(2), |s| !s.interlocks.gpio_link_ok).await;
    assert!(!snap.laser_permitted);
    assert_ne!(snap.state, SafetyState::Treating);
}
