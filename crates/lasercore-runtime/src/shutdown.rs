//! [`ShutdownGuard`] – removes laser output whenever permission goes away,
//! whether or not a protocol is running.
//!
//! The guard watches the monitor's snapshots and runs
//! [`DeviceSet::selective_shutdown`] on every edge from permitted to not
//! permitted, and on every entry into `EmergencyStop`. Positioning, thermal
//! regulation and the camera keep running.

use std::sync::Arc;

use lasercore_hal::DeviceSet;
use lasercore_kernel::SafetyMonitor;
use lasercore_middleware::Notifier;
use lasercore_types::{EventPayload, SafetySnapshot, SafetyState};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SOURCE: &str = "lasercore-runtime::shutdown";

pub struct ShutdownGuard {
    cancel: CancellationToken,
    task: JoinHandle<u32>,
}

/// Whether moving from `before` to `after` must remove laser output.
pub fn needs_shutdown(before: &SafetySnapshot, after: &SafetySnapshot) -> bool {
    let lost = before.laser_permitted && !after.laser_permitted;
    let stopped = before.state != SafetyState::EmergencyStop && after.state == SafetyState::EmergencyStop;
    lost || stopped
}

impl ShutdownGuard {
    /// Spawn the watcher. Must be called from within a Tokio runtime.
    pub fn spawn(monitor: &SafetyMonitor, devices: Arc<DeviceSet>, notifier: Notifier) -> Self {
        let cancel = CancellationToken::new();
        let mut rx = monitor.subscribe();
        let stop = cancel.clone();
        let task = tokio::spawn(async move {
            let mut last = rx.borrow_and_update().clone();
            let mut shutdowns = 0;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let now = rx.borrow_and_update().clone();
                        if needs_shutdown(&last, &now) {
                            warn!(state = %now.state, missing = ?now.interlocks.missing(), "laser permission lost, removing output");
                            shutdowns += 1;
                            let devices = Arc::clone(&devices);
                            let done = tokio::task::spawn_blocking(move || devices.selective_shutdown()).await;
                            match done {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => report(&notifier, format!("selective shutdown failed: {e}")),
                                Err(e) => report(&notifier, format!("selective shutdown task failed: {e}")),
                            }
                        }
                        last = now;
                    }
                }
            }
            info!(shutdowns, "shutdown guard stopped");
            shutdowns
        });
        Self { cancel, task }
    }

    /// Stop watching. Returns how many shutdowns the guard performed.
    pub async fn stop(self) -> u32 {
        self.cancel.cancel();
        self.task.await.unwrap_or(0)
    }
}

fn report(notifier: &Notifier, message: String) {
    error!(%message, "shutdown guard fault");
    notifier.record(
        SOURCE,
        EventPayload::Fault {
            component: "shutdown-guard".into(),
            message,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use lasercore_hal::SimBench;
    use lasercore_types::{InterlockField, OperatorCommand, StartupConfig};

    fn snapshot(state: SafetyState, laser_permitted: bool) -> SafetySnapshot {
        SafetySnapshot {
            state,
            laser_permitted,
            ..SafetySnapshot::initial()
        }
    }

    #[test]
    fn edges_that_need_a_shutdown() {
        let treating = snapshot(SafetyState::Treating, true);
        let unsafe_ = snapshot(SafetyState::Unsafe, false);
        let safe = snapshot(SafetyState::Safe, false);
        let estop = snapshot(SafetyState::EmergencyStop, false);
        assert!(needs_shutdown(&treating, &unsafe_));
        assert!(needs_shutdown(&safe, &estop));
        assert!(!needs_shutdown(&unsafe_, &safe));
        assert!(!needs_shutdown(&estop, &estop));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn estop_idles_the_laser_without_a_run() {
        let bench = SimBench::start(&StartupConfig::simulated()).unwrap();
        let monitor = SafetyMonitor::new(bench.notifier.clone());
        let guard = ShutdownGuard::spawn(&monitor, Arc::clone(&bench.devices), bench.notifier.clone());

        bench.devices.arm_emission().unwrap();
        bench.devices.laser().set_power(3.0).unwrap();
        assert!(bench.optics.state().emission);

        monitor.command(OperatorCommand::EmergencyStop).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while bench.optics.state().emission {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("emission still on after EStop");
        assert_eq!(bench.optics.state().power_watts, 0.0);
        assert!(!bench.optics.state().enable_line);

        monitor.signal(InterlockField::FootpedalPressed, false);
        assert_eq!(guard.stop().await, 1);
        bench.devices.disconnect_all();
    }
}
