//! [`InterlockAggregator`] – turns controller notifications into interlock
//! signals for the [`SafetyMonitor`].
//!
//! | Notification | Interlock |
//! |---|---|
//! | interlock `ConnectionChanged` | `gpio_link_ok` (and pedal/watchdog cleared on loss) |
//! | `FootpedalChanged` | `footpedal_pressed` |
//! | `HeartbeatAcknowledged`, `WatchdogStatus` | `watchdog_ok` via [`WatchdogSupervisor`] |
//! | `PhotodiodePower` against laser power/emission/enable line | `photodiode_power_ok` via [`PowerDeviationCheck`] |
//! | `InterlockLevels` | pedal, MCU watchdog and enable line, repeated |
//!
//! `session_valid` is driven by operator commands only.
//!
//! Pedal and watchdog notifications are edges. When the task falls behind the
//! device topic and events are dropped, it assumes the worst: pedal released,
//! watchdog unknown, photodiode verdict pending. The repeated levels restore
//! the true values within one heartbeat period.

use std::sync::Arc;

use lasercore_middleware::{EventBus, Topic};
use lasercore_types::{DeviceKind, DeviceNotification, EventPayload, InterlockField, StartupConfig};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::machine::SafetyInput;
use crate::monitor::SafetyMonitor;
use crate::photodiode::PowerDeviationCheck;
use crate::watchdog::WatchdogSupervisor;

/// What the laser has been told to do, as far as notifications show.
#[derive(Debug, Default, Clone, Copy)]
struct LaserOutput {
    watts: f64,
    emission: bool,
    enable_line: bool,
}

impl LaserOutput {
    fn expected_watts(&self) -> f64 {
        if self.emission && self.enable_line {
            self.watts
        } else {
            0.0
        }
    }
}

pub struct InterlockAggregator {
    monitor: Arc<SafetyMonitor>,
    watchdog: WatchdogSupervisor,
    power: PowerDeviationCheck,
    laser: LaserOutput,
    photodiode_ok: Option<bool>,
    tick_every: std::time::Duration,
}

impl InterlockAggregator {
    pub fn new(monitor: Arc<SafetyMonitor>, config: &StartupConfig) -> Self {
        Self {
            monitor,
            watchdog: WatchdogSupervisor::new(&config.watchdog),
            power: PowerDeviationCheck::new(&config.thresholds),
            laser: LaserOutput::default(),
            photodiode_ok: None,
            tick_every: config.watchdog.status_poll(),
        }
    }

    pub fn handle(&mut self, device: DeviceKind, notification: &DeviceNotification) {
        match (device, notification) {
            (DeviceKind::Interlock, DeviceNotification::ConnectionChanged { connected, .. }) => {
                self.monitor.signal(InterlockField::GpioLinkOk, *connected);
                if !connected {
                    self.watchdog.link_lost();
                    self.monitor.signal(InterlockField::FootpedalPressed, false);
                    self.laser.enable_line = false;
                    self.refresh_expected();
                    self.tick();
                }
            }
            (DeviceKind::Interlock, DeviceNotification::FootpedalChanged { pressed }) => {
                self.monitor.signal(InterlockField::FootpedalPressed, *pressed);
            }
            (DeviceKind::Interlock, DeviceNotification::HeartbeatAcknowledged) => {
                self.watchdog.heartbeat_acknowledged();
                self.tick();
            }
            (DeviceKind::Interlock, DeviceNotification::WatchdogStatus { ok }) => {
                self.watchdog.mcu_status(*ok);
                self.tick();
            }
            (DeviceKind::Interlock, DeviceNotification::LaserEnableLine { enabled }) => {
                self.laser.enable_line = *enabled;
                self.refresh_expected();
            }
            (
                DeviceKind::Interlock,
                DeviceNotification::InterlockLevels {
                    footpedal_pressed,
                    watchdog_ok,
                    laser_enable,
                },
            ) => {
                self.monitor.signal(InterlockField::FootpedalPressed, *footpedal_pressed);
                self.watchdog.mcu_status(*watchdog_ok);
                if self.laser.enable_line != *laser_enable {
                    self.laser.enable_line = *laser_enable;
                    self.refresh_expected();
                }
                self.tick();
            }
            (DeviceKind::Interlock, DeviceNotification::PhotodiodePower { watts }) => {
                self.photodiode(*watts);
            }
            (DeviceKind::Laser, DeviceNotification::PowerChanged { watts }) => {
                self.laser.watts = *watts;
                self.refresh_expected();
            }
            (DeviceKind::Laser, DeviceNotification::EmissionChanged { enabled }) => {
                self.laser.emission = *enabled;
                self.refresh_expected();
            }
            (DeviceKind::Laser, DeviceNotification::ConnectionChanged { connected: false, .. }) => {
                self.laser.emission = false;
                self.refresh_expected();
            }
            _ => {}
        }
    }

    /// Notifications were dropped; edges may have been missed.
    pub fn lagged(&mut self, missed: u64) {
        warn!(missed, "aggregator fell behind the device topic, failing safe");
        self.monitor.signal(InterlockField::FootpedalPressed, false);
        self.watchdog.link_lost();
        self.tick();
        self.photodiode_ok = None;
    }

    /// Re-check time-based conditions (heartbeat starvation).
    pub fn tick(&mut self) {
        if let Some(input) = self.watchdog.evaluate() {
            self.forward(input);
        }
    }

    /// Run until `cancel` fires or the bus closes.
    pub fn spawn(mut self, bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = bus.subscribe_to(Topic::Devices);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("interlock aggregator started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.tick(),
                    received = rx.recv() => match received {
                        Ok(event) => {
                            if let EventPayload::Device { device, notification } = &event.payload {
                                self.handle(*device, notification);
                            }
                        }
                        Err(RecvError::Lagged(n)) => self.lagged(n),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            info!("interlock aggregator stopped");
        })
    }

    fn refresh_expected(&mut self) {
        self.power.expect(self.laser.expected_watts());
    }

    fn photodiode(&mut self, watts: f64) {
        let ok = match self.power.sample(watts) {
            Ok(()) => {
                if self.photodiode_ok != Some(true) {
                    self.monitor.signal(InterlockField::PhotodiodePowerOk, true);
                }
                true
            }
            Err(violation) => {
                if self.photodiode_ok != Some(false) {
                    self.monitor.violation(violation);
                }
                false
            }
        };
        if self.photodiode_ok != Some(ok) {
            debug!(watts, expected = self.power.expected(), ok, "photodiode verdict changed");
        }
        self.photodiode_ok = Some(ok);
    }

    fn forward(&self, input: SafetyInput) {
        match input {
            SafetyInput::Signal(field, value) => {
                self.monitor.signal(field, value);
            }
            SafetyInput::Violation(violation) => {
                self.monitor.violation(violation);
            }
            SafetyInput::Command(command) => {
                if let Err(e) = self.monitor.command(command) {
                    warn!(error = %e, ?command, "aggregator command rejected");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lasercore_middleware::Notifier;
    use lasercore_types::{OperatorCommand, SafetyState};

    fn aggregator() -> (InterlockAggregator, Arc<SafetyMonitor>) {
        let (notifier, _) = Notifier::in_memory();
        let monitor = Arc::new(SafetyMonitor::new(notifier));
        let agg = InterlockAggregator::new(Arc::clone(&monitor), &StartupConfig::simulated());
        (agg, monitor)
    }

    fn healthy(agg: &mut InterlockAggregator) {
        use DeviceNotification as N;
        let il = DeviceKind::Interlock;
        agg.handle(il, &N::ConnectionChanged { connected: true, channel: Some("sim:interlock".into()) });
        agg.handle(il, &N::HeartbeatAcknowledged);
        agg.handle(il, &N::WatchdogStatus { ok: true });
        agg.handle(il, &N::FootpedalChanged { pressed: true });
        agg.handle(il, &N::PhotodiodePower { watts: 0.0 });
    }

    #[test]
    fn healthy_hardware_arms_a_session() {
        let (mut agg, monitor) = aggregator();
        monitor.command(OperatorCommand::StartSession).unwrap();
        healthy(&mut agg);
        let snap = monitor.snapshot();
        assert!(snap.interlocks.all(), "{:?}", snap.interlocks);
        assert_eq!(snap.state, SafetyState::Armed);
    }

    #[test]
    fn link_loss_clears_link_pedal_and_watchdog() {
        let (mut agg, monitor) = aggregator();
        monitor.command(OperatorCommand::StartSession).unwrap();
        healthy(&mut agg);
        agg.handle(
            DeviceKind::Interlock,
            &DeviceNotification::ConnectionChanged { connected: false, channel: None },
        );
        let snap = monitor.snapshot();
        assert!(!snap.interlocks.gpio_link_ok);
        assert!(!snap.interlocks.footpedal_pressed);
        assert!(!snap.interlocks.watchdog_ok);
        assert_eq!(snap.state, SafetyState::Unsafe);
    }

    #[test]
    fn photodiode_tracks_the_commanded_output() {
        use DeviceNotification as N;
        let (mut agg, monitor) = aggregator();
        monitor.command(OperatorCommand::StartSession).unwrap();
        healthy(&mut agg);
        agg.handle(DeviceKind::Laser, &N::PowerChanged { watts: 2.0 });
        agg.handle(DeviceKind::Interlock, &N::LaserEnableLine { enabled: true });
        agg.handle(DeviceKind::Laser, &N::EmissionChanged { enabled: true });
        for _ in 0..5 {
            agg.handle(DeviceKind::Interlock, &N::PhotodiodePower { watts: 2.05 });
        }
        assert!(monitor.snapshot().interlocks.photodiode_power_ok);

        for _ in 0..3 {
            agg.handle(DeviceKind::Interlock, &N::PhotodiodePower { watts: 1.2 });
        }
        let snap = monitor.snapshot();
        assert!(!snap.interlocks.photodiode_power_ok);
        assert_eq!(snap.state, SafetyState::Unsafe);
    }

    #[test]
    fn mcu_watchdog_trip_is_a_loss() {
        let (mut agg, monitor) = aggregator();
        healthy(&mut agg);
        assert!(monitor.snapshot().interlocks.watchdog_ok);
        agg.handle(DeviceKind::Interlock, &DeviceNotification::WatchdogStatus { ok: false });
        assert!(!monitor.snapshot().interlocks.watchdog_ok);
    }

    #[test]
    fn rejected_forwarded_command_leaves_the_state_alone() {
        let (agg, monitor) = aggregator();
        let before = monitor.state();
        agg.forward(SafetyInput::Command(OperatorCommand::EndTreatment));
        assert_eq!(monitor.state(), before);
    }

    #[test]
    fn falling_behind_fails_safe_until_levels_repeat() {
        use DeviceNotification as N;
        let (mut agg, monitor) = aggregator();
        monitor.command(OperatorCommand::StartSession).unwrap();
        healthy(&mut agg);
        assert_eq!(monitor.state(), SafetyState::Armed);

        agg.lagged(12);
        let snap = monitor.snapshot();
        assert!(!snap.interlocks.footpedal_pressed);
        assert!(!snap.interlocks.watchdog_ok);
        assert_eq!(snap.state, SafetyState::Unsafe);

        let il = DeviceKind::Interlock;
        agg.handle(il, &N::HeartbeatAcknowledged);
        agg.handle(
            il,
            &N::InterlockLevels {
                footpedal_pressed: true,
                watchdog_ok: true,
                laser_enable: false,
            },
        );
        let snap = monitor.snapshot();
        assert!(snap.interlocks.footpedal_pressed);
        assert!(snap.interlocks.watchdog_ok);
        // Recovery from Unsafe still needs the operator.
        assert_eq!(snap.state, SafetyState::Unsafe);
        monitor.command(OperatorCommand::Reset).unwrap();
        assert_eq!(monitor.state(), SafetyState::Armed);
    }

    #[tokio::test]
    async fn release_buried_under_photodiode_traffic_still_lands() {
        let (notifier, _) = Notifier::in_memory();
        let monitor = Arc::new(SafetyMonitor::new(notifier.clone()));
        let agg = InterlockAggregator::new(Arc::clone(&monitor), &StartupConfig::simulated());
        let cancel = CancellationToken::new();
        let task = agg.spawn(notifier.bus(), cancel.clone());
        let mut rx = monitor.subscribe();
        let device = |notification: DeviceNotification| EventPayload::Device {
            device: DeviceKind::Interlock,
            notification,
        };
        let source = DeviceKind::Interlock.source();

        notifier.notify(&source, device(DeviceNotification::FootpedalChanged { pressed: true }));
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            rx.wait_for(|s| s.interlocks.footpedal_pressed),
        )
        .await
        .expect("footpedal never reached the monitor")
        .unwrap();

        // Nothing yields between these sends on the current-thread runtime,
        // so the release is overwritten before the task can read it.
        notifier.notify(&source, device(DeviceNotification::FootpedalChanged { pressed: false }));
        for _ in 0..1100 {
            notifier.notify(&source, device(DeviceNotification::PhotodiodePower { watts: 0.0 }));
        }
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            rx.wait_for(|s| !s.interlocks.footpedal_pressed),
        )
        .await
        .expect("pedal release was lost")
        .unwrap();

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn spawned_task_follows_the_bus() {
        let (notifier, _) = Notifier::in_memory();
        let monitor = Arc::new(SafetyMonitor::new(notifier.clone()));
        let agg = InterlockAggregator::new(Arc::clone(&monitor), &StartupConfig::simulated());
        let cancel = CancellationToken::new();
        let task = agg.spawn(notifier.bus(), cancel.clone());
        let mut rx = monitor.subscribe();

        notifier.notify(
            &DeviceKind::Interlock.source(),
            EventPayload::Device {
                device: DeviceKind::Interlock,
                notification: DeviceNotification::FootpedalChanged { pressed: true },
            },
        );
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            rx.wait_for(|s| s.interlocks.footpedal_pressed),
        )
        .await
        .expect("footpedal never reached the monitor")
        .unwrap();

        cancel.cancel();
        task.await.unwrap();
    }
}
