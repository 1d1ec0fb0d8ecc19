//! [`InterlockController`] – the safety microcontroller.
//!
//! Besides the usual command cycle the controller runs one background thread
//! that
//!
//! - sends `HB` every heartbeat period (500 ms by default); the MCU drops the
//!   laser-enable line in hardware when no heartbeat arrives within its
//!   watchdog timeout (1000 ms by default), whatever the host is doing;
//! - polls `STAT?` and `PD?` every status-poll period and emits
//!   footpedal / watchdog / laser-enable changes and photodiode readings;
//! - repeats the current levels after every acknowledged heartbeat.
//!
//! The thread shares the controller lock with every other caller, so polls
//! never interleave with operator commands on the wire.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use lasercore_middleware::Notifier;
use lasercore_types::{
    DeviceConfig, DeviceKind, DeviceNotification, HardwareError, WatchdogConfig,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channel::ChannelOpener;
use crate::controller::ControllerCore;
use crate::registry::ChannelRegistry;

/// Latest values reported by the MCU. `None` until the first poll.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InterlockReadings {
    pub footpedal_pressed: Option<bool>,
    pub watchdog_ok: Option<bool>,
    pub laser_enable: Option<bool>,
    pub photodiode_watts: Option<f64>,
    pub last_heartbeat: Option<Instant>,
}

struct Inner {
    core: ControllerCore,
    watchdog: WatchdogConfig,
    readings: Mutex<InterlockReadings>,
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct InterlockController {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl InterlockController {
    pub fn new(
        settings: DeviceConfig,
        watchdog: WatchdogConfig,
        registry: ChannelRegistry,
        opener: Arc<dyn ChannelOpener>,
        notifier: Notifier,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: ControllerCore::new(
                    DeviceKind::Interlock,
                    settings,
                    registry,
                    opener,
                    notifier,
                ),
                watchdog,
                readings: Mutex::new(InterlockReadings::default()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn core(&self) -> &ControllerCore {
        &self.inner.core
    }

    /// Connect, program the MCU watchdog, send the first heartbeat and start
    /// the heartbeat/poll thread.
    pub fn connect(&self, channel_id: &str) -> Result<(), HardwareError> {
        let already = self.inner.core.is_connected()
            && self.inner.core.channel_id().as_deref() == Some(channel_id);
        if already {
            return Ok(());
        }
        self.stop_worker();
        // Readings from a previous link must not mask the first poll.
        *self.inner.readings.lock() = InterlockReadings::default();
        {
            let _held = self.inner.core.exclusive();
            self.inner.core.connect(channel_id)?;
            self.configure_watchdog()?;
            self.heartbeat()?;
            self.poll_status()?;
        }
        self.start_worker()
    }

    /// Stop the thread, drop the laser-enable line and release the channel.
    pub fn disconnect(&self) {
        self.stop_worker();
        if self.inner.core.is_connected() {
            if let Err(e) = self.set_laser_enable(false) {
                warn!(error = %e, "laser-enable release before disconnect failed");
            }
        }
        self.inner.core.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.core.is_connected()
    }

    pub fn configure_watchdog(&self) -> Result<(), HardwareError> {
        let wd = &self.inner.watchdog;
        self.inner
            .core
            .transact(&format!("WDT {} {}", wd.heartbeat_period_ms, wd.timeout_ms))
            .map(|_| ())
    }

    pub fn heartbeat(&self) -> Result<(), HardwareError> {
        self.inner.heartbeat()
    }

    pub fn poll_status(&self) -> Result<InterlockReadings, HardwareError> {
        self.inner.poll_status()
    }

    pub fn read_photodiode(&self) -> Result<f64, HardwareError> {
        self.inner.read_photodiode()
    }

    /// Drive the MCU laser-enable line. The MCU refuses to raise it while its
    /// watchdog is tripped.
    pub fn set_laser_enable(&self, enabled: bool) -> Result<(), HardwareError> {
        self.inner
            .core
            .transact(if enabled { "LEN 1" } else { "LEN 0" })?;
        self.inner.update(|r| &mut r.laser_enable, enabled, |enabled| {
            DeviceNotification::LaserEnableLine { enabled }
        });
        Ok(())
    }

    pub fn readings(&self) -> InterlockReadings {
        *self.inner.readings.lock()
    }

    fn start_worker(&self) -> Result<(), HardwareError> {
        let stop = Arc::new(AtomicBool::new(false));
        let inner = Arc::clone(&self.inner);
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("lasercore-interlock".into())
            .spawn(move || inner.run(&flag))
            .map_err(|e| HardwareError::ChannelLost {
                device: DeviceKind::Interlock,
                details: format!("cannot start heartbeat thread: {e}"),
            })?;
        *self.worker.lock() = Some(Worker { stop, handle });
        Ok(())
    }

    fn stop_worker(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop.store(true, Ordering::SeqCst);
            if worker.handle.join().is_err() {
                warn!("heartbeat thread panicked");
            }
        }
    }
}

impl Drop for InterlockController {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

impl std::fmt::Debug for InterlockController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterlockController")
            .field("core", &self.inner.core)
            .field("readings", &*self.inner.readings.lock())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn run(&self, stop: &AtomicBool) {
        let period = self.watchdog.heartbeat_period();
        let poll = self.watchdog.status_poll();
        let mut last_beat = Instant::now();
        info!(?period, ?poll, "heartbeat thread started");
        while !stop.load(Ordering::SeqCst) && self.core.is_connected() {
            if last_beat.elapsed() >= period {
                match self.heartbeat() {
                    Ok(()) => self.repeat_levels(),
                    Err(e) => debug!(error = %e, "heartbeat not acknowledged"),
                }
                last_beat = Instant::now();
            }
            if let Err(e) = self.poll_status() {
                debug!(error = %e, "status poll failed");
            }
            if let Err(e) = self.read_photodiode() {
                debug!(error = %e, "photodiode read failed");
            }
            thread::sleep(poll);
        }
        info!("heartbeat thread stopped");
    }

    fn heartbeat(&self) -> Result<(), HardwareError> {
        self.core.transact("HB")?;
        self.readings.lock().last_heartbeat = Some(Instant::now());
        self.core
            .notifier()
            .emit(DeviceNotification::HeartbeatAcknowledged);
        Ok(())
    }

    fn poll_status(&self) -> Result<InterlockReadings, HardwareError> {
        let flags = self.core.query_flags("STAT?", 3)?;
        self.update(|r| &mut r.footpedal_pressed, flags[0], |pressed| {
            DeviceNotification::FootpedalChanged { pressed }
        });
        self.update(|r| &mut r.watchdog_ok, flags[1], |ok| {
            DeviceNotification::WatchdogStatus { ok }
        });
        self.update(|r| &mut r.laser_enable, flags[2], |enabled| {
            DeviceNotification::LaserEnableLine { enabled }
        });
        Ok(*self.readings.lock())
    }

    fn read_photodiode(&self) -> Result<f64, HardwareError> {
        let watts = self.core.query_f64("PD?")?;
        self.readings.lock().photodiode_watts = Some(watts);
        self.core
            .notifier()
            .emit(DeviceNotification::PhotodiodePower { watts });
        Ok(watts)
    }

    /// Emit the last polled levels, once all of them are known.
    fn repeat_levels(&self) {
        let readings = *self.readings.lock();
        if let (Some(footpedal_pressed), Some(watchdog_ok), Some(laser_enable)) = (
            readings.footpedal_pressed,
            readings.watchdog_ok,
            readings.laser_enable,
        ) {
            self.core.notifier().emit(DeviceNotification::InterlockLevels {
                footpedal_pressed,
                watchdog_ok,
                laser_enable,
            });
        }
    }

    /// Store `value` and emit only when it differs from the last reading.
    fn update(
        &self,
        field: impl FnOnce(&mut InterlockReadings) -> &mut Option<bool>,
        value: bool,
        notification: impl FnOnce(bool) -> DeviceNotification,
    ) {
        let previous = {
            let mut readings = self.readings.lock();
            field(&mut readings).replace(value)
        };
        if previous != Some(value) {
            self.core.notifier().emit(notification(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimInterlock, SimOpener, SimOptics};
    use lasercore_middleware::Topic;
    use lasercore_types::EventPayload;
    use std::time::Duration;

    fn mcu(watchdog: WatchdogConfig) -> (InterlockController, SimInterlock, Notifier) {
        let sim = SimInterlock::new(SimOptics::default());
        let mut opener = SimOpener::new();
        opener.attach("sim:interlock", sim.clone());
        let (notifier, _) = Notifier::in_memory();
        let controller = InterlockController::new(
            DeviceConfig::on("sim:interlock"),
            watchdog,
            ChannelRegistry::new(),
            Arc::new(opener),
            notifier.clone(),
        );
        (controller, sim, notifier)
    }

    fn fast_watchdog() -> WatchdogConfig {
        WatchdogConfig {
            heartbeat_period_ms: 20,
            timeout_ms: 60,
            status_poll_ms: 5,
        }
    }

    #[test]
    fn connect_reports_initial_status() {
        let (mcu, _sim, _) = mcu(WatchdogConfig::default());
        mcu.connect("sim:interlock").unwrap();
        let readings = mcu.readings();
        assert_eq!(readings.footpedal_pressed, Some(false));
        assert_eq!(readings.watchdog_ok, Some(true));
        assert!(readings.last_heartbeat.is_some());
        mcu.disconnect();
    }

    #[test]
    fn laser_enable_follows_the_command() {
        let (mcu, sim, _) = mcu(WatchdogConfig::default());
        mcu.connect("sim:interlock").unwrap();
        mcu.set_laser_enable(true).unwrap();
        assert!(sim.laser_enable());
        mcu.set_laser_enable(false).unwrap();
        assert!(!sim.laser_enable());
        mcu.disconnect();
    }

    #[tokio::test]
    async fn footpedal_change_is_reported_by_the_poll_thread() {
        let (mcu, sim, notifier) = mcu(fast_watchdog());
        let mut rx = notifier.bus().subscribe_device(DeviceKind::Interlock);
        mcu.connect("sim:interlock").unwrap();
        sim.set_footpedal(true);

        let seen = tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(event) = rx.recv().await {
                if let EventPayload::Device {
                    notification: DeviceNotification::FootpedalChanged { pressed: true },
                    ..
                } = event.payload
                {
                    return true;
                }
            }
            false
        })
        .await;
        assert_eq!(seen, Ok(true));
        mcu.disconnect();
    }

    #[tokio::test]
    async fn levels_are_repeated_without_an_edge() {
        let (mcu, sim, notifier) = mcu(fast_watchdog());
        sim.set_footpedal(true);
        mcu.connect("sim:interlock").unwrap();
        let mut rx = notifier.bus().subscribe_device(DeviceKind::Interlock);

        // The pedal edge happened before the subscription; only the repeated
        // levels can tell this subscriber about it.
        let mut repeats = 0;
        tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(event) = rx.recv().await {
                if let EventPayload::Device {
                    notification:
                        DeviceNotification::InterlockLevels {
                            footpedal_pressed: true,
                            watchdog_ok: true,
                            ..
                        },
                    ..
                } = event.payload
                {
                    repeats += 1;
                    if repeats == 2 {
                        break;
                    }
                }
            }
        })
        .await
        .expect("levels were not repeated");
        mcu.disconnect();
    }

    #[test]
    fn heartbeats_keep_the_mcu_watchdog_alive() {
        let (mcu, sim, _) = mcu(fast_watchdog());
        mcu.connect("sim:interlock").unwrap();
        mcu.set_laser_enable(true).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert!(sim.watchdog_ok());
        assert!(sim.laser_enable());
        mcu.disconnect();
    }

    #[test]
    fn stopping_heartbeats_trips_the_mcu() {
        let (mcu, sim, notifier) = mcu(fast_watchdog());
        let mut rx = notifier.bus().subscribe_to(Topic::Devices);
        mcu.connect("sim:interlock").unwrap();
        mcu.set_laser_enable(true).unwrap();

        // Host stalls: the thread is gone but the channel stays open.
        mcu.stop_worker();
        std::thread::sleep(Duration::from_millis(120));
        assert!(!sim.watchdog_ok());
        assert!(!sim.laser_enable());
        assert!(matches!(
            mcu.set_laser_enable(true),
            Err(HardwareError::Rejected { ref code, .. }) if code == "WDT"
        ));

        let readings = mcu.poll_status().unwrap();
        assert_eq!(readings.watchdog_ok, Some(false));
        let mut saw_trip = false;
        while let Ok(event) = rx.try_recv() {
            if let EventPayload::Device {
                notification: DeviceNotification::WatchdogStatus { ok: false },
                ..
            } = event.payload
            {
                saw_trip = true;
            }
        }
        assert!(saw_trip);
        mcu.disconnect();
    }

    #[test]
    fn photodiode_reads_emitted_power() {
        let optics = SimOptics::default();
        let sim = SimInterlock::new(optics.clone());
        let mut opener = SimOpener::new();
        opener.attach("sim:interlock", sim);
        let (notifier, _) = Notifier::in_memory();
        let mcu = InterlockController::new(
            DeviceConfig::on("sim:interlock"),
            WatchdogConfig::default(),
            ChannelRegistry::new(),
            Arc::new(opener),
            notifier,
        );
        mcu.connect("sim:interlock").unwrap();
        mcu.set_laser_enable(true).unwrap();
        optics.drive(2.0, true);
        assert!((mcu.read_photodiode().unwrap() - 2.0).abs() < 1e-9);
        optics.set_bias(0.25);
        assert!((mcu.read_photodiode().unwrap() - 2.5).abs() < 1e-9);
        mcu.disconnect();
    }
}
