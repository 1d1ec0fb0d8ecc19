//! [`LaserController`] – therapeutic output and alignment beam.

use std::sync::Arc;

use lasercore_middleware::Notifier;
use lasercore_types::{DeviceConfig, DeviceKind, DeviceNotification, HardwareError};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::channel::ChannelOpener;
use crate::controller::ControllerCore;
use crate::registry::ChannelRegistry;

/// Last values the laser acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LaserState {
    pub power_watts: f64,
    pub emission: bool,
    pub aiming_beam: bool,
}

#[derive(Debug)]
pub struct LaserController {
    core: ControllerCore,
    state: Mutex<LaserState>,
}

impl LaserController {
    pub fn new(
        settings: DeviceConfig,
        registry: ChannelRegistry,
        opener: Arc<dyn ChannelOpener>,
        notifier: Notifier,
    ) -> Self {
        Self {
            core: ControllerCore::new(DeviceKind::Laser, settings, registry, opener, notifier),
            state: Mutex::new(LaserState::default()),
        }
    }

    pub fn core(&self) -> &ControllerCore {
        &self.core
    }

    /// Connect and bring the output to a known idle state.
    pub fn connect(&self, channel_id: &str) -> Result<(), HardwareError> {
        let _held = self.core.exclusive();
        self.core.connect(channel_id)?;
        self.safe_idle()
    }

    /// Output off, then release the channel. Idle failures are logged only.
    pub fn disconnect(&self) {
        let _held = self.core.exclusive();
        if self.core.is_connected() {
            if let Err(e) = self.safe_idle() {
                warn!(error = %e, "laser idle before disconnect failed");
            }
        }
        self.core.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn set_power(&self, watts: f64) -> Result<(), HardwareError> {
        self.core.transact(&format!("PWR {watts:.3}"))?;
        self.state.lock().power_watts = watts;
        self.core
            .notifier()
            .emit(DeviceNotification::PowerChanged { watts });
        Ok(())
    }

    /// Ask the device for its present power setting.
    pub fn read_power(&self) -> Result<f64, HardwareError> {
        let watts = self.core.query_f64("PWR?")?;
        self.state.lock().power_watts = watts;
        Ok(watts)
    }

    pub fn set_emission(&self, enabled: bool) -> Result<(), HardwareError> {
        self.core.transact(if enabled { "EMIT 1" } else { "EMIT 0" })?;
        let changed = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.emission, enabled) != enabled
        };
        if changed {
            self.core
                .notifier()
                .emit(DeviceNotification::EmissionChanged { enabled });
        }
        Ok(())
    }

    pub fn set_aiming_beam(&self, on: bool) -> Result<(), HardwareError> {
        self.core.transact(if on { "AIM 1" } else { "AIM 0" })?;
        self.state.lock().aiming_beam = on;
        self.core
            .notifier()
            .emit(DeviceNotification::AimingBeamChanged { on });
        Ok(())
    }

    /// Power to zero and emission off under one lock. Both steps are always
    /// attempted; the first failure is returned. The aiming beam is left as
    /// it is.
    pub fn safe_idle(&self) -> Result<(), HardwareError> {
        let _held = self.core.exclusive();
        let power = self.set_power(0.0);
        let emission = self.set_emission(false);
        info!("laser output idled");
        power.and(emission)
    }

    /// Cached state; no I/O.
    pub fn state(&self) -> LaserState {
        *self.state.lock()
    }

    /// Last power the device acknowledged.
    pub fn commanded_watts(&self) -> f64 {
        self.state.lock().power_watts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimLaser, SimOpener, SimOptics};

    fn laser() -> (LaserController, SimOptics) {
        let optics = SimOptics::default();
        let mut opener = SimOpener::new();
        opener.attach("sim:laser", SimLaser::new(optics.clone()));
        let (notifier, _) = Notifier::in_memory();
        let controller = LaserController::new(
            DeviceConfig::on("sim:laser"),
            ChannelRegistry::new(),
            Arc::new(opener),
            notifier,
        );
        (controller, optics)
    }

    #[test]
    fn power_is_cached_after_acknowledgement() {
        let (laser, optics) = laser();
        laser.connect("sim:laser").unwrap();
        laser.set_power(2.5).unwrap();
        assert_eq!(laser.commanded_watts(), 2.5);
        assert_eq!(laser.read_power().unwrap(), 2.5);
        assert_eq!(optics.state().power_watts, 2.5);
    }

    #[test]
    fn rejected_power_keeps_the_cache() {
        let (laser, _) = laser();
        laser.connect("sim:laser").unwrap();
        laser.set_power(1.0).unwrap();
        assert!(matches!(
            laser.set_power(500.0),
            Err(HardwareError::Rejected { .. })
        ));
        assert_eq!(laser.commanded_watts(), 1.0);
    }

    #[test]
    fn safe_idle_keeps_the_aiming_beam() {
        let (laser, optics) = laser();
        laser.connect("sim:laser").unwrap();
        laser.set_aiming_beam(true).unwrap();
        laser.set_power(3.0).unwrap();
        laser.set_emission(true).unwrap();

        laser.safe_idle().unwrap();
        let state = laser.state();
        assert_eq!(state.power_watts, 0.0);
        assert!(!state.emission);
        assert!(state.aiming_beam);
        assert!(optics.state().aiming_beam);
    }

    #[test]
    fn disconnect_idles_the_output() {
        let (laser, optics) = laser();
        laser.connect("sim:laser").unwrap();
        laser.set_power(3.0).unwrap();
        laser.set_emission(true).unwrap();
        laser.disconnect();
        assert!(!laser.is_connected());
        assert!(!optics.state().emission);
        assert_eq!(optics.state().power_watts, 0.0);
    }
}
