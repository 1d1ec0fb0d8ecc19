//! [`DeviceSet`] – the four channelled controllers plus the optional camera.
//!
//! # Selective shutdown
//!
//! [`DeviceSet::selective_shutdown`] removes therapeutic laser output and
//! nothing else:
//!
//! | Device | Action |
//! |---|---|
//! | laser | power 0, emission off; aiming beam untouched |
//! | interlock MCU | laser-enable line off; heartbeat and polling continue |
//! | actuator | untouched (positioning stays available) |
//! | thermal | untouched (regulation continues) |
//! | camera | untouched (acquisition continues) |

use std::sync::Arc;

use lasercore_middleware::Notifier;
use lasercore_types::{DeviceKind, HardwareError, StartupConfig};
use tracing::{error, info, warn};

use crate::actuator::ActuatorController;
use crate::camera::CameraCapability;
use crate::channel::ChannelOpener;
use crate::interlock::InterlockController;
use crate::laser::LaserController;
use crate::registry::ChannelRegistry;
use crate::thermal::ThermalController;

pub struct DeviceSet {
    laser: LaserController,
    thermal: ThermalController,
    actuator: ActuatorController,
    interlock: InterlockController,
    camera: Option<Arc<dyn CameraCapability>>,
    registry: ChannelRegistry,
    config: StartupConfig,
}

impl DeviceSet {
    pub fn new(config: &StartupConfig, opener: Arc<dyn ChannelOpener>, notifier: Notifier) -> Self {
        let registry = ChannelRegistry::new();
        Self {
            laser: LaserController::new(
                config.laser.clone(),
                registry.clone(),
                Arc::clone(&opener),
                notifier.clone(),
            ),
            thermal: ThermalController::new(
                config.thermal.clone(),
                registry.clone(),
                Arc::clone(&opener),
                notifier.clone(),
            ),
            actuator: ActuatorController::new(
                config.actuator.clone(),
                registry.clone(),
                Arc::clone(&opener),
                notifier.clone(),
            ),
            interlock: InterlockController::new(
                config.interlock.clone(),
                config.watchdog.clone(),
                registry.clone(),
                opener,
                notifier,
            ),
            camera: None,
            registry,
            config: config.clone(),
        }
    }

    pub fn with_camera(mut self, camera: Arc<dyn CameraCapability>) -> Self {
        self.camera = Some(camera);
        self
    }

    pub fn laser(&self) -> &LaserController {
        &self.laser
    }

    pub fn thermal(&self) -> &ThermalController {
        &self.thermal
    }

    pub fn actuator(&self) -> &ActuatorController {
        &self.actuator
    }

    pub fn interlock(&self) -> &InterlockController {
        &self.interlock
    }

    pub fn camera(&self) -> Option<&Arc<dyn CameraCapability>> {
        self.camera.as_ref()
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &StartupConfig {
        &self.config
    }

    /// Connect one device. The camera ignores `channel_id` and starts
    /// acquiring.
    pub fn connect(&self, kind: DeviceKind, channel_id: &str) -> Result<(), HardwareError> {
        match kind {
            DeviceKind::Laser => self.laser.connect(channel_id),
            DeviceKind::Thermal => {
                self.thermal.connect(channel_id)?;
                self.thermal.regulate_at(self.config.thermal_setpoint_c)
            }
            DeviceKind::Actuator => self.actuator.connect(channel_id),
            DeviceKind::Interlock => self.interlock.connect(channel_id),
            DeviceKind::Camera => match &self.camera {
                Some(camera) => camera.enable(),
                None => Err(HardwareError::NotFound("camera".into())),
            },
        }
    }

    pub fn disconnect(&self, kind: DeviceKind) {
        match kind {
            DeviceKind::Laser => self.laser.disconnect(),
            DeviceKind::Thermal => self.thermal.disconnect(),
            DeviceKind::Actuator => self.actuator.disconnect(),
            DeviceKind::Interlock => self.interlock.disconnect(),
            DeviceKind::Camera => {
                if let Some(camera) = &self.camera {
                    if let Err(e) = camera.disable() {
                        warn!(error = %e, "camera disable failed");
                    }
                }
            }
        }
    }

    /// Connect every device on its configured channel, interlock MCU first.
    pub fn connect_all(&self) -> Result<(), HardwareError> {
        for kind in [
            DeviceKind::Interlock,
            DeviceKind::Laser,
            DeviceKind::Thermal,
            DeviceKind::Actuator,
        ] {
            if let Some(settings) = self.config.device(kind) {
                self.connect(kind, &settings.channel)?;
            }
        }
        if self.camera.is_some() {
            self.connect(DeviceKind::Camera, "")?;
        }
        Ok(())
    }

    /// Disconnect everything, laser first.
    pub fn disconnect_all(&self) {
        for kind in [
            DeviceKind::Laser,
            DeviceKind::Actuator,
            DeviceKind::Thermal,
            DeviceKind::Interlock,
            DeviceKind::Camera,
        ] {
            self.disconnect(kind);
        }
    }

    pub fn is_connected(&self, kind: DeviceKind) -> bool {
        match kind {
            DeviceKind::Laser => self.laser.is_connected(),
            DeviceKind::Thermal => self.thermal.is_connected(),
            DeviceKind::Actuator => self.actuator.is_connected(),
            DeviceKind::Interlock => self.interlock.is_connected(),
            DeviceKind::Camera => self.camera.as_ref().is_some_and(|c| c.is_acquiring()),
        }
    }

    /// Connection flag per device, in [`DeviceKind::CHANNELLED`] order.
    pub fn status(&self) -> Vec<(DeviceKind, bool)> {
        DeviceKind::CHANNELLED
            .iter()
            .map(|kind| (*kind, self.is_connected(*kind)))
            .collect()
    }

    /// Remove therapeutic laser output only. Every step is attempted; the
    /// first failure is returned after the rest have run.
    pub fn selective_shutdown(&self) -> Result<(), HardwareError> {
        let mut first_error = None;
        if self.laser.is_connected() {
            if let Err(e) = self.laser.safe_idle() {
                error!(error = %e, "laser idle failed during shutdown");
                first_error.get_or_insert(e);
            }
        }
        if self.interlock.is_connected() {
            if let Err(e) = self.interlock.set_laser_enable(false) {
                error!(error = %e, "laser-enable release failed during shutdown");
                first_error.get_or_insert(e);
            }
        }
        info!("selective shutdown complete");
        first_error.map_or(Ok(()), Err)
    }

    /// Prepare the laser for a run: power 0, MCU enable line up, emission on.
    pub fn arm_emission(&self) -> Result<(), HardwareError> {
        let _held = self.laser.core().exclusive();
        self.laser.set_power(0.0)?;
        self.interlock.set_laser_enable(true)?;
        self.laser.set_emission(true)
    }
}

impl std::fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSet")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
