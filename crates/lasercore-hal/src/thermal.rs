//! [`ThermalController`] – TEC setpoint and temperature readback.

use std::sync::Arc;

use lasercore_middleware::Notifier;
use lasercore_types::{DeviceConfig, DeviceKind, DeviceNotification, HardwareError};
use parking_lot::Mutex;

use crate::channel::ChannelOpener;
use crate::controller::ControllerCore;
use crate::registry::ChannelRegistry;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThermalState {
    pub setpoint_c: Option<f64>,
    pub temperature_c: Option<f64>,
    pub tec_enabled: bool,
}

#[derive(Debug)]
pub struct ThermalController {
    core: ControllerCore,
    state: Mutex<ThermalState>,
}

impl ThermalController {
    pub fn new(
        settings: DeviceConfig,
        registry: ChannelRegistry,
        opener: Arc<dyn ChannelOpener>,
        notifier: Notifier,
    ) -> Self {
        Self {
            core: ControllerCore::new(DeviceKind::Thermal, settings, registry, opener, notifier),
            state: Mutex::new(ThermalState::default()),
        }
    }

    pub fn core(&self) -> &ControllerCore {
        &self.core
    }

    pub fn connect(&self, channel_id: &str) -> Result<(), HardwareError> {
        self.core.connect(channel_id).map(|_| ())
    }

    pub fn disconnect(&self) {
        self.core.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn set_temperature_setpoint(&self, celsius: f64) -> Result<(), HardwareError> {
        self.core.transact(&format!("TSET {celsius:.2}"))?;
        self.state.lock().setpoint_c = Some(celsius);
        self.core
            .notifier()
            .emit(DeviceNotification::SetpointChanged { celsius });
        Ok(())
    }

    pub fn read_temperature(&self) -> Result<f64, HardwareError> {
        let celsius = self.core.query_f64("TEMP?")?;
        self.state.lock().temperature_c = Some(celsius);
        self.core
            .notifier()
            .emit(DeviceNotification::TemperatureChanged { celsius });
        Ok(celsius)
    }

    pub fn set_tec_enabled(&self, enabled: bool) -> Result<(), HardwareError> {
        self.core.transact(if enabled { "TEC 1" } else { "TEC 0" })?;
        self.state.lock().tec_enabled = enabled;
        Ok(())
    }

    /// Setpoint, then TEC on, without another command in between.
    pub fn regulate_at(&self, celsius: f64) -> Result<(), HardwareError> {
        let _held = self.core.exclusive();
        self.set_temperature_setpoint(celsius)?;
        self.set_tec_enabled(true)
    }

    pub fn state(&self) -> ThermalState {
        *self.state.lock()
    }
}
