//! [`ActuatorController`] – linear stage positioning.
//!
//! Move commands return once the stage accepts them; completion is observed
//! by polling [`ActuatorController::poll_motion`]. `HALT` holds the present
//! position and is what cancellation sends.

use std::sync::Arc;

use lasercore_middleware::Notifier;
use lasercore_types::{DeviceConfig, DeviceKind, DeviceNotification, HardwareError};
use parking_lot::Mutex;
use tracing::debug;

use crate::channel::ChannelOpener;
use crate::controller::ControllerCore;
use crate::registry::ChannelRegistry;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ActuatorState {
    pub position_mm: f64,
    pub target_mm: Option<f64>,
    pub moving: bool,
    pub homing: bool,
}

#[derive(Debug)]
pub struct ActuatorController {
    core: ControllerCore,
    state: Mutex<ActuatorState>,
}

impl ActuatorController {
    pub fn new(
        settings: DeviceConfig,
        registry: ChannelRegistry,
        opener: Arc<dyn ChannelOpener>,
        notifier: Notifier,
    ) -> Self {
        Self {
            core: ControllerCore::new(DeviceKind::Actuator, settings, registry, opener, notifier),
            state: Mutex::new(ActuatorState::default()),
        }
    }

    pub fn core(&self) -> &ControllerCore {
        &self.core
    }

    /// Connect and read the present position.
    pub fn connect(&self, channel_id: &str) -> Result<(), HardwareError> {
        let _held = self.core.exclusive();
        self.core.connect(channel_id)?;
        self.read_position().map(|_| ())
    }

    pub fn disconnect(&self) {
        self.core.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn set_position(&self, target_mm: f64, speed_mm_s: f64) -> Result<(), HardwareError> {
        self.core
            .transact(&format!("MOVA {target_mm:.4} {speed_mm_s:.4}"))?;
        self.started(Some(target_mm), false);
        Ok(())
    }

    pub fn move_relative(&self, delta_mm: f64, speed_mm_s: f64) -> Result<(), HardwareError> {
        let _held = self.core.exclusive();
        let from = self.state.lock().position_mm;
        self.core
            .transact(&format!("MOVR {delta_mm:.4} {speed_mm_s:.4}"))?;
        self.started(Some(from + delta_mm), false);
        Ok(())
    }

    pub fn home(&self) -> Result<(), HardwareError> {
        self.core.transact("HOME")?;
        self.started(Some(0.0), true);
        Ok(())
    }

    /// Stop and hold the present position.
    pub fn halt(&self) -> Result<(), HardwareError> {
        let _held = self.core.exclusive();
        self.core.transact("HALT")?;
        {
            let mut state = self.state.lock();
            state.target_mm = None;
            state.homing = false;
        }
        self.read_position()?;
        self.set_moving(false);
        Ok(())
    }

    pub fn read_position(&self) -> Result<f64, HardwareError> {
        let mm = self.core.query_f64("POS?")?;
        let changed = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.position_mm, mm) != mm
        };
        if changed {
            self.core
                .notifier()
                .emit(DeviceNotification::PositionChanged { mm });
        }
        Ok(mm)
    }

    /// Refresh the moving flag and position. Returns `true` while in motion.
    pub fn poll_motion(&self) -> Result<bool, HardwareError> {
        let _held = self.core.exclusive();
        let moving = self.core.query_flags("MOVING?", 1)?[0];
        self.read_position()?;
        self.set_moving(moving);
        Ok(moving)
    }

    pub fn position(&self) -> f64 {
        self.state.lock().position_mm
    }

    pub fn state(&self) -> ActuatorState {
        *self.state.lock()
    }

    fn started(&self, target: Option<f64>, homing: bool) {
        {
            let mut state = self.state.lock();
            state.target_mm = target;
            state.homing = homing;
        }
        debug!(target = ?target, homing, "motion started");
        self.set_moving(true);
    }

    fn set_moving(&self, moving: bool) {
        let (changed, homed) = {
            let mut state = self.state.lock();
            let changed = std::mem::replace(&mut state.moving, moving) != moving;
            let homed = changed && !moving && std::mem::take(&mut state.homing);
            (changed, homed)
        };
        if changed {
            self.core
                .notifier()
                .emit(DeviceNotification::MotionChanged { moving });
        }
        if homed {
            self.core.notifier().emit(DeviceNotification::Homed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimActuator, SimOpener};
    use std::time::Duration;

    fn stage() -> (ActuatorController, SimActuator) {
        let sim = SimActuator::new(5.0);
        let mut opener = SimOpener::new();
        opener.attach("sim:actuator", sim.clone());
        let (notifier, _) = Notifier::in_memory();
        let controller = ActuatorController::new(
            DeviceConfig::on("sim:actuator"),
            ChannelRegistry::new(),
            Arc::new(opener),
            notifier,
        );
        controller.connect("sim:actuator").unwrap();
        (controller, sim)
    }

    fn settle(stage: &ActuatorController) {
        for _ in 0..200 {
            if !stage.poll_motion().unwrap() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("stage never settled");
    }

    #[test]
    fn absolute_move_arrives() {
        let (stage, _) = stage();
        stage.set_position(2.0, 20.0).unwrap();
        assert!(stage.state().moving);
        settle(&stage);
        assert!((stage.position() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn relative_move_is_from_the_present_position() {
        let (stage, _) = stage();
        stage.set_position(1.0, 50.0).unwrap();
        settle(&stage);
        stage.move_relative(0.5, 50.0).unwrap();
        assert_eq!(stage.state().target_mm, Some(1.5));
        settle(&stage);
        assert!((stage.position() - 1.5).abs() < 1e-6);
    }

    #[test]
    fn halt_holds_position() {
        let (stage, sim) = stage();
        stage.set_position(40.0, 10.0).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        stage.halt().unwrap();
        let held = stage.position();
        assert!(held > 0.0 && held < 40.0, "held at {held}");
        std::thread::sleep(Duration::from_millis(30));
        assert!(!stage.poll_motion().unwrap());
        assert_eq!(sim.position_mm(), held);
    }

    #[test]
    fn home_returns_to_zero() {
        let (stage, _) = stage();
        stage.set_position(0.2, 50.0).unwrap();
        settle(&stage);
        stage.home().unwrap();
        settle(&stage);
        assert_eq!(stage.position(), 0.0);
        assert!(!stage.state().homing);
    }
}
