//! Typed startup configuration.
//!
//! Built once at startup (from a file, the environment, or code) and passed
//! by reference into every constructor. Nothing reads configuration after
//! that point, so values are fixed for the lifetime of a connected session.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::DeviceKind;
use crate::error::ConfigError;

// ────────────────────────────────────────────────────────────────────────────
// Per-device channel settings
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Channel identifier, e.g. `/dev/ttyUSB0` or `sim:laser`.
    #[serde(default)]
    pub channel: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Upper bound on a single command/response exchange.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl DeviceConfig {
    pub fn on(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            channel: String::new(),
            baud_rate: default_baud_rate(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

fn default_baud_rate() -> u32 {
    115_200
}
fn default_command_timeout_ms() -> u64 {
    500
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u64,
    /// The microcontroller drops laser enable when no heartbeat arrives
    /// within this window.
    #[serde(default = "default_watchdog_timeout_ms")]
    pub timeout_ms: u64,
    /// Interval between interlock status polls (footpedal, watchdog line).
    #[serde(default = "default_status_poll_ms")]
    pub status_poll_ms: u64,
}

impl WatchdogConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            heartbeat_period_ms: default_heartbeat_period_ms(),
            timeout_ms: default_watchdog_timeout_ms(),
            status_poll_ms: default_status_poll_ms(),
        }
    }
}

fn default_heartbeat_period_ms() -> u64 {
    500
}
fn default_watchdog_timeout_ms() -> u64 {
    1000
}
fn default_status_poll_ms() -> u64 {
    20
}

// ────────────────────────────────────────────────────────────────────────────
// Interlock thresholds
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterlockThresholds {
    /// Allowed relative deviation of measured from commanded power (0.10 = 10 %).
    #[serde(default = "default_power_deviation_tolerance")]
    pub power_deviation_tolerance: f64,
    /// Photodiode measurement noise, from calibration.
    #[serde(default = "default_photodiode_noise_watts")]
    pub photodiode_noise_watts: f64,
    /// Multiple of the noise below which readings are not compared.
    #[serde(default = "default_calibration_margin")]
    pub calibration_margin: f64,
    /// Bound on footpedal release to laser-permission loss.
    #[serde(default = "default_footpedal_response_ms")]
    pub footpedal_response_ms: u64,
}

impl InterlockThresholds {
    /// Readings and commands below this are treated as "off".
    pub fn noise_floor_watts(&self) -> f64 {
        self.photodiode_noise_watts * self.calibration_margin
    }
}

impl Default for InterlockThresholds {
    fn default() -> Self {
        Self {
            power_deviation_tolerance: default_power_deviation_tolerance(),
            photodiode_noise_watts: default_photodiode_noise_watts(),
            calibration_margin: default_calibration_margin(),
            footpedal_response_ms: default_footpedal_response_ms(),
        }
    }
}

fn default_power_deviation_tolerance() -> f64 {
    0.10
}
fn default_photodiode_noise_watts() -> f64 {
    0.01
}
fn default_calibration_margin() -> f64 {
    5.0
}
fn default_footpedal_response_ms() -> u64 {
    50
}

// ────────────────────────────────────────────────────────────────────────────
// Engine
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-dispatch timeout.
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
    /// Retries after the first attempt for transient hardware failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Continue past failed home/dwell actions instead of aborting.
    #[serde(default)]
    pub tolerate_non_critical_failures: bool,
    #[serde(default = "default_ramp_step_ms")]
    pub ramp_step_ms: u64,
    #[serde(default = "default_motion_poll_ms")]
    pub motion_poll_ms: u64,
    #[serde(default = "default_position_tolerance_mm")]
    pub position_tolerance_mm: f64,
    #[serde(default = "default_home_speed_mm_s")]
    pub home_speed_mm_s: f64,
}

impl EngineConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn ramp_step(&self) -> Duration {
        Duration::from_millis(self.ramp_step_ms)
    }

    pub fn motion_poll(&self) -> Duration {
        Duration::from_millis(self.motion_poll_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            action_timeout_ms: default_action_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            tolerate_non_critical_failures: false,
            ramp_step_ms: default_ramp_step_ms(),
            motion_poll_ms: default_motion_poll_ms(),
            position_tolerance_mm: default_position_tolerance_mm(),
            home_speed_mm_s: default_home_speed_mm_s(),
        }
    }
}

fn default_action_timeout_ms() -> u64 {
    60_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    200
}
fn default_ramp_step_ms() -> u64 {
    100
}
fn default_motion_poll_ms() -> u64 {
    50
}
fn default_position_tolerance_mm() -> f64 {
    0.05
}
fn default_home_speed_mm_s() -> f64 {
    5.0
}

// ────────────────────────────────────────────────────────────────────────────
// StartupConfig
// ────────────────────────────────────────────────────────────────────────────

/// Everything the core needs to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupConfig {
    #[serde(default = "default_laser")]
    pub laser: DeviceConfig,
    #[serde(default = "default_thermal")]
    pub thermal: DeviceConfig,
    #[serde(default = "default_actuator")]
    pub actuator: DeviceConfig,
    #[serde(default = "default_interlock")]
    pub interlock: DeviceConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub thresholds: InterlockThresholds,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default = "default_thermal_setpoint_c")]
    pub thermal_setpoint_c: f64,
    /// Run against simulated devices instead of serial ports.
    #[serde(default)]
    pub simulate: bool,
    /// Append-only JSON-lines audit file. In-memory only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<PathBuf>,
}

fn default_laser() -> DeviceConfig {
    DeviceConfig::on("/dev/ttyUSB0")
}
fn default_thermal() -> DeviceConfig {
    DeviceConfig::on("/dev/ttyUSB1")
}
fn default_actuator() -> DeviceConfig {
    DeviceConfig::on("/dev/ttyUSB2")
}
fn default_interlock() -> DeviceConfig {
    DeviceConfig::on("/dev/ttyACM0")
}
fn default_thermal_setpoint_c() -> f64 {
    25.0
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            laser: default_laser(),
            thermal: default_thermal(),
            actuator: default_actuator(),
            interlock: default_interlock(),
            watchdog: WatchdogConfig::default(),
            thresholds: InterlockThresholds::default(),
            engine: EngineConfig::default(),
            thermal_setpoint_c: default_thermal_setpoint_c(),
            simulate: false,
            audit_log: None,
        }
    }
}

impl StartupConfig {
    /// Configuration wired to the simulated devices.
    pub fn simulated() -> Self {
        Self {
            laser: DeviceConfig::on("sim:laser"),
            thermal: DeviceConfig::on("sim:thermal"),
            actuator: DeviceConfig::on("sim:actuator"),
            interlock: DeviceConfig::on("sim:interlock"),
            simulate: true,
            ..Self::default()
        }
    }

    /// Channel settings for a channelled device. `None` for the camera.
    pub fn device(&self, kind: DeviceKind) -> Option<&DeviceConfig> {
        match kind {
            DeviceKind::Laser => Some(&self.laser),
            DeviceKind::Thermal => Some(&self.thermal),
            DeviceKind::Actuator => Some(&self.actuator),
            DeviceKind::Interlock => Some(&self.interlock),
            DeviceKind::Camera => None,
        }
    }

    /// Reject values no device could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for kind in DeviceKind::CHANNELLED {
            if let Some(dev) = self.device(kind) {
                if dev.command_timeout_ms == 0 {
                    return Err(invalid(kind.as_str(), "command_timeout_ms must be > 0"));
                }
                if dev.baud_rate == 0 {
                    return Err(invalid(kind.as_str(), "baud_rate must be > 0"));
                }
            }
        }
        if self.watchdog.heartbeat_period_ms == 0 {
            return Err(invalid("watchdog.heartbeat_period_ms", "must be > 0"));
        }
        if self.watchdog.timeout_ms <= self.watchdog.heartbeat_period_ms {
            return Err(invalid(
                "watchdog.timeout_ms",
                "must be longer than the heartbeat period",
            ));
        }
        if self.watchdog.status_poll_ms == 0 {
            return Err(invalid("watchdog.status_poll_ms", "must be > 0"));
        }
        let tol = self.thresholds.power_deviation_tolerance;
        if !(tol > 0.0 && tol <= 1.0) {
            return Err(invalid(
                "thresholds.power_deviation_tolerance",
                "must lie in (0, 1]",
            ));
        }
        if self.thresholds.photodiode_noise_watts < 0.0 || self.thresholds.calibration_margin < 1.0
        {
            return Err(invalid(
                "thresholds.calibration_margin",
                "noise must be >= 0 and margin >= 1",
            ));
        }
        if self.engine.action_timeout_ms == 0 {
            return Err(invalid("engine.action_timeout_ms", "must be > 0"));
        }
        if self.engine.ramp_step_ms == 0 || self.engine.motion_poll_ms == 0 {
            return Err(invalid("engine.ramp_step_ms", "step and poll periods must be > 0"));
        }
        if self.engine.home_speed_mm_s <= 0.0 {
            return Err(invalid("engine.home_speed_mm_s", "must be > 0"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(StartupConfig::default().validate().is_ok());
        assert!(StartupConfig::simulated().validate().is_ok());
    }

    #[test]
    fn documented_defaults() {
        let cfg = StartupConfig::default();
        assert_eq!(cfg.watchdog.heartbeat_period_ms, 500);
        assert_eq!(cfg.watchdog.timeout_ms, 1000);
        assert_eq!(cfg.engine.action_timeout_ms, 60_000);
        assert_eq!(cfg.engine.max_retries, 3);
        assert!((cfg.thresholds.power_deviation_tolerance - 0.10).abs() < f64::EPSILON);
    }

    #[test]
    fn watchdog_timeout_must_exceed_period() {
        let mut cfg = StartupConfig::default();
        cfg.watchdog.timeout_ms = 400;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("watchdog.timeout_ms"));
    }

    #[test]
    fn tolerance_outside_unit_interval_is_rejected() {
        let mut cfg = StartupConfig::default();
        cfg.thresholds.power_deviation_tolerance = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: StartupConfig = toml::from_str(
            r#"
            simulate = true

            [laser]
            channel = "/dev/ttyS4"

            [engine]
            max_retries = 5
            "#,
        )
        .unwrap();
        assert!(cfg.simulate);
        assert_eq!(cfg.laser.channel, "/dev/ttyS4");
        assert_eq!(cfg.laser.baud_rate, 115_200);
        assert_eq!(cfg.engine.max_retries, 5);
        assert_eq!(cfg.engine.action_timeout_ms, 60_000);
        assert_eq!(cfg.thermal.channel, "/dev/ttyUSB1");
    }

    #[test]
    fn noise_floor_is_noise_times_margin() {
        let t = InterlockThresholds::default();
        assert!((t.noise_floor_watts() - 0.05).abs() < 1e-12);
    }
}
