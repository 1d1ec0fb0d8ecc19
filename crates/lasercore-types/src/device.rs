//! Device identities and the fixed set of notifications each controller may
//! emit.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The devices the core talks to. There is exactly one of each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Laser,
    Thermal,
    Actuator,
    Interlock,
    Camera,
}

impl DeviceKind {
    /// Devices that own a serial channel.
    pub const CHANNELLED: [DeviceKind; 4] = [
        DeviceKind::Laser,
        DeviceKind::Thermal,
        DeviceKind::Actuator,
        DeviceKind::Interlock,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Laser => "laser",
            DeviceKind::Thermal => "thermal",
            DeviceKind::Actuator => "actuator",
            DeviceKind::Interlock => "interlock",
            DeviceKind::Camera => "camera",
        }
    }

    /// Event source string used on the bus, e.g. `lasercore-hal::laser`.
    pub fn source(self) -> String {
        format!("lasercore-hal::{}", self.as_str())
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "laser" => Ok(DeviceKind::Laser),
            "thermal" | "tec" => Ok(DeviceKind::Thermal),
            "actuator" | "stage" => Ok(DeviceKind::Actuator),
            "interlock" | "mcu" => Ok(DeviceKind::Interlock),
            "camera" => Ok(DeviceKind::Camera),
            other => Err(format!("unknown device '{other}'")),
        }
    }
}

/// Everything a controller can report. Each variant is emitted only by the
/// device it concerns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceNotification {
    ConnectionChanged {
        connected: bool,
        channel: Option<String>,
    },
    ErrorOccurred {
        message: String,
        permanent: bool,
    },

    // laser
    PowerChanged { watts: f64 },
    EmissionChanged { enabled: bool },
    AimingBeamChanged { on: bool },

    // thermal
    SetpointChanged { celsius: f64 },
    TemperatureChanged { celsius: f64 },

    // actuator
    PositionChanged { mm: f64 },
    MotionChanged { moving: bool },
    Homed,

    // interlock microcontroller
    HeartbeatAcknowledged,
    FootpedalChanged { pressed: bool },
    WatchdogStatus { ok: bool },
    PhotodiodePower { watts: f64 },
    LaserEnableLine { enabled: bool },
    /// Current MCU levels, repeated with every acknowledged heartbeat so a
    /// subscriber that missed an edge catches up.
    InterlockLevels {
        footpedal_pressed: bool,
        watchdog_ok: bool,
        laser_enable: bool,
    },

    // camera
    AcquisitionChanged { acquiring: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_kind_parses_aliases() {
        assert_eq!("MCU".parse::<DeviceKind>().unwrap(), DeviceKind::Interlock);
        assert_eq!("stage".parse::<DeviceKind>().unwrap(), DeviceKind::Actuator);
        assert!("scanner".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn notification_is_tagged_by_kind() {
        let json = serde_json::to_string(&DeviceNotification::PowerChanged { watts: 2.0 }).unwrap();
        assert!(json.contains("\"kind\":\"power_changed\""));
    }
}
