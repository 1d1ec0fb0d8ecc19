//! Safety vocabulary: the authoritative [`SafetyState`], the five
//! [`InterlockStatus`] signals, operator commands and the developer bypass.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SafetyError;

// ────────────────────────────────────────────────────────────────────────────
// SafetyState
// ────────────────────────────────────────────────────────────────────────────

/// The single authoritative safety state of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyState {
    /// No session or interlocks not yet satisfied. Laser output disabled.
    Safe,
    /// Session valid and every interlock satisfied; ready to treat.
    Armed,
    /// A protocol is executing.
    Treating,
    /// An interlock dropped while armed or treating. Needs an operator reset.
    Unsafe,
    /// Explicit stop. Leaves only through a confirmed reset to `Safe`.
    EmergencyStop,
}

impl SafetyState {
    pub const ALL: [SafetyState; 5] = [
        SafetyState::Safe,
        SafetyState::Armed,
        SafetyState::Treating,
        SafetyState::Unsafe,
        SafetyState::EmergencyStop,
    ];

    /// `true` for the two states in which a treatment may be running.
    pub fn permits_treatment(self) -> bool {
        matches!(self, SafetyState::Armed | SafetyState::Treating)
    }
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafetyState::Safe => "SAFE",
            SafetyState::Armed => "ARMED",
            SafetyState::Treating => "TREATING",
            SafetyState::Unsafe => "UNSAFE",
            SafetyState::EmergencyStop => "EMERGENCY_STOP",
        };
        f.write_str(s)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Interlocks
// ────────────────────────────────────────────────────────────────────────────

/// Names one of the five interlock signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterlockField {
    FootpedalPressed,
    PhotodiodePowerOk,
    WatchdogOk,
    SessionValid,
    GpioLinkOk,
}

impl InterlockField {
    pub const ALL: [InterlockField; 5] = [
        InterlockField::FootpedalPressed,
        InterlockField::PhotodiodePowerOk,
        InterlockField::WatchdogOk,
        InterlockField::SessionValid,
        InterlockField::GpioLinkOk,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InterlockField::FootpedalPressed => "footpedal_pressed",
            InterlockField::PhotodiodePowerOk => "photodiode_power_ok",
            InterlockField::WatchdogOk => "watchdog_ok",
            InterlockField::SessionValid => "session_valid",
            InterlockField::GpioLinkOk => "gpio_link_ok",
        }
    }
}

impl fmt::Display for InterlockField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of every interlock signal.
///
/// The default value has every field `false`, which is what the device
/// reports at power-up before any controller has been heard from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct InterlockStatus {
    pub footpedal_pressed: bool,
    pub photodiode_power_ok: bool,
    pub watchdog_ok: bool,
    pub session_valid: bool,
    pub gpio_link_ok: bool,
}

impl InterlockStatus {
    /// Every field `true`.
    pub fn satisfied() -> Self {
        Self {
            footpedal_pressed: true,
            photodiode_power_ok: true,
            watchdog_ok: true,
            session_valid: true,
            gpio_link_ok: true,
        }
    }

    pub fn get(&self, field: InterlockField) -> bool {
        match field {
            InterlockField::FootpedalPressed => self.footpedal_pressed,
            InterlockField::PhotodiodePowerOk => self.photodiode_power_ok,
            InterlockField::WatchdogOk => self.watchdog_ok,
            InterlockField::SessionValid => self.session_valid,
            InterlockField::GpioLinkOk => self.gpio_link_ok,
        }
    }

    /// Set `field` to `value`. Returns `true` when the stored value changed.
    pub fn set(&mut self, field: InterlockField, value: bool) -> bool {
        let slot = match field {
            InterlockField::FootpedalPressed => &mut self.footpedal_pressed,
            InterlockField::PhotodiodePowerOk => &mut self.photodiode_power_ok,
            InterlockField::WatchdogOk => &mut self.watchdog_ok,
            InterlockField::SessionValid => &mut self.session_valid,
            InterlockField::GpioLinkOk => &mut self.gpio_link_ok,
        };
        let changed = *slot != value;
        *slot = value;
        changed
    }

    /// `true` when every interlock is satisfied.
    pub fn all(&self) -> bool {
        InterlockField::ALL.iter().all(|f| self.get(*f))
    }

    /// `true` when every interlock except those in `ignored` is satisfied.
    pub fn all_except(&self, ignored: &[InterlockField]) -> bool {
        InterlockField::ALL
            .iter()
            .filter(|f| !ignored.contains(f))
            .all(|f| self.get(*f))
    }

    /// Fields currently `false`, in declaration order.
    pub fn missing(&self) -> Vec<InterlockField> {
        InterlockField::ALL
            .iter()
            .copied()
            .filter(|f| !self.get(*f))
            .collect()
    }

    /// Derived laser permission for this status in `state`.
    ///
    /// An active [`SafetyOverride`] forces the result to `true`.
    pub fn laser_permitted(&self, state: SafetyState, bypass: Option<&SafetyOverride>) -> bool {
        if bypass.is_some() {
            return true;
        }
        self.all() && state != SafetyState::EmergencyStop
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Operator commands
// ────────────────────────────────────────────────────────────────────────────

/// Explicit commands that drive the safety state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum OperatorCommand {
    StartSession,
    EndSession,
    BeginTreatment,
    EndTreatment,
    /// Operator reset out of `Unsafe`.
    Reset,
    EmergencyStop,
    /// First step of leaving `EmergencyStop`; yields a one-time token.
    RequestEmergencyReset,
    /// Second step; must quote the token from the request.
    ConfirmEmergencyReset { token: Uuid },
}

impl fmt::Display for OperatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorCommand::StartSession => f.write_str("start_session"),
            OperatorCommand::EndSession => f.write_str("end_session"),
            OperatorCommand::BeginTreatment => f.write_str("begin_treatment"),
            OperatorCommand::EndTreatment => f.write_str("end_treatment"),
            OperatorCommand::Reset => f.write_str("reset"),
            OperatorCommand::EmergencyStop => f.write_str("emergency_stop"),
            OperatorCommand::RequestEmergencyReset => f.write_str("request_emergency_reset"),
            OperatorCommand::ConfirmEmergencyReset { .. } => f.write_str("confirm_emergency_reset"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Developer bypass
// ────────────────────────────────────────────────────────────────────────────

/// A developer bypass of the interlock chain.
///
/// Only constructible through [`SafetyOverride::authorize`], which insists on
/// a named operator and a reason so that every enable is attributable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyOverride {
    id: Uuid,
    operator: String,
    reason: String,
    enabled_at: DateTime<Utc>,
}

impl SafetyOverride {
    pub fn authorize(operator: &str, reason: &str) -> Result<Self, SafetyError> {
        let operator = operator.trim();
        let reason = reason.trim();
        if operator.is_empty() || reason.is_empty() {
            return Err(SafetyError::OverrideRejected(
                "an override needs both an operator and a reason".to_string(),
            ));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            operator: operator.to_string(),
            reason: reason.to_string(),
            enabled_at: Utc::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn enabled_at(&self) -> DateTime<Utc> {
        self.enabled_at
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Snapshot
// ────────────────────────────────────────────────────────────────────────────

/// Copy of the safety picture handed to readers outside the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetySnapshot {
    pub state: SafetyState,
    pub interlocks: InterlockStatus,
    pub bypass: Option<SafetyOverride>,
    pub laser_permitted: bool,
    /// Monotonic counter bumped on every change.
    pub sequence: u64,
}

impl SafetySnapshot {
    pub fn initial() -> Self {
        Self {
            state: SafetyState::Safe,
            interlocks: InterlockStatus::default(),
            bypass: None,
            laser_permitted: false,
            sequence: 0,
        }
    }

    /// Whether a running treatment may keep emitting.
    pub fn treatment_permitted(&self) -> bool {
        self.laser_permitted && self.state == SafetyState::Treating
    }
}

impl FromStr for InterlockField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InterlockField::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown interlock '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_has_everything_missing() {
        let status = InterlockStatus::default();
        assert!(!status.all());
        assert_eq!(status.missing().len(), 5);
    }

    #[test]
    fn set_reports_changes_only() {
        let mut status = InterlockStatus::default();
        assert!(status.set(InterlockField::WatchdogOk, true));
        assert!(!status.set(InterlockField::WatchdogOk, true));
        assert!(status.watchdog_ok);
    }

    #[test]
    fn laser_permission_requires_every_field() {
        let mut status = InterlockStatus::satisfied();
        assert!(status.laser_permitted(SafetyState::Treating, None));
        status.set(InterlockField::PhotodiodePowerOk, false);
        assert!(!status.laser_permitted(SafetyState::Treating, None));
    }

    #[test]
    fn emergency_stop_blocks_permission() {
        let status = InterlockStatus::satisfied();
        assert!(!status.laser_permitted(SafetyState::EmergencyStop, None));
    }

    #[test]
    fn override_forces_permission() {
        let bypass = SafetyOverride::authorize("dev", "bench alignment").unwrap();
        let status = InterlockStatus::default();
        assert!(status.laser_permitted(SafetyState::Safe, Some(&bypass)));
    }

    #[test]
    fn override_needs_operator_and_reason() {
        assert!(SafetyOverride::authorize("", "reason").is_err());
        assert!(SafetyOverride::authorize("dev", "  ").is_err());
    }

    #[test]
    fn all_except_ignores_listed_fields() {
        let mut status = InterlockStatus::satisfied();
        status.set(InterlockField::FootpedalPressed, false);
        assert!(status.all_except(&[InterlockField::FootpedalPressed]));
        assert!(!status.all());
    }

    #[test]
    fn interlock_field_parses_from_wire_name() {
        assert_eq!(
            "gpio_link_ok".parse::<InterlockField>().unwrap(),
            InterlockField::GpioLinkOk
        );
        assert!("laser".parse::<InterlockField>().is_err());
    }
}
