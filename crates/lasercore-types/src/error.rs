//! Error taxonomy shared across the workspace.
//!
//! | Type | Raised by | Reaches |
//! |---|---|---|
//! | [`HardwareError`] | controllers | notifications; the engine only inside [`ExecutionError`] |
//! | [`SafetyViolation`] | interlock aggregation | always forces a state transition |
//! | [`SafetyError`] | the state machine | the operator that issued a rejected command |
//! | [`ValidationError`] | protocol validation | blocks editing, saving and starting |
//! | [`ExecutionError`] | the engine | aborts the run, triggers selective shutdown |

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::DeviceKind;
use crate::execution::ActionKind;
use crate::safety::{InterlockField, SafetyState};

// ────────────────────────────────────────────────────────────────────────────
// Hardware
// ────────────────────────────────────────────────────────────────────────────

/// Failures talking to a physical device.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HardwareError {
    #[error("channel '{channel}' is already in use by {owner}")]
    AlreadyInUse { channel: String, owner: String },

    #[error("channel '{0}' not found")]
    NotFound(String),

    #[error("{device}: '{command}' timed out after {timeout_ms} ms")]
    Timeout {
        device: DeviceKind,
        command: String,
        timeout_ms: u64,
    },

    #[error("{device}: malformed response to '{command}': {response:?}")]
    MalformedResponse {
        device: DeviceKind,
        command: String,
        response: String,
    },

    #[error("{device}: '{command}' rejected ({code}): {message}")]
    Rejected {
        device: DeviceKind,
        command: String,
        code: String,
        message: String,
    },

    #[error("{device} is not connected")]
    NotConnected { device: DeviceKind },

    #[error("{device}: channel failure: {details}")]
    ChannelLost { device: DeviceKind, details: String },

    #[error("{device}: operation cancelled")]
    Cancelled { device: DeviceKind },
}

impl HardwareError {
    /// Device-side `BUSY` rejections use this code.
    pub const BUSY: &'static str = "BUSY";

    /// Failures worth retrying with the same command.
    pub fn is_transient(&self) -> bool {
        match self {
            HardwareError::Timeout { .. } | HardwareError::MalformedResponse { .. } => true,
            HardwareError::Rejected { code, .. } => code == Self::BUSY,
            _ => false,
        }
    }

    /// Failures after which the channel is unusable until reconnected.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            HardwareError::ChannelLost { .. } | HardwareError::NotConnected { .. }
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Safety
// ────────────────────────────────────────────────────────────────────────────

/// A condition that forces the safety state machine to move.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SafetyViolation {
    #[error("interlock '{0}' lost")]
    InterlockLost(InterlockField),

    #[error(
        "photodiode reads {measured_watts:.3} W against {commanded_watts:.3} W commanded (tolerance {tolerance_pct:.1}%)"
    )]
    PowerDeviation {
        commanded_watts: f64,
        measured_watts: f64,
        tolerance_pct: f64,
    },

    #[error("no heartbeat acknowledged for {elapsed_ms} ms")]
    WatchdogTimeout { elapsed_ms: u64 },
}

impl SafetyViolation {
    /// The interlock field this violation clears.
    pub fn field(&self) -> InterlockField {
        match self {
            SafetyViolation::InterlockLost(field) => *field,
            SafetyViolation::PowerDeviation { .. } => InterlockField::PhotodiodePowerOk,
            SafetyViolation::WatchdogTimeout { .. } => InterlockField::WatchdogOk,
        }
    }
}

/// Rejections raised by the safety state machine itself.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SafetyError {
    #[error("'{command}' is not allowed in state {state}")]
    IllegalTransition { state: SafetyState, command: String },

    #[error("interlocks not satisfied: {missing:?}")]
    InterlocksNotSatisfied { missing: Vec<InterlockField> },

    #[error("emergency reset must be requested before it can be confirmed")]
    ResetNotRequested,

    #[error("emergency reset token does not match the pending request")]
    ResetTokenMismatch,

    #[error("override rejected: {0}")]
    OverrideRejected(String),
}

// ────────────────────────────────────────────────────────────────────────────
// Protocol validation
// ────────────────────────────────────────────────────────────────────────────

/// Which safety limit a value was checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    MaxPowerWatts,
    MaxDurationS,
    MinPositionMm,
    MaxPositionMm,
    MaxSpeedMmS,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LimitKind::MaxPowerWatts => "max_power_watts",
            LimitKind::MaxDurationS => "max_duration_s",
            LimitKind::MinPositionMm => "min_position_mm",
            LimitKind::MaxPositionMm => "max_position_mm",
            LimitKind::MaxSpeedMmS => "max_speed_mm_s",
        };
        f.write_str(s)
    }
}

/// Renders an optional line index for error messages.
fn at_line(line: &Option<usize>) -> String {
    match line {
        Some(i) => format!("line {i}"),
        None => "protocol".to_string(),
    }
}

/// A protocol failed one of its safety limits or is structurally invalid.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("{} {action}: {value} violates {limit} = {allowed}", at_line(.line))]
    LimitExceeded {
        line: Option<usize>,
        action: ActionKind,
        limit: LimitKind,
        value: f64,
        allowed: f64,
    },

    #[error("{} {action}: {reason}", at_line(.line))]
    MalformedAction {
        line: Option<usize>,
        action: ActionKind,
        reason: String,
    },

    #[error("line {line}: more than one {action} action")]
    DuplicateAction { line: usize, action: ActionKind },

    #[error("loop_count must be at least 1, got {0}")]
    InvalidLoopCount(u32),

    #[error("safety limits are inconsistent: {0}")]
    InvalidLimits(String),

    #[error("protocol has no lines")]
    Empty,

    #[error("estimated treatment time {estimated_s:.1} s exceeds max_duration_s = {allowed_s:.1}")]
    TotalDurationExceeded { estimated_s: f64, allowed_s: f64 },

    #[error("line {0} does not exist")]
    NoSuchLine(usize),
}

// ────────────────────────────────────────────────────────────────────────────
// Execution
// ────────────────────────────────────────────────────────────────────────────

/// Reasons a protocol run could not start or had to stop.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionError {
    #[error("protocol rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("treatment not permitted in state {state}")]
    NotPermitted { state: SafetyState },

    #[error("a protocol run is already active")]
    AlreadyRunning,

    #[error("line {line} {action}: no completion within {timeout_ms} ms")]
    ActionTimeout {
        line: usize,
        action: ActionKind,
        timeout_ms: u64,
    },

    #[error("line {line} {action}: gave up after {attempts} attempt(s)")]
    RetriesExhausted {
        line: usize,
        action: ActionKind,
        attempts: u32,
        #[source]
        source: HardwareError,
    },

    #[error("line {line} {action}: {source}")]
    Hardware {
        line: usize,
        action: ActionKind,
        #[source]
        source: HardwareError,
    },

    #[error("safety state rejected the run: {0}")]
    Safety(#[from] SafetyError),
}

// ────────────────────────────────────────────────────────────────────────────
// Bus / configuration
// ────────────────────────────────────────────────────────────────────────────

/// Event bus delivery failures.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusError {
    #[error("no subscribers on topic {0}")]
    NoSubscribers(String),
}

/// Startup configuration that cannot be used.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let timeout = HardwareError::Timeout {
            device: DeviceKind::Actuator,
            command: "POS?".into(),
            timeout_ms: 500,
        };
        assert!(timeout.is_transient());
        assert!(!timeout.is_permanent());

        let busy = HardwareError::Rejected {
            device: DeviceKind::Laser,
            command: "PWR 2.000".into(),
            code: "BUSY".into(),
            message: "settling".into(),
        };
        assert!(busy.is_transient());

        let lost = HardwareError::ChannelLost {
            device: DeviceKind::Laser,
            details: "broken pipe".into(),
        };
        assert!(lost.is_permanent());
        assert!(!lost.is_transient());
    }

    #[test]
    fn validation_error_names_limit_and_value() {
        let err = ValidationError::LimitExceeded {
            line: Some(2),
            action: ActionKind::LaserSet,
            limit: LimitKind::MaxPowerWatts,
            value: 7.5,
            allowed: 5.0,
        };
        let text = err.to_string();
        assert!(text.contains("line 2"));
        assert!(text.contains("max_power_watts"));
        assert!(text.contains("7.5"));
    }

    #[test]
    fn violation_maps_to_field() {
        let v = SafetyViolation::WatchdogTimeout { elapsed_ms: 1200 };
        assert_eq!(v.field(), InterlockField::WatchdogOk);
    }

    #[test]
    fn retries_exhausted_exposes_source() {
        use std::error::Error as _;
        let err = ExecutionError::RetriesExhausted {
            line: 1,
            action: ActionKind::Move,
            attempts: 4,
            source: HardwareError::Timeout {
                device: DeviceKind::Actuator,
                command: "MOVA 5.000 2.000".into(),
                timeout_ms: 500,
            },
        };
        assert!(err.source().is_some());
    }
}
