//! Bus events. Every live notification and every audit record is an
//! [`Event`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::{DeviceKind, DeviceNotification};
use crate::error::SafetyViolation;
use crate::execution::ExecutionEvent;
use crate::safety::{InterlockField, InterlockStatus, OperatorCommand, SafetyState};

/// Unified event wrapper for the event bus and the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"lasercore-kernel::monitor"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// What moved the safety state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionCause {
    Command { command: OperatorCommand },
    Interlock { field: InterlockField, value: bool },
    Violation { violation: SafetyViolation },
}

/// Payloads routed over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    SafetyStateChanged {
        from: SafetyState,
        to: SafetyState,
        cause: TransitionCause,
    },
    InterlockChanged {
        field: InterlockField,
        value: bool,
        status: InterlockStatus,
    },
    TransitionRejected {
        state: SafetyState,
        input: String,
        reason: String,
    },
    OverrideChanged {
        active: bool,
        operator: String,
        reason: String,
    },
    Device {
        device: DeviceKind,
        notification: DeviceNotification,
    },
    Execution(ExecutionEvent),
    /// A fault outside any single device, e.g. a failed shutdown step.
    Fault {
        component: String,
        message: String,
    },
}
