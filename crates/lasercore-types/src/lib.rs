//! `lasercore-types` – shared vocabulary for the LaserCore workspace.
//!
//! # Modules
//!
//! - [`safety`] – [`SafetyState`], [`InterlockStatus`], operator commands and
//!   the [`SafetyOverride`] developer bypass.
//! - [`device`] – [`DeviceKind`] and the fixed set of [`DeviceNotification`]s.
//! - [`execution`] – [`ActionKind`], [`ExecutionContext`] and engine events.
//! - [`event`] – the bus/audit [`Event`] envelope.
//! - [`error`] – the error taxonomy.
//! - [`config`] – typed, immutable [`StartupConfig`].

pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod execution;
pub mod safety;

pub use config::{DeviceConfig, EngineConfig, InterlockThresholds, StartupConfig, WatchdogConfig};
pub use device::{DeviceKind, DeviceNotification};
pub use error::{
    BusError, ConfigError, ExecutionError, HardwareError, LimitKind, SafetyError,
    SafetyViolation, ValidationError,
};
pub use event::{Event, EventPayload, TransitionCause};
pub use execution::{
    AbortReason, ActionKind, ExecutionContext, ExecutionEvent, ExecutionState, RunOutcome,
};
pub use safety::{
    InterlockField, InterlockStatus, OperatorCommand, SafetyOverride, SafetySnapshot, SafetyState,
};
