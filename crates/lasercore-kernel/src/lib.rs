//! `lasercore-kernel` – Safety authority
//!
//! Owns the one `SafetyState` of the device and decides, from interlock
//! signals and operator commands, whether the therapeutic laser may emit.
//!
//! # Modules
//!
//! - [`machine`] – [`SafetyStateMachine`]: the pure, deterministic transition
//!   function. No I/O, no clock.
//! - [`monitor`] – [`SafetyMonitor`]: thread-safe owner of the machine.
//!   Publishes [`SafetySnapshot`][lasercore_types::SafetySnapshot]s on a watch
//!   channel and records every transition, interlock change, rejection and
//!   override change.
//! - [`watchdog`] – [`WatchdogSupervisor`]: heartbeat deadline plus MCU
//!   watchdog line, deriving `watchdog_ok`.
//! - [`photodiode`] – [`PowerDeviationCheck`]: measured against commanded
//!   optical power.
//! - [`aggregator`] – [`InterlockAggregator`]: maps controller notifications
//!   from the bus to interlock signals.
//! - [`gate`] – [`TreatmentGate`]: the check every protocol passes before it
//!   starts and before each of its lines.

pub mod aggregator;
pub mod gate;
pub mod machine;
pub mod monitor;
pub mod photodiode;
pub mod watchdog;

pub use aggregator::InterlockAggregator;
pub use gate::TreatmentGate;
pub use machine::{RESET_EXEMPT, SafetyInput, SafetyStateMachine, Transition};
pub use monitor::{OverrideAuthorization, SafetyMonitor};
pub use photodiode::PowerDeviationCheck;
pub use watchdog::WatchdogSupervisor;
