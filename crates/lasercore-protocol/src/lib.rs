//! `lasercore-protocol` – treatment protocols.
//!
//! # Modules
//!
//! - [`model`] – [`LineBasedProtocol`], [`ProtocolLine`], [`ProtocolAction`]
//!   and [`SafetyLimits`].
//! - [`timing`] – line durations (maximum over enabled actions), position
//!   tracking, and ramp curve interpolation.
//! - [`validation`] – [`ProtocolValidator`], a rule engine that checks every
//!   action against the protocol's limits and reports the violated limit and
//!   value. [`ValidatedProtocol`] is the only form the engine accepts.
//! - [`editor`] – [`ProtocolEditor`], edit-time validation.
//! - [`document`] – JSON / TOML interchange and JSON Schema export.

pub mod document;
pub mod editor;
pub mod model;
pub mod timing;
pub mod validation;

pub use document::{DocumentError, DocumentFormat, ProtocolDocument};
pub use editor::ProtocolEditor;
pub use lasercore_types::ActionKind;
pub use model::{
    LineAction, LineBasedProtocol, MoveMode, Position, ProtocolAction, ProtocolLine,
    ProtocolMetadata, RampCurve, SafetyLimits,
};
pub use timing::{LineTiming, MotionOrigin};
pub use validation::{
    DurationLimitRule, FiniteValuesRule, PositionRangeRule, PowerLimitRule, ProtocolValidator,
    Rule, RuleContext, SpeedCapRule, ValidatedProtocol,
};
