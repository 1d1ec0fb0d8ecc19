//! `lasercore-runtime` – Treatment execution
//!
//! Runs admitted protocols against the hardware and keeps laser output off
//! whenever the safety monitor withdraws permission.
//!
//! # Modules
//!
//! - [`engine`] – [`ProtocolEngine`]: line-by-line execution with concurrent
//!   actions per line, pause/resume/stop through a [`RunHandle`], and a
//!   [`RunReport`] at the end.
//! - [`retry`] – [`RetryPolicy`]: fixed-delay retries for transient hardware
//!   failures.
//! - [`shutdown`] – [`ShutdownGuard`]: selective shutdown on every loss of
//!   permission, with or without a run.
//! - [`system`] – [`LaserSystem`]: everything above assembled from one
//!   [`StartupConfig`][lasercore_types::StartupConfig].
//! - [`telemetry`] – [`init_tracing`]: the global `tracing` subscriber with
//!   optional OTLP span export.
//!
//! Every protocol enters through the
//! [`TreatmentGate`][lasercore_kernel::TreatmentGate]; it is re-exported so
//! callers holding a runtime need no direct kernel dependency.

pub mod engine;
pub mod retry;
pub mod shutdown;
pub mod system;
pub mod telemetry;

pub use engine::{ActionFailure, ProtocolEngine, RunHandle, RunReport};
pub use lasercore_kernel::TreatmentGate;
pub use retry::{Exhausted, RetryPolicy};
pub use shutdown::ShutdownGuard;
pub use system::{LaserSystem, SystemError};
pub use telemetry::{TracerProviderGuard, init_tracing};
