//! `lasercore-hal` – channel-owning hardware controllers.
//!
//! # Modules
//!
//! - [`channel`] – the [`Channel`] / [`ChannelOpener`] seam and the serial
//!   implementation.
//! - [`registry`] – [`ChannelRegistry`], exclusive channel ownership with RAII
//!   [`ChannelLease`]s.
//! - [`controller`] – [`ControllerCore`], the locked command/response cycle every
//!   controller shares, and [`DeviceNotifier`].
//! - [`laser`], [`thermal`], [`actuator`], [`interlock`] – the four device
//!   controllers.
//! - [`camera`] – [`CameraCapability`], acquisition on/off only.
//! - [`devices`] – [`DeviceSet`] with selective shutdown.
//! - [`sim`] – simulated devices and the [`SimBench`] test rig.

pub mod actuator;
pub mod camera;
pub mod channel;
pub mod controller;
pub mod devices;
pub mod interlock;
pub mod laser;
pub mod registry;
pub mod sim;
pub mod thermal;

pub use actuator::{ActuatorController, ActuatorState};
pub use camera::{CameraCapability, SimCamera};
pub use channel::{Channel, ChannelError, ChannelOpener, SerialChannel, SerialOpener};
pub use controller::{ControllerCore, DeviceNotifier, Exclusive};
pub use devices::DeviceSet;
pub use interlock::{InterlockController, InterlockReadings};
pub use laser::{LaserController, LaserState};
pub use registry::{ChannelLease, ChannelRegistry};
pub use sim::{SimBench, SimFaults, SimOpener};
pub use thermal::{ThermalController, ThermalState};
