//! In-process simulated hardware for tests and `--simulate` sessions.
//!
//! Each simulated device speaks the same line protocol as the real one, so
//! the controllers under test run their real command cycle. Devices are
//! cheap handles over shared state: keep a clone to inspect or drive the
//! device (press the footpedal, bias the photodiode) while a controller owns
//! the channel.
//!
//! # Fault injection
//!
//! Every endpoint attached to a [`SimOpener`] gets a [`SimFaults`] handle:
//!
//! | Fault | Effect |
//! |---|---|
//! | [`unplug`](SimFaults::unplug) | every channel operation fails with "closed" (permanent) |
//! | [`silence`](SimFaults::silence) | commands are swallowed; reads time out (transient) |
//! | [`garble_next`](SimFaults::garble_next) | the next *n* responses are noise (malformed) |
//! | [`busy_next`](SimFaults::busy_next) | the next *n* commands answer `ERR BUSY` (transient) |
//! | [`swallow`](SimFaults::swallow) | commands with a prefix never reach the device |
//!
//! # Example
//!
//! ```rust
//! use lasercore_hal::sim::SimBench;
//! use lasercore_types::StartupConfig;
//!
//! let bench = SimBench::start(&StartupConfig::simulated()).unwrap();
//! bench.interlock.set_footpedal(true);
//! bench.devices.laser().set_power(1.5).unwrap();
//! bench.devices.disconnect_all();
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use lasercore_middleware::Notifier;
use lasercore_types::{DeviceConfig, DeviceKind, HardwareError, StartupConfig};
use parking_lot::Mutex;

use crate::camera::SimCamera;
use crate::channel::{Channel, ChannelError, ChannelOpener};
use crate::devices::DeviceSet;

/// A device that answers one command line with at most one response line.
pub trait SimDevice: Send + Sync {
    fn respond(&self, command: &str) -> Option<String>;
}

fn ok() -> Option<String> {
    Some("OK".into())
}

fn ok_with(value: impl std::fmt::Display) -> Option<String> {
    Some(format!("OK {value}"))
}

fn err(code: &str, message: &str) -> Option<String> {
    Some(format!("ERR {code} {message}"))
}

fn flag(value: bool) -> u8 {
    u8::from(value)
}

fn parse_flag(arg: Option<&str>) -> Option<bool> {
    match arg {
        Some("1") => Some(true),
        Some("0") => Some(false),
        _ => None,
    }
}

fn parse_number(arg: Option<&str>) -> Option<f64> {
    arg.and_then(|a| a.parse::<f64>().ok()).filter(|v| v.is_finite())
}

// ────────────────────────────────────────────────────────────────────────────
// Optics
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OpticsState {
    pub power_watts: f64,
    pub emission: bool,
    pub aiming_beam: bool,
    pub enable_line: bool,
    /// Instant after which the MCU watchdog holds the enable line low.
    pub watchdog_deadline: Option<Instant>,
    /// Fractional photodiode error, e.g. `0.2` reads 20 % high.
    pub photodiode_bias: f64,
}

/// Light path shared by the simulated laser and the MCU photodiode.
#[derive(Debug, Clone, Default)]
pub struct SimOptics {
    state: Arc<Mutex<OpticsState>>,
}

impl SimOptics {
    pub fn state(&self) -> OpticsState {
        *self.state.lock()
    }

    /// Optical power actually leaving the aperture.
    pub fn output_watts(&self) -> f64 {
        let s = self.state.lock();
        let watchdog_ok = s.watchdog_deadline.is_some_and(|d| Instant::now() <= d);
        if s.emission && s.enable_line && watchdog_ok {
            s.power_watts
        } else {
            0.0
        }
    }

    pub fn photodiode_watts(&self) -> f64 {
        let bias = self.state.lock().photodiode_bias;
        self.output_watts() * (1.0 + bias)
    }

    pub fn set_bias(&self, fraction: f64) {
        self.state.lock().photodiode_bias = fraction;
    }

    /// Set laser power and emission directly, bypassing the laser channel.
    pub fn drive(&self, watts: f64, emission: bool) {
        let mut s = self.state.lock();
        s.power_watts = watts;
        s.emission = emission;
    }

    fn with<R>(&self, f: impl FnOnce(&mut OpticsState) -> R) -> R {
        f(&mut self.state.lock())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Laser
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimLaser {
    optics: SimOptics,
    rating_watts: f64,
}

impl SimLaser {
    pub fn new(optics: SimOptics) -> Self {
        Self {
            optics,
            rating_watts: 10.0,
        }
    }
}

impl SimDevice for SimLaser {
    fn respond(&self, command: &str) -> Option<String> {
        let mut parts = command.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("*IDN?"), _) => ok_with("LC-LASER-SIM"),
            (Some("PWR?"), _) => ok_with(self.optics.state().power_watts),
            (Some("PWR"), arg) => match parse_number(arg) {
                Some(w) if !(0.0..=self.rating_watts).contains(&w) => {
                    err("RANGE", "power outside rating")
                }
                Some(w) => {
                    self.optics.with(|s| s.power_watts = w);
                    ok()
                }
                None => err("ARG", "bad power"),
            },
            (Some("EMIT"), arg) => match parse_flag(arg) {
                Some(on) => {
                    self.optics.with(|s| s.emission = on);
                    ok()
                }
                None => err("ARG", "expected 0 or 1"),
            },
            (Some("AIM"), arg) => match parse_flag(arg) {
                Some(on) => {
                    self.optics.with(|s| s.aiming_beam = on);
                    ok()
                }
                None => err("ARG", "expected 0 or 1"),
            },
            _ => err("CMD", "unknown command"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Thermal
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
struct ThermalSim {
    ambient_c: f64,
    setpoint_c: f64,
    tec: bool,
}

/// TEC that settles on its setpoint immediately while enabled.
#[derive(Debug, Clone)]
pub struct SimThermal {
    state: Arc<Mutex<ThermalSim>>,
}

impl SimThermal {
    pub fn new(ambient_c: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ThermalSim {
                ambient_c,
                setpoint_c: ambient_c,
                tec: false,
            })),
        }
    }

    pub fn temperature_c(&self) -> f64 {
        let s = self.state.lock();
        if s.tec { s.setpoint_c } else { s.ambient_c }
    }
}

impl SimDevice for SimThermal {
    fn respond(&self, command: &str) -> Option<String> {
        let mut parts = command.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("*IDN?"), _) => ok_with("LC-TEC-SIM"),
            (Some("TEMP?"), _) => ok_with(self.temperature_c()),
            (Some("TSET"), arg) => match parse_number(arg) {
                Some(c) if (5.0..=45.0).contains(&c) => {
                    self.state.lock().setpoint_c = c;
                    ok()
                }
                Some(_) => err("RANGE", "setpoint outside 5..45 C"),
                None => err("ARG", "bad setpoint"),
            },
            (Some("TEC"), arg) => match parse_flag(arg) {
                Some(on) => {
                    self.state.lock().tec = on;
                    ok()
                }
                None => err("ARG", "expected 0 or 1"),
            },
            _ => err("CMD", "unknown command"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Actuator
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
struct Motion {
    origin_mm: f64,
    target_mm: f64,
    speed_mm_s: f64,
    started: Option<Instant>,
}

impl Motion {
    fn position_at(&self, now: Instant) -> f64 {
        let Some(t0) = self.started else {
            return self.origin_mm;
        };
        let span = self.target_mm - self.origin_mm;
        let travelled = self.speed_mm_s * now.duration_since(t0).as_secs_f64();
        if travelled >= span.abs() {
            self.target_mm
        } else {
            self.origin_mm + travelled.copysign(span)
        }
    }

    fn settle(&mut self, now: Instant) {
        let p = self.position_at(now);
        if self.started.is_some() && p == self.target_mm {
            self.origin_mm = p;
            self.started = None;
        }
    }

    fn start(&mut self, target_mm: f64, speed_mm_s: f64, now: Instant) {
        self.origin_mm = self.position_at(now);
        self.target_mm = target_mm;
        self.speed_mm_s = speed_mm_s;
        self.started = Some(now);
    }

    fn hold(&mut self, now: Instant) {
        self.origin_mm = self.position_at(now);
        self.target_mm = self.origin_mm;
        self.started = None;
    }
}

/// Linear stage whose position advances with wall-clock time.
#[derive(Debug, Clone)]
pub struct SimActuator {
    motion: Arc<Mutex<Motion>>,
    home_speed_mm_s: f64,
    travel_mm: (f64, f64),
}

impl SimActuator {
    pub fn new(home_speed_mm_s: f64) -> Self {
        Self {
            motion: Arc::new(Mutex::new(Motion {
                origin_mm: 0.0,
                target_mm: 0.0,
                speed_mm_s: home_speed_mm_s,
                started: None,
            })),
            home_speed_mm_s,
            travel_mm: (-100.0, 100.0),
        }
    }

    pub fn position_mm(&self) -> f64 {
        self.motion.lock().position_at(Instant::now())
    }

    fn start(&self, target: f64, speed: f64) -> Option<String> {
        if !(self.travel_mm.0..=self.travel_mm.1).contains(&target) {
            return err("RANGE", "target outside travel");
        }
        if speed <= 0.0 {
            return err("ARG", "speed must be positive");
        }
        self.motion.lock().start(target, speed, Instant::now());
        ok()
    }
}

impl SimDevice for SimActuator {
    fn respond(&self, command: &str) -> Option<String> {
        let mut parts = command.split_whitespace();
        let verb = parts.next();
        let a = parse_number(parts.next());
        let b = parse_number(parts.next());
        let now = Instant::now();
        match verb {
            Some("*IDN?") => ok_with("LC-STAGE-SIM"),
            Some("POS?") => ok_with(self.motion.lock().position_at(now)),
            Some("MOVING?") => {
                let mut motion = self.motion.lock();
                motion.settle(now);
                ok_with(flag(motion.started.is_some()))
            }
            Some("MOVA") => match (a, b) {
                (Some(target), Some(speed)) => self.start(target, speed),
                _ => err("ARG", "expected <mm> <mm_s>"),
            },
            Some("MOVR") => match (a, b) {
                (Some(delta), Some(speed)) => {
                    let from = self.motion.lock().position_at(now);
                    self.start(from + delta, speed)
                }
                _ => err("ARG", "expected <mm> <mm_s>"),
            },
            Some("HOME") => self.start(0.0, self.home_speed_mm_s),
            Some("HALT") => {
                self.motion.lock().hold(now);
                ok()
            }
            _ => err("CMD", "unknown command"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Interlock MCU
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
struct Mcu {
    footpedal: bool,
    timeout: Duration,
}

/// Safety MCU: footpedal input, hardware watchdog, laser-enable line and a
/// photodiode looking at [`SimOptics`].
#[derive(Debug, Clone)]
pub struct SimInterlock {
    mcu: Arc<Mutex<Mcu>>,
    optics: SimOptics,
}

impl SimInterlock {
    pub fn new(optics: SimOptics) -> Self {
        Self {
            mcu: Arc::new(Mutex::new(Mcu {
                footpedal: false,
                timeout: Duration::from_millis(1000),
            })),
            optics,
        }
    }

    pub fn set_footpedal(&self, pressed: bool) {
        self.mcu.lock().footpedal = pressed;
    }

    pub fn footpedal(&self) -> bool {
        self.mcu.lock().footpedal
    }

    /// Armed and fed within the timeout.
    pub fn watchdog_ok(&self) -> bool {
        self.optics
            .state()
            .watchdog_deadline
            .is_some_and(|d| Instant::now() <= d)
    }

    /// The line as the laser sees it: commanded high and not held low by the
    /// watchdog.
    pub fn laser_enable(&self) -> bool {
        self.optics.state().enable_line && self.watchdog_ok()
    }

    fn feed(&self) {
        let timeout = self.mcu.lock().timeout;
        self.optics
            .with(|s| s.watchdog_deadline = Some(Instant::now() + timeout));
    }
}

impl SimDevice for SimInterlock {
    fn respond(&self, command: &str) -> Option<String> {
        let mut parts = command.split_whitespace();
        let verb = parts.next();
        if !self.watchdog_ok() {
            // A trip latches the line low until it is raised again.
            self.optics.with(|s| s.enable_line = false);
        }
        match verb {
            Some("*IDN?") => ok_with("LC-MCU-SIM"),
            Some("HB") => {
                self.feed();
                ok()
            }
            Some("WDT") => {
                let period = parse_number(parts.next());
                let timeout = parse_number(parts.next());
                match (period, timeout) {
                    (Some(p), Some(t)) if p > 0.0 && t > p => {
                        self.mcu.lock().timeout = Duration::from_millis(t as u64);
                        self.feed();
                        ok()
                    }
                    _ => err("ARG", "expected <period_ms> <timeout_ms> with timeout > period"),
                }
            }
            Some("STAT?") => Some(format!(
                "OK {} {} {}",
                flag(self.footpedal()),
                flag(self.watchdog_ok()),
                flag(self.laser_enable())
            )),
            Some("PD?") => ok_with(self.optics.photodiode_watts()),
            Some("LEN") => match parse_flag(parts.next()) {
                Some(true) if !self.watchdog_ok() => err("WDT", "watchdog tripped"),
                Some(on) => {
                    self.optics.with(|s| s.enable_line = on);
                    ok()
                }
                None => err("ARG", "expected 0 or 1"),
            },
            _ => err("CMD", "unknown command"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Channels and faults
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct FaultState {
    unplugged: AtomicBool,
    silent: AtomicBool,
    garble: AtomicU32,
    busy: AtomicU32,
    swallowed: Mutex<Option<String>>,
}

/// Fault-injection handle for one simulated endpoint.
#[derive(Debug, Clone, Default)]
pub struct SimFaults {
    state: Arc<FaultState>,
}

impl SimFaults {
    pub fn unplug(&self) {
        self.state.unplugged.store(true, Ordering::SeqCst);
    }

    pub fn replug(&self) {
        self.state.unplugged.store(false, Ordering::SeqCst);
    }

    pub fn silence(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    pub fn garble_next(&self, count: u32) {
        self.state.garble.store(count, Ordering::SeqCst);
    }

    pub fn busy_next(&self, count: u32) {
        self.state.busy.store(count, Ordering::SeqCst);
    }

    /// Drop commands starting with `prefix` before they reach the device.
    /// `None` clears the filter.
    pub fn swallow(&self, prefix: Option<&str>) {
        *self.state.swallowed.lock() = prefix.map(str::to_string);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct SimChannel {
    device: Arc<dyn SimDevice>,
    faults: SimFaults,
    inbox: VecDeque<String>,
}

impl SimChannel {
    fn check_plugged(&self) -> Result<(), ChannelError> {
        if self.faults.state.unplugged.load(Ordering::SeqCst) {
            Err(ChannelError::Closed("simulated unplug".into()))
        } else {
            Ok(())
        }
    }
}

impl Channel for SimChannel {
    fn discard_pending(&mut self) -> Result<(), ChannelError> {
        self.check_plugged()?;
        self.inbox.clear();
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        self.check_plugged()?;
        let faults = &self.faults.state;
        if faults.silent.load(Ordering::SeqCst) {
            return Ok(());
        }
        let swallowed = faults
            .swallowed
            .lock()
            .as_deref()
            .is_some_and(|prefix| line.starts_with(prefix));
        if swallowed {
            return Ok(());
        }
        if SimFaults::take(&faults.busy) {
            self.inbox.push_back(format!("ERR {} device busy", HardwareError::BUSY));
            return Ok(());
        }
        if let Some(response) = self.device.respond(line) {
            if SimFaults::take(&faults.garble) {
                self.inbox.push_back("#@!~".into());
            } else {
                self.inbox.push_back(response);
            }
        }
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String, ChannelError> {
        self.check_plugged()?;
        match self.inbox.pop_front() {
            Some(line) => Ok(line),
            None => {
                std::thread::sleep(timeout);
                Err(ChannelError::Timeout)
            }
        }
    }
}

/// Maps channel identifiers to simulated devices.
#[derive(Default)]
pub struct SimOpener {
    endpoints: HashMap<String, (Arc<dyn SimDevice>, SimFaults)>,
}

impl SimOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `device` on `channel_id`; returns its fault handle.
    pub fn attach(&mut self, channel_id: &str, device: impl SimDevice + 'static) -> SimFaults {
        let faults = SimFaults::default();
        self.endpoints
            .insert(channel_id.to_string(), (Arc::new(device), faults.clone()));
        faults
    }
}

impl ChannelOpener for SimOpener {
    fn open(&self, channel_id: &str, _settings: &DeviceConfig) -> Result<Box<dyn Channel>, ChannelError> {
        let (device, faults) = self
            .endpoints
            .get(channel_id)
            .ok_or_else(|| ChannelError::NotFound(channel_id.to_string()))?;
        if faults.state.unplugged.load(Ordering::SeqCst) {
            return Err(ChannelError::NotFound(channel_id.to_string()));
        }
        Ok(Box::new(SimChannel {
            device: Arc::clone(device),
            faults: faults.clone(),
            inbox: VecDeque::new(),
        }))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bench
// ────────────────────────────────────────────────────────────────────────────

/// A [`DeviceSet`] wired to simulated devices on the configured channel ids,
/// plus handles to every simulated device.
pub struct SimBench {
    pub devices: Arc<DeviceSet>,
    pub laser: SimLaser,
    pub thermal: SimThermal,
    pub actuator: SimActuator,
    pub interlock: SimInterlock,
    pub optics: SimOptics,
    pub camera: Arc<SimCamera>,
    pub notifier: Notifier,
    faults: HashMap<DeviceKind, SimFaults>,
}

impl SimBench {
    /// Assemble without connecting.
    pub fn assemble(config: &StartupConfig, notifier: Notifier) -> Self {
        let optics = SimOptics::default();
        let laser = SimLaser::new(optics.clone());
        let thermal = SimThermal::new(22.0);
        let actuator = SimActuator::new(config.engine.home_speed_mm_s);
        let interlock = SimInterlock::new(optics.clone());

        let mut opener = SimOpener::new();
        let mut faults = HashMap::new();
        faults.insert(
            DeviceKind::Laser,
            opener.attach(&config.laser.channel, laser.clone()),
        );
        faults.insert(
            DeviceKind::Thermal,
            opener.attach(&config.thermal.channel, thermal.clone()),
        );
        faults.insert(
            DeviceKind::Actuator,
            opener.attach(&config.actuator.channel, actuator.clone()),
        );
        faults.insert(
            DeviceKind::Interlock,
            opener.attach(&config.interlock.channel, interlock.clone()),
        );

        let camera = Arc::new(SimCamera::new(notifier.clone()));
        let devices = DeviceSet::new(config, Arc::new(opener), notifier.clone())
            .with_camera(camera.clone());

        Self {
            devices: Arc::new(devices),
            laser,
            thermal,
            actuator,
            interlock,
            optics,
            camera,
            notifier,
            faults,
        }
    }

    /// Assemble on `notifier` and connect every device.
    pub fn start_with(config: &StartupConfig, notifier: Notifier) -> Result<Self, HardwareError> {
        let bench = Self::assemble(config, notifier);
        bench.devices.connect_all()?;
        Ok(bench)
    }

    /// Assemble on a private in-memory notifier and connect every device.
    pub fn start(config: &StartupConfig) -> Result<Self, HardwareError> {
        let (notifier, _) = Notifier::in_memory();
        Self::start_with(config, notifier)
    }

    pub fn faults(&self, kind: DeviceKind) -> Option<&SimFaults> {
        self.faults.get(&kind)
    }
}
