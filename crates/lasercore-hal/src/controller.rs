//! [`ControllerCore`] – the part every device controller shares.
//!
//! The core owns the [`ChannelLease`] behind a reentrant lock and runs the
//! command cycle:
//!
//! 1. take the controller lock (reentrant, so composite operations can hold it
//!    across several commands),
//! 2. discard pending input/output,
//! 3. write the command line,
//! 4. read exactly one response line within the command timeout,
//! 5. release.
//!
//! Responses follow the `OK [values]` / `ERR <code> <message>` convention.
//! A permanent channel failure drops the lease, flips `connected` to false,
//! and is reported exactly once.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lasercore_middleware::Notifier;
use lasercore_types::{DeviceConfig, DeviceKind, DeviceNotification, EventPayload, HardwareError};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, error, info, warn};

use crate::channel::ChannelOpener;
use crate::registry::{ChannelLease, ChannelRegistry};

type LeaseSlot = RefCell<Option<ChannelLease>>;

// ────────────────────────────────────────────────────────────────────────────
// Notifications
// ────────────────────────────────────────────────────────────────────────────

/// Emits one device's notifications.
///
/// Connection changes, errors and every change that affects laser output are
/// audited; high-rate readings are published live only.
#[derive(Clone, Debug)]
pub struct DeviceNotifier {
    device: DeviceKind,
    source: String,
    notifier: Notifier,
}

impl DeviceNotifier {
    pub fn new(device: DeviceKind, notifier: Notifier) -> Self {
        Self {
            device,
            source: device.source(),
            notifier,
        }
    }

    pub fn emit(&self, notification: DeviceNotification) {
        let audited = matches!(
            notification,
            DeviceNotification::ConnectionChanged { .. }
                | DeviceNotification::ErrorOccurred { .. }
                | DeviceNotification::EmissionChanged { .. }
                | DeviceNotification::LaserEnableLine { .. }
                | DeviceNotification::WatchdogStatus { .. }
                | DeviceNotification::FootpedalChanged { .. }
        );
        let payload = EventPayload::Device {
            device: self.device,
            notification,
        };
        if audited {
            self.notifier.record(&self.source, payload);
        } else {
            self.notifier.notify(&self.source, payload);
        }
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Core
// ────────────────────────────────────────────────────────────────────────────

pub struct ControllerCore {
    device: DeviceKind,
    settings: DeviceConfig,
    registry: ChannelRegistry,
    opener: Arc<dyn ChannelOpener>,
    lease: ReentrantMutex<LeaseSlot>,
    connected: AtomicBool,
    notifier: DeviceNotifier,
}

/// Holds a controller's lock across several commands.
pub struct Exclusive<'a> {
    _guard: ReentrantMutexGuard<'a, LeaseSlot>,
}

impl ControllerCore {
    pub fn new(
        device: DeviceKind,
        settings: DeviceConfig,
        registry: ChannelRegistry,
        opener: Arc<dyn ChannelOpener>,
        notifier: Notifier,
    ) -> Self {
        Self {
            device,
            settings,
            registry,
            opener,
            lease: ReentrantMutex::new(RefCell::new(None)),
            connected: AtomicBool::new(false),
            notifier: DeviceNotifier::new(device, notifier),
        }
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }

    pub fn settings(&self) -> &DeviceConfig {
        &self.settings
    }

    pub fn notifier(&self) -> &DeviceNotifier {
        &self.notifier
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Channel currently held, if any.
    pub fn channel_id(&self) -> Option<String> {
        let guard = self.lease.lock();
        let slot = guard.borrow();
        slot.as_ref().map(|lease| lease.channel_id().to_string())
    }

    /// Lock the controller for a composite operation.
    pub fn exclusive(&self) -> Exclusive<'_> {
        Exclusive {
            _guard: self.lease.lock(),
        }
    }

    /// Open `channel_id` and identify the device.
    ///
    /// Idempotent when already connected to the same channel. Connecting to a
    /// different channel releases the old one first.
    pub fn connect(&self, channel_id: &str) -> Result<String, HardwareError> {
        let guard = self.lease.lock();
        let current = guard.borrow().as_ref().map(|l| l.channel_id().to_string());
        match current {
            Some(ref id) if id == channel_id && self.is_connected() => {
                debug!(device = %self.device, channel = channel_id, "already connected");
                return Ok(String::new());
            }
            Some(_) => self.disconnect(),
            None => {}
        }

        let lease = self
            .registry
            .acquire(channel_id, self.device, self.opener.as_ref(), &self.settings)?;
        *guard.borrow_mut() = Some(lease);

        let identity = match self.transact("*IDN?") {
            Ok(identity) => identity,
            Err(e) => {
                guard.borrow_mut().take();
                warn!(device = %self.device, channel = channel_id, error = %e, "handshake failed");
                return Err(e);
            }
        };

        self.connected.store(true, Ordering::SeqCst);
        info!(device = %self.device, channel = channel_id, identity = %identity, "connected");
        self.notifier.emit(DeviceNotification::ConnectionChanged {
            connected: true,
            channel: Some(channel_id.to_string()),
        });
        Ok(identity)
    }

    /// Release the channel. Never fails for the caller.
    pub fn disconnect(&self) {
        let guard = self.lease.lock();
        let released = guard.borrow_mut().take();
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(device = %self.device, "disconnected");
            self.notifier.emit(DeviceNotification::ConnectionChanged {
                connected: false,
                channel: released.as_ref().map(|l| l.channel_id().to_string()),
            });
        }
    }

    /// Run one command/response cycle and return the payload after `OK`.
    pub fn transact(&self, command: &str) -> Result<String, HardwareError> {
        let timeout = self.settings.command_timeout();
        let guard = self.lease.lock();
        let exchanged = {
            let mut slot = guard.borrow_mut();
            let Some(lease) = slot.as_mut() else {
                return Err(HardwareError::NotConnected {
                    device: self.device,
                });
            };
            let result = exchange(lease, command, timeout)
                .map_err(|e| e.into_hardware(self.device, command, timeout));
            if matches!(&result, Err(e) if e.is_permanent()) {
                slot.take();
            }
            result
        };

        let outcome = exchanged.and_then(|line| parse_response(self.device, command, &line));
        if let Err(e) = &outcome {
            self.report(e);
        }
        outcome
    }

    /// [`transact`][Self::transact] and parse a single number.
    pub fn query_f64(&self, command: &str) -> Result<f64, HardwareError> {
        let payload = self.transact(command)?;
        payload
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| self.malformed(command, &payload))
    }

    /// [`transact`][Self::transact] and parse `count` space-separated `0|1`
    /// flags.
    pub fn query_flags(&self, command: &str, count: usize) -> Result<Vec<bool>, HardwareError> {
        let payload = self.transact(command)?;
        let flags: Option<Vec<bool>> = payload
            .split_whitespace()
            .map(|token| match token {
                "0" => Some(false),
                "1" => Some(true),
                _ => None,
            })
            .collect();
        match flags {
            Some(flags) if flags.len() == count => Ok(flags),
            _ => Err(self.malformed(command, &payload)),
        }
    }

    fn malformed(&self, command: &str, response: &str) -> HardwareError {
        let e = HardwareError::MalformedResponse {
            device: self.device,
            command: command.to_string(),
            response: response.to_string(),
        };
        self.report(&e);
        e
    }

    fn report(&self, e: &HardwareError) {
        if e.is_permanent() {
            if self.connected.swap(false, Ordering::SeqCst) {
                error!(device = %self.device, error = %e, "channel lost");
                self.notifier.emit(DeviceNotification::ErrorOccurred {
                    message: e.to_string(),
                    permanent: true,
                });
                self.notifier.emit(DeviceNotification::ConnectionChanged {
                    connected: false,
                    channel: None,
                });
            }
        } else if self.is_connected() {
            warn!(device = %self.device, error = %e, "command failed");
            self.notifier.emit(DeviceNotification::ErrorOccurred {
                message: e.to_string(),
                permanent: false,
            });
        }
    }
}

impl std::fmt::Debug for ControllerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerCore")
            .field("device", &self.device)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

fn exchange(
    lease: &mut ChannelLease,
    command: &str,
    timeout: Duration,
) -> Result<String, crate::channel::ChannelError> {
    let channel = lease.channel_mut();
    channel.discard_pending()?;
    channel.write_line(command)?;
    channel.read_line(timeout)
}

/// Split a response line into its `OK` payload or a typed failure.
pub fn parse_response(device: DeviceKind, command: &str, line: &str) -> Result<String, HardwareError> {
    let line = line.trim();
    if line == "OK" {
        return Ok(String::new());
    }
    if let Some(rest) = line.strip_prefix("OK ") {
        return Ok(rest.trim().to_string());
    }
    if let Some(rest) = line.strip_prefix("ERR ") {
        let mut parts = rest.trim().splitn(2, ' ');
        let code = parts.next().unwrap_or_default().to_string();
        let message = parts.next().unwrap_or_default().to_string();
        if !code.is_empty() {
            return Err(HardwareError::Rejected {
                device,
                command: command.to_string(),
                code,
                message,
            });
        }
    }
    Err(HardwareError::MalformedResponse {
        device,
        command: command.to_string(),
        response: line.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimLaser, SimOpener, SimOptics};
    use lasercore_middleware::{Topic, TopicReceiver};

    fn core_on_sim() -> (ControllerCore, crate::sim::SimFaults, TopicReceiver) {
        let mut opener = SimOpener::new();
        let faults = opener.attach("sim:laser", SimLaser::new(SimOptics::default()));
        let (notifier, _sink) = Notifier::in_memory();
        let rx = notifier.bus().subscribe_to(Topic::Devices);
        let mut settings = DeviceConfig::on("sim:laser");
        settings.command_timeout_ms = 30;
        let core = ControllerCore::new(
            DeviceKind::Laser,
            settings,
            ChannelRegistry::new(),
            Arc::new(opener),
            notifier,
        );
        (core, faults, rx)
    }

    fn drain(rx: &mut TopicReceiver) -> Vec<DeviceNotification> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EventPayload::Device { notification, .. } = event.payload {
                out.push(notification);
            }
        }
        out
    }

    #[test]
    fn parse_ok_err_and_garbage() {
        let d = DeviceKind::Laser;
        assert_eq!(parse_response(d, "PWR?", "OK 1.500").unwrap(), "1.500");
        assert_eq!(parse_response(d, "EMIT 1", "OK").unwrap(), "");
        let busy = parse_response(d, "PWR 2", "ERR BUSY ramp in progress").unwrap_err();
        assert!(busy.is_transient());
        let rejected = parse_response(d, "PWR 99", "ERR RANGE above rating").unwrap_err();
        assert!(!rejected.is_transient());
        assert!(matches!(
            parse_response(d, "PWR?", "#@!"),
            Err(HardwareError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn connect_is_idempotent() {
        let (core, _faults, mut rx) = core_on_sim();
        core.connect("sim:laser").unwrap();
        core.connect("sim:laser").unwrap();
        assert!(core.is_connected());
        let connects = drain(&mut rx)
            .into_iter()
            .filter(|n| matches!(n, DeviceNotification::ConnectionChanged { connected: true, .. }))
            .count();
        assert_eq!(connects, 1);
    }

    #[test]
    fn transact_without_connection_is_not_connected() {
        let (core, _faults, _rx) = core_on_sim();
        assert_eq!(
            core.transact("PWR?").unwrap_err(),
            HardwareError::NotConnected {
                device: DeviceKind::Laser
            }
        );
    }

    #[test]
    fn permanent_failure_is_reported_once() {
        let (core, faults, mut rx) = core_on_sim();
        core.connect("sim:laser").unwrap();
        drain(&mut rx);

        faults.unplug();
        assert!(core.transact("PWR?").unwrap_err().is_permanent());
        assert!(core.transact("PWR?").unwrap_err().is_permanent());
        assert!(!core.is_connected());
        assert_eq!(core.channel_id(), None);

        let notes = drain(&mut rx);
        let errors = notes
            .iter()
            .filter(|n| matches!(n, DeviceNotification::ErrorOccurred { permanent: true, .. }))
            .count();
        assert_eq!(errors, 1);
        assert!(notes.contains(&DeviceNotification::ConnectionChanged {
            connected: false,
            channel: None
        }));
    }

    #[test]
    fn silent_device_times_out_transiently() {
        let (core, faults, _rx) = core_on_sim();
        core.connect("sim:laser").unwrap();
        faults.silence(true);
        let err = core.transact("PWR?").unwrap_err();
        assert!(err.is_transient(), "{err}");
        assert!(core.is_connected());
        faults.silence(false);
        assert!(core.query_f64("PWR?").is_ok());
    }

    #[test]
    fn garbage_is_malformed_and_stale_lines_are_discarded() {
        let (core, faults, _rx) = core_on_sim();
        core.connect("sim:laser").unwrap();
        faults.garble_next(1);
        assert!(matches!(
            core.query_f64("PWR?"),
            Err(HardwareError::MalformedResponse { .. })
        ));
        assert_eq!(core.query_f64("PWR?").unwrap(), 0.0);
    }

    #[test]
    fn exclusive_allows_nested_commands() {
        let (core, _faults, _rx) = core_on_sim();
        core.connect("sim:laser").unwrap();
        let _held = core.exclusive();
        core.transact("PWR 1.000").unwrap();
        assert_eq!(core.query_f64("PWR?").unwrap(), 1.0);
    }
}
