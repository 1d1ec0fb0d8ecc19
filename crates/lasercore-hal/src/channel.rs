//! Line-oriented communication channels.
//!
//! A [`Channel`] is the byte pipe a controller talks through. Controllers
//! never see the transport: real hardware is reached through
//! [`SerialOpener`], simulated hardware through
//! [`SimOpener`][crate::sim::SimOpener]. Both hand back a boxed [`Channel`]
//! from [`ChannelOpener::open`].

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use lasercore_types::{DeviceConfig, DeviceKind, HardwareError};
use serialport::{ClearBuffer, SerialPort};
use thiserror::Error;
use tracing::debug;

/// Transport-level failures, before device and command context is attached.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("channel '{0}' not found")]
    NotFound(String),

    #[error("no response within the timeout")]
    Timeout,

    #[error("channel closed: {0}")]
    Closed(String),

    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    /// Attach the device and command the failure happened on.
    pub fn into_hardware(self, device: DeviceKind, command: &str, timeout: Duration) -> HardwareError {
        match self {
            ChannelError::NotFound(channel) => HardwareError::NotFound(channel),
            ChannelError::Timeout => HardwareError::Timeout {
                device,
                command: command.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            ChannelError::Closed(details) => HardwareError::ChannelLost { device, details },
            ChannelError::Io(e) => HardwareError::ChannelLost {
                device,
                details: e.to_string(),
            },
        }
    }
}

/// An exclusively owned, line-oriented byte pipe.
pub trait Channel: Send {
    /// Drop anything buffered in either direction.
    fn discard_pending(&mut self) -> Result<(), ChannelError>;

    /// Write `line` followed by `\n`.
    fn write_line(&mut self, line: &str) -> Result<(), ChannelError>;

    /// Read one response line without its terminator.
    fn read_line(&mut self, timeout: Duration) -> Result<String, ChannelError>;
}

/// Opens channels by identifier.
pub trait ChannelOpener: Send + Sync {
    fn open(&self, channel_id: &str, settings: &DeviceConfig) -> Result<Box<dyn Channel>, ChannelError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Serial
// ────────────────────────────────────────────────────────────────────────────

/// Opens `/dev/tty*` / `COM*` ports with the `serialport` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

impl ChannelOpener for SerialOpener {
    fn open(&self, channel_id: &str, settings: &DeviceConfig) -> Result<Box<dyn Channel>, ChannelError> {
        let port = serialport::new(channel_id, settings.baud_rate)
            .timeout(settings.command_timeout())
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice
                | serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
                    ChannelError::NotFound(channel_id.to_string())
                }
                _ => ChannelError::Closed(e.to_string()),
            })?;
        debug!(port = channel_id, baud = settings.baud_rate, "serial port opened");
        Ok(Box::new(SerialChannel::new(port)))
    }
}

pub struct SerialChannel {
    port: Box<dyn SerialPort>,
    pending: Vec<u8>,
}

impl SerialChannel {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            pending: Vec::new(),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&raw).trim_end().to_string())
    }
}

impl Channel for SerialChannel {
    fn discard_pending(&mut self) -> Result<(), ChannelError> {
        self.pending.clear();
        self.port
            .clear(ClearBuffer::All)
            .map_err(|e| ChannelError::Closed(e.to_string()))
    }

    fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()?;
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String, ChannelError> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChannelError::Timeout);
            }
            self.port
                .set_timeout(remaining)
                .map_err(|e| ChannelError::Closed(e.to_string()))?;
            match self.port.read(&mut buf) {
                Ok(0) => return Err(ChannelError::Closed("end of stream".into())),
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(ChannelError::Timeout),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_maps_with_context() {
        let err = ChannelError::Timeout.into_hardware(
            DeviceKind::Actuator,
            "POS?",
            Duration::from_millis(500),
        );
        assert_eq!(
            err,
            HardwareError::Timeout {
                device: DeviceKind::Actuator,
                command: "POS?".into(),
                timeout_ms: 500,
            }
        );
        assert!(err.is_transient());
    }

    #[test]
    fn closed_and_io_are_permanent() {
        let closed = ChannelError::Closed("unplugged".into()).into_hardware(
            DeviceKind::Laser,
            "PWR 1.000",
            Duration::from_millis(500),
        );
        assert!(closed.is_permanent());
        let io = ChannelError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"))
            .into_hardware(DeviceKind::Laser, "PWR?", Duration::from_millis(500));
        assert!(io.is_permanent());
    }

    #[test]
    fn missing_serial_port_is_not_found() {
        let settings = DeviceConfig::on("/dev/lasercore-does-not-exist");
        match SerialOpener.open("/dev/lasercore-does-not-exist", &settings) {
            Err(ChannelError::NotFound(id)) => assert_eq!(id, "/dev/lasercore-does-not-exist"),
            Err(ChannelError::Closed(_)) => {}
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("opened a port that does not exist"),
        }
    }
}
