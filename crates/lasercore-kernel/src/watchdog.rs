//! [`WatchdogSupervisor`] – host-side heartbeat deadline combined with the
//! MCU's own watchdog line into the `watchdog_ok` interlock.
//!
//! The interlock microcontroller runs its own hardware watchdog. The host
//! tracks the same heartbeat from its side: every acknowledged `HB` resets a
//! deadline, and a missed deadline is a [`SafetyViolation::WatchdogTimeout`]
//! even when the MCU has not reported a trip yet.

use std::time::{Duration, Instant};

use lasercore_types::{InterlockField, SafetyViolation, WatchdogConfig};

use crate::machine::SafetyInput;

/// `watchdog_ok` holds only while the heartbeat is fresh and the MCU reports
/// its line healthy. [`WatchdogSupervisor::evaluate`] returns an input for the
/// safety monitor when the combined value changes.
///
/// ```
/// use lasercore_kernel::WatchdogSupervisor;
/// use lasercore_types::WatchdogConfig;
///
/// let mut sup = WatchdogSupervisor::new(&WatchdogConfig::default());
/// assert!(!sup.is_ok());
/// sup.heartbeat_acknowledged();
/// sup.mcu_status(true);
/// assert!(sup.is_ok());
/// ```
#[derive(Debug)]
pub struct WatchdogSupervisor {
    /// `None` until the first acknowledgement, and again after link loss.
    last_ack: Option<Instant>,
    timeout: Duration,
    mcu_ok: bool,
    reported: Option<bool>,
}

impl WatchdogSupervisor {
    pub fn new(config: &WatchdogConfig) -> Self {
        Self {
            last_ack: None,
            timeout: config.timeout(),
            mcu_ok: false,
            reported: None,
        }
    }

    /// The MCU acknowledged a heartbeat; the deadline restarts now.
    pub fn heartbeat_acknowledged(&mut self) {
        self.last_ack = Some(Instant::now());
    }

    /// The MCU's reported watchdog line.
    pub fn mcu_status(&mut self, ok: bool) {
        self.mcu_ok = ok;
    }

    /// The link to the MCU is gone; nothing is known any more.
    pub fn link_lost(&mut self) {
        self.last_ack = None;
        self.mcu_ok = false;
    }

    /// Time since the last acknowledged heartbeat.
    pub fn silence(&self) -> Option<Duration> {
        self.last_ack.map(|at| at.elapsed())
    }

    fn heartbeat_fresh(&self) -> bool {
        self.silence().is_some_and(|s| s <= self.timeout)
    }

    pub fn is_ok(&self) -> bool {
        self.mcu_ok && self.heartbeat_fresh()
    }

    pub fn evaluate(&mut self) -> Option<SafetyInput> {
        let ok = self.is_ok();
        if self.reported == Some(ok) {
            return None;
        }
        self.reported = Some(ok);
        if ok {
            return Some(SafetyInput::Signal(InterlockField::WatchdogOk, true));
        }
        Some(match self.silence() {
            Some(silence) if silence > self.timeout => {
                SafetyInput::Violation(SafetyViolation::WatchdogTimeout {
                    elapsed_ms: u64::try_from(silence.as_millis()).unwrap_or(u64::MAX),
                })
            }
            _ => SafetyInput::Violation(SafetyViolation::InterlockLost(InterlockField::WatchdogOk)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn config(timeout_ms: u64) -> WatchdogConfig {
        WatchdogConfig {
            heartbeat_period_ms: timeout_ms / 2,
            timeout_ms,
            status_poll_ms: 5,
        }
    }

    #[test]
    fn heartbeats_keep_the_deadline_fresh() {
        let mut sup = WatchdogSupervisor::new(&config(30));
        sup.mcu_status(true);
        sup.heartbeat_acknowledged();
        thread::sleep(Duration::from_millis(20));
        sup.heartbeat_acknowledged();
        thread::sleep(Duration::from_millis(20));
        assert!(sup.is_ok());
    }

    #[test]
    fn supervisor_needs_both_sides() {
        let mut sup = WatchdogSupervisor::new(&config(1000));
        assert!(matches!(
            sup.evaluate(),
            Some(SafetyInput::Violation(SafetyViolation::InterlockLost(InterlockField::WatchdogOk)))
        ));
        sup.heartbeat_acknowledged();
        assert_eq!(sup.evaluate(), None);
        sup.mcu_status(true);
        assert_eq!(
            sup.evaluate(),
            Some(SafetyInput::Signal(InterlockField::WatchdogOk, true))
        );
        assert_eq!(sup.evaluate(), None);
    }

    #[test]
    fn starvation_is_reported_as_timeout() {
        let mut sup = WatchdogSupervisor::new(&config(20));
        sup.heartbeat_acknowledged();
        sup.mcu_status(true);
        assert!(sup.evaluate().is_some());
        thread::sleep(Duration::from_millis(40));
        match sup.evaluate() {
            Some(SafetyInput::Violation(SafetyViolation::WatchdogTimeout { elapsed_ms })) => {
                assert!(elapsed_ms > 20);
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
        sup.heartbeat_acknowledged();
        assert_eq!(
            sup.evaluate(),
            Some(SafetyInput::Signal(InterlockField::WatchdogOk, true))
        );
    }

    #[test]
    fn link_loss_drops_watchdog_ok() {
        let mut sup = WatchdogSupervisor::new(&config(1000));
        sup.heartbeat_acknowledged();
        sup.mcu_status(true);
        sup.evaluate();
        sup.link_lost();
        assert!(!sup.is_ok());
        assert_eq!(sup.silence(), None);
        assert!(matches!(
            sup.evaluate(),
            Some(SafetyInput::Violation(SafetyViolation::InterlockLost(InterlockField::WatchdogOk)))
        ));
    }
}
