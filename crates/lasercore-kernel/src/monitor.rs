//! [`SafetyMonitor`] – the thread-safe owner of the safety state machine.
//!
//! Controllers, the aggregator, the engine and the operator all feed the same
//! monitor. Each input is applied under one lock, the resulting
//! [`SafetySnapshot`] is published on a `tokio::sync::watch` channel before
//! the lock is released, and the transition is recorded through the
//! [`Notifier`] afterwards so that no I/O happens inside the critical section.
//!
//! # Developer bypass
//!
//! An active [`SafetyOverride`] masks the four hardware interlocks: the machine
//! sees them as satisfied while the snapshot keeps reporting the real values.
//! `session_valid` is never masked. Disabling the override replays the real
//! values into the machine, and an emergency stop disables it.

use lasercore_middleware::Notifier;
use lasercore_types::{
    EventPayload, InterlockField, InterlockStatus, OperatorCommand, SafetyError, SafetyOverride,
    SafetySnapshot, SafetyState, SafetyViolation, TransitionCause,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::machine::{SafetyInput, SafetyStateMachine, Transition};

const SOURCE: &str = "lasercore-kernel::monitor";

/// The explicit, attributable request that enables a developer bypass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideAuthorization {
    pub operator: String,
    pub reason: String,
}

impl OverrideAuthorization {
    pub fn new(operator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            reason: reason.into(),
        }
    }
}

struct MonitorState {
    machine: SafetyStateMachine,
    /// Values as reported by the hardware, regardless of any bypass.
    raw: InterlockStatus,
    bypass: Option<SafetyOverride>,
    sequence: u64,
}

impl MonitorState {
    fn snapshot(&self) -> SafetySnapshot {
        let state = self.machine.state();
        SafetySnapshot {
            state,
            interlocks: self.raw,
            bypass: self.bypass.clone(),
            laser_permitted: self.machine.laser_permitted(self.bypass.as_ref()),
            sequence: self.sequence,
        }
    }

    fn masked(&self, field: InterlockField) -> bool {
        self.bypass.is_some() && field != InterlockField::SessionValid
    }

    /// Apply `input` and collect the record it produces.
    fn feed(
        &mut self,
        input: SafetyInput,
        events: &mut Vec<EventPayload>,
    ) -> Result<Option<Transition>, SafetyError> {
        let state = self.machine.state();
        let described = input.to_string();
        let outcome = self.machine.apply(input);
        match &outcome {
            Ok(Some(t)) => events.push(EventPayload::SafetyStateChanged {
                from: t.from,
                to: t.to,
                cause: t.cause.clone(),
            }),
            Ok(None) => {}
            Err(e) => events.push(EventPayload::TransitionRejected {
                state,
                input: described,
                reason: e.to_string(),
            }),
        }
        outcome
    }

    /// Bring the machine's view of every interlock in line with `raw`,
    /// honouring the bypass mask.
    fn resync(&mut self, events: &mut Vec<EventPayload>) -> Option<Transition> {
        let mut last = None;
        for field in InterlockField::ALL {
            let wanted = self.raw.get(field) || self.masked(field);
            if self.machine.interlocks().get(field) != wanted {
                if let Ok(Some(t)) = self.feed(SafetyInput::Signal(field, wanted), events) {
                    last = Some(t);
                }
            }
        }
        last
    }
}

/// Thread-safe safety authority.
///
/// ```
/// use lasercore_kernel::SafetyMonitor;
/// use lasercore_middleware::Notifier;
/// use lasercore_types::{InterlockField, OperatorCommand, SafetyState};
///
/// let (notifier, _audit) = Notifier::in_memory();
/// let monitor = SafetyMonitor::new(notifier);
/// monitor.command(OperatorCommand::StartSession).unwrap();
/// for field in [
///     InterlockField::FootpedalPressed,
///     InterlockField::PhotodiodePowerOk,
///     InterlockField::WatchdogOk,
///     InterlockField::GpioLinkOk,
/// ] {
///     monitor.signal(field, true);
/// }
/// assert_eq!(monitor.state(), SafetyState::Armed);
/// assert!(monitor.snapshot().laser_permitted);
/// ```
pub struct SafetyMonitor {
    inner: Mutex<MonitorState>,
    /// Taken before `inner` is released so records leave in state order.
    emit: Mutex<()>,
    snapshots: watch::Sender<SafetySnapshot>,
    notifier: Notifier,
}

impl SafetyMonitor {
    pub fn new(notifier: Notifier) -> Self {
        let (snapshots, _) = watch::channel(SafetySnapshot::initial());
        Self {
            inner: Mutex::new(MonitorState {
                machine: SafetyStateMachine::new(),
                raw: InterlockStatus::default(),
                bypass: None,
                sequence: 0,
            }),
            emit: Mutex::new(()),
            snapshots,
            notifier,
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// A hardware-derived interlock value.
    pub fn signal(&self, field: InterlockField, value: bool) -> Option<Transition> {
        self.update(|st, events| {
            if st.raw.set(field, value) {
                events.push(EventPayload::InterlockChanged {
                    field,
                    value,
                    status: st.raw,
                });
            }
            if st.masked(field) || st.machine.interlocks().get(field) == value {
                return None;
            }
            st.feed(SafetyInput::Signal(field, value), events).ok().flatten()
        })
    }

    /// A detected violation. Clears the field it concerns.
    pub fn violation(&self, violation: SafetyViolation) -> Option<Transition> {
        warn!(%violation, "safety violation");
        let field = violation.field();
        self.update(|st, events| {
            if st.raw.set(field, false) {
                events.push(EventPayload::InterlockChanged {
                    field,
                    value: false,
                    status: st.raw,
                });
            }
            if st.masked(field) {
                return None;
            }
            st.feed(SafetyInput::Violation(violation), events).ok().flatten()
        })
    }

    /// An operator command. Rejections are logged and recorded.
    pub fn command(&self, command: OperatorCommand) -> Result<Option<Transition>, SafetyError> {
        let outcome = self.update(|st, events| {
            let session_before = st.machine.interlocks().session_valid;
            let outcome = st.feed(SafetyInput::Command(command), events);
            let session = st.machine.interlocks().session_valid;
            if session != session_before && st.raw.set(InterlockField::SessionValid, session) {
                events.push(EventPayload::InterlockChanged {
                    field: InterlockField::SessionValid,
                    value: session,
                    status: st.raw,
                });
            }
            if command == OperatorCommand::EmergencyStop && st.machine.state() == SafetyState::EmergencyStop {
                if let Some(bypass) = st.bypass.take() {
                    events.push(EventPayload::OverrideChanged {
                        active: false,
                        operator: bypass.operator().to_string(),
                        reason: "cleared by emergency stop".to_string(),
                    });
                    st.resync(events);
                }
            }
            outcome
        });
        if let Err(e) = &outcome {
            warn!(%command, error = %e, "operator command rejected");
        }
        outcome
    }

    /// First step out of `EmergencyStop`. The token must be quoted by
    /// [`SafetyMonitor::confirm_emergency_reset`].
    pub fn request_emergency_reset(&self) -> Result<Uuid, SafetyError> {
        self.update(|st, events| {
            st.feed(SafetyInput::Command(OperatorCommand::RequestEmergencyReset), events)?;
            st.machine.pending_reset().ok_or(SafetyError::ResetNotRequested)
        })
    }

    pub fn confirm_emergency_reset(&self, token: Uuid) -> Result<Option<Transition>, SafetyError> {
        self.command(OperatorCommand::ConfirmEmergencyReset { token })
    }

    /// Enable the developer bypass. Always logged and recorded.
    pub fn enable_override(
        &self,
        authorization: OverrideAuthorization,
    ) -> Result<SafetyOverride, SafetyError> {
        let bypass = SafetyOverride::authorize(&authorization.operator, &authorization.reason)?;
        warn!(
            operator = bypass.operator(),
            reason = bypass.reason(),
            id = %bypass.id(),
            "SAFETY OVERRIDE ENABLED"
        );
        let enabled = bypass.clone();
        self.update(move |st, events| {
            if st.machine.state() == SafetyState::EmergencyStop {
                return Err(SafetyError::OverrideRejected(
                    "cannot bypass interlocks during an emergency stop".to_string(),
                ));
            }
            events.push(EventPayload::OverrideChanged {
                active: true,
                operator: bypass.operator().to_string(),
                reason: bypass.reason().to_string(),
            });
            st.bypass = Some(bypass);
            st.resync(events);
            Ok(())
        })?;
        Ok(enabled)
    }

    /// Disable the bypass and let the real interlock values take effect.
    /// Returns the override that was active, if any.
    pub fn disable_override(&self) -> Option<SafetyOverride> {
        self.update(|st, events| {
            let bypass = st.bypass.take()?;
            warn!(operator = bypass.operator(), "safety override disabled");
            events.push(EventPayload::OverrideChanged {
                active: false,
                operator: bypass.operator().to_string(),
                reason: bypass.reason().to_string(),
            });
            st.resync(events);
            Some(bypass)
        })
    }

    pub fn snapshot(&self) -> SafetySnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn state(&self) -> SafetyState {
        self.inner.lock().machine.state()
    }

    pub fn pending_reset(&self) -> Option<Uuid> {
        self.inner.lock().machine.pending_reset()
    }

    /// Receiver that always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SafetySnapshot> {
        self.snapshots.subscribe()
    }

    /// Run `f` under the state lock, publish the new snapshot if anything
    /// happened, then record the collected events in order.
    fn update<R>(&self, f: impl FnOnce(&mut MonitorState, &mut Vec<EventPayload>) -> R) -> R {
        let mut events = Vec::new();
        let (result, _order) = {
            let mut st = self.inner.lock();
            let before = st.snapshot();
            let result = f(&mut st, &mut events);
            if !events.is_empty() || st.snapshot() != before {
                st.sequence += 1;
                self.snapshots.send_replace(st.snapshot());
            }
            (result, self.emit.lock())
        };
        for payload in events {
            if let EventPayload::SafetyStateChanged { from, to, cause } = &payload {
                match cause {
                    TransitionCause::Command { command } => {
                        info!(%from, %to, %command, "safety state changed")
                    }
                    _ => warn!(%from, %to, ?cause, "safety state changed"),
                }
            }
            self.notifier.record(SOURCE, payload);
        }
        result
    }
}

impl std::fmt::Debug for SafetyMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyMonitor")
            .field("snapshot", &*self.snapshots.borrow())
            .finish_non_exhaustive()
    }
}
