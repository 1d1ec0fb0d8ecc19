//! [`SafetyStateMachine`] – the pure transition function.
//!
//! The machine holds the current [`SafetyState`], the interlock values it was
//! fed, and a pending emergency-reset token. It performs no I/O and never
//! reads a clock, so the same input sequence always yields the same state
//! sequence.
//!
//! | From | To | Trigger |
//! |---|---|---|
//! | Safe | Armed | session valid and every interlock satisfied |
//! | Armed | Treating | `BeginTreatment` with laser permission |
//! | Treating | Armed | `EndTreatment` |
//! | Armed, Treating | Unsafe | any interlock becomes false |
//! | Unsafe | Armed | `Reset` with every interlock satisfied |
//! | any | EmergencyStop | `EmergencyStop` |
//! | EmergencyStop | Safe | `ConfirmEmergencyReset` quoting the requested token, every interlock satisfied except footpedal and session |
//!
//! Every other command is rejected with a [`SafetyError`]; the state is left
//! untouched.

use lasercore_types::{
    InterlockField, InterlockStatus, OperatorCommand, SafetyError, SafetyOverride, SafetyState,
    SafetyViolation, TransitionCause,
};
use uuid::Uuid;

/// Interlocks that may be false while confirming an emergency reset: the
/// pedal is released and the session closed during recovery.
pub const RESET_EXEMPT: [InterlockField; 2] =
    [InterlockField::FootpedalPressed, InterlockField::SessionValid];

#[derive(Debug, Clone, PartialEq)]
pub enum SafetyInput {
    Signal(InterlockField, bool),
    Violation(SafetyViolation),
    Command(OperatorCommand),
}

impl std::fmt::Display for SafetyInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafetyInput::Signal(field, value) => write!(f, "{field}={value}"),
            SafetyInput::Violation(v) => write!(f, "violation: {v}"),
            SafetyInput::Command(c) => write!(f, "{c}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: SafetyState,
    pub to: SafetyState,
    pub cause: TransitionCause,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SafetyStateMachine {
    state: SafetyState,
    interlocks: InterlockStatus,
    pending_reset: Option<Uuid>,
}

impl Default for SafetyStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyStateMachine {
    /// `Safe`, every interlock false.
    pub fn new() -> Self {
        Self {
            state: SafetyState::Safe,
            interlocks: InterlockStatus::default(),
            pending_reset: None,
        }
    }

    pub fn state(&self) -> SafetyState {
        self.state
    }

    pub fn interlocks(&self) -> InterlockStatus {
        self.interlocks
    }

    pub fn pending_reset(&self) -> Option<Uuid> {
        self.pending_reset
    }

    pub fn laser_permitted(&self, bypass: Option<&SafetyOverride>) -> bool {
        self.interlocks.laser_permitted(self.state, bypass)
    }

    /// Feed one input. `Ok(None)` means accepted without a state change.
    pub fn apply(&mut self, input: SafetyInput) -> Result<Option<Transition>, SafetyError> {
        match input {
            SafetyInput::Signal(field, value) => {
                Ok(self.on_signal(field, value, TransitionCause::Interlock { field, value }))
            }
            SafetyInput::Violation(violation) => {
                let field = violation.field();
                Ok(self.on_signal(field, false, TransitionCause::Violation { violation }))
            }
            SafetyInput::Command(command) => self.on_command(command),
        }
    }

    fn on_signal(&mut self, field: InterlockField, value: bool, cause: TransitionCause) -> Option<Transition> {
        self.interlocks.set(field, value);
        match (self.state, value) {
            (SafetyState::Armed | SafetyState::Treating, false) => {
                Some(self.go(SafetyState::Unsafe, cause))
            }
            (SafetyState::Safe, true) if self.interlocks.all() => {
                Some(self.go(SafetyState::Armed, cause))
            }
            _ => None,
        }
    }

    fn on_command(&mut self, command: OperatorCommand) -> Result<Option<Transition>, SafetyError> {
        let cause = TransitionCause::Command { command };
        match (self.state, command) {
            (SafetyState::EmergencyStop, OperatorCommand::EmergencyStop) => Ok(None),
            (_, OperatorCommand::EmergencyStop) => {
                self.pending_reset = None;
                Ok(Some(self.go(SafetyState::EmergencyStop, cause)))
            }

            (SafetyState::EmergencyStop, OperatorCommand::StartSession) => Err(self.illegal(command)),
            (_, OperatorCommand::StartSession) => {
                self.interlocks.session_valid = true;
                if self.state == SafetyState::Safe && self.interlocks.all() {
                    Ok(Some(self.go(SafetyState::Armed, cause)))
                } else {
                    Ok(None)
                }
            }
            (_, OperatorCommand::EndSession) => {
                self.interlocks.session_valid = false;
                if self.state.permits_treatment() {
                    Ok(Some(self.go(SafetyState::Unsafe, cause)))
                } else {
                    Ok(None)
                }
            }

            (SafetyState::Armed, OperatorCommand::BeginTreatment) => {
                self.require(self.interlocks.all())?;
                Ok(Some(self.go(SafetyState::Treating, cause)))
            }
            (SafetyState::Treating, OperatorCommand::EndTreatment) => {
                Ok(Some(self.go(SafetyState::Armed, cause)))
            }
            (SafetyState::Unsafe, OperatorCommand::Reset) => {
                self.require(self.interlocks.all())?;
                Ok(Some(self.go(SafetyState::Armed, cause)))
            }

            (SafetyState::EmergencyStop, OperatorCommand::RequestEmergencyReset) => {
                self.pending_reset = Some(Uuid::new_v4());
                Ok(None)
            }
            (SafetyState::EmergencyStop, OperatorCommand::ConfirmEmergencyReset { token }) => {
                match self.pending_reset.take() {
                    None => Err(SafetyError::ResetNotRequested),
                    Some(expected) if expected != token => Err(SafetyError::ResetTokenMismatch),
                    Some(expected) => {
                        if !self.interlocks.all_except(&RESET_EXEMPT) {
                            self.pending_reset = Some(expected);
                            return Err(SafetyError::InterlocksNotSatisfied {
                                missing: self
                                    .interlocks
                                    .missing()
                                    .into_iter()
                                    .filter(|f| !RESET_EXEMPT.contains(f))
                                    .collect(),
                            });
                        }
                        Ok(Some(self.go(SafetyState::Safe, cause)))
                    }
                }
            }

            _ => Err(self.illegal(command)),
        }
    }

    fn require(&self, satisfied: bool) -> Result<(), SafetyError> {
        if satisfied {
            Ok(())
        } else {
            Err(SafetyError::InterlocksNotSatisfied {
                missing: self.interlocks.missing(),
            })
        }
    }

    fn illegal(&self, command: OperatorCommand) -> SafetyError {
        SafetyError::IllegalTransition {
            state: self.state,
            command: command.to_string(),
        }
    }

    fn go(&mut self, to: SafetyState, cause: TransitionCause) -> Transition {
        let from = std::mem::replace(&mut self.state, to);
        Transition { from, to, cause }
    }
}
