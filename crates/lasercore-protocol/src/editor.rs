//! [`ProtocolEditor`] – mutation API that validates each edit as it is made.
//!
//! Edits are checked against the protocol's [`SafetyLimits`] before they are
//! applied; a rejected edit leaves the protocol unchanged. The check covers
//! the edited action in its position on the first loop iteration. Effects on
//! later lines (a relative move shifting every subsequent position) are
//! caught by the full validation that runs on save and before execution.

use lasercore_types::{ActionKind, ValidationError};
use tracing::debug;

use crate::model::{LineBasedProtocol, ProtocolAction, ProtocolLine, ProtocolMetadata, SafetyLimits};
use crate::validation::{ProtocolValidator, RuleContext};

pub struct ProtocolEditor {
    protocol: LineBasedProtocol,
    validator: ProtocolValidator,
}

impl ProtocolEditor {
    pub fn new(protocol: LineBasedProtocol) -> Self {
        Self::with_validator(protocol, ProtocolValidator::with_default_rules())
    }

    pub fn with_validator(protocol: LineBasedProtocol, validator: ProtocolValidator) -> Self {
        Self {
            protocol,
            validator,
        }
    }

    pub fn protocol(&self) -> &LineBasedProtocol {
        &self.protocol
    }

    pub fn into_protocol(self) -> LineBasedProtocol {
        self.protocol
    }

    pub fn set_metadata(&mut self, metadata: ProtocolMetadata) {
        self.protocol.metadata = metadata;
    }

    /// Append an empty line and return its index.
    pub fn add_line(&mut self) -> usize {
        self.protocol.lines.push(ProtocolLine::new());
        self.protocol.lines.len() - 1
    }

    pub fn insert_line(&mut self, at: usize) -> Result<(), ValidationError> {
        if at > self.protocol.lines.len() {
            return Err(ValidationError::NoSuchLine(at));
        }
        self.protocol.lines.insert(at, ProtocolLine::new());
        Ok(())
    }

    pub fn remove_line(&mut self, idx: usize) -> Result<ProtocolLine, ValidationError> {
        if idx >= self.protocol.lines.len() {
            return Err(ValidationError::NoSuchLine(idx));
        }
        Ok(self.protocol.lines.remove(idx))
    }

    /// Attach or replace an action, validating it first.
    pub fn set_action(&mut self, line: usize, action: ProtocolAction) -> Result<(), ValidationError> {
        let mut candidate = self.line(line)?.clone();
        candidate.set(action.clone());
        self.check(line, &candidate, &action)?;
        debug!(line, action = %action.kind(), "action edited");
        self.protocol.lines[line] = candidate;
        Ok(())
    }

    /// Enabling re-validates the action; disabling always succeeds.
    pub fn set_enabled(
        &mut self,
        line: usize,
        kind: ActionKind,
        enabled: bool,
    ) -> Result<(), ValidationError> {
        let mut candidate = self.line(line)?.clone();
        if !candidate.set_enabled(kind, enabled) {
            return Err(ValidationError::MalformedAction {
                line: Some(line),
                action: kind,
                reason: "line has no such action".into(),
            });
        }
        if enabled {
            if let Some(slot) = candidate.get(kind) {
                let action = slot.action.clone();
                self.check(line, &candidate, &action)?;
            }
        }
        self.protocol.lines[line] = candidate;
        Ok(())
    }

    pub fn remove_action(
        &mut self,
        line: usize,
        kind: ActionKind,
    ) -> Result<Option<ProtocolAction>, ValidationError> {
        self.line(line)?;
        Ok(self.protocol.lines[line].remove(kind))
    }

    pub fn set_loop_count(&mut self, loop_count: u32) -> Result<(), ValidationError> {
        if loop_count < 1 {
            return Err(ValidationError::InvalidLoopCount(loop_count));
        }
        self.protocol.loop_count = loop_count;
        Ok(())
    }

    /// Replace the limits. Rejected when any existing action would violate them.
    pub fn set_limits(&mut self, limits: SafetyLimits) -> Result<(), ValidationError> {
        self.validator.check_limits(&limits)?;
        let mut position = 0.0;
        for (idx, line) in self.protocol.lines.iter().enumerate() {
            for slot in line.actions() {
                let ctx = RuleContext {
                    limits: &limits,
                    line: Some(idx),
                    position_mm: Some(position),
                };
                self.validator.check_action(&slot.action, &ctx)?;
            }
            position = line.end_position(position);
        }
        self.protocol.safety_limits = limits;
        Ok(())
    }

    /// Full validation of the current state.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validator.validate(&self.protocol)
    }

    fn line(&self, idx: usize) -> Result<&ProtocolLine, ValidationError> {
        self.protocol
            .lines
            .get(idx)
            .ok_or(ValidationError::NoSuchLine(idx))
    }

    fn check(
        &self,
        idx: usize,
        candidate: &ProtocolLine,
        action: &ProtocolAction,
    ) -> Result<(), ValidationError> {
        let position = self.protocol.lines[..idx]
            .iter()
            .fold(0.0, |pos, l| l.end_position(pos));
        let ctx = RuleContext {
            limits: &self.protocol.safety_limits,
            line: Some(idx),
            position_mm: Some(position),
        };
        self.validator.check_action(action, &ctx)?;
        self.validator.check_line_structure(idx, candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lasercore_types::LimitKind;

    fn editor() -> ProtocolEditor {
        let mut e = ProtocolEditor::new(LineBasedProtocol::new("edit", SafetyLimits::default()));
        e.add_line();
        e
    }

    #[test]
    fn valid_edit_is_applied() {
        let mut e = editor();
        e.set_action(0, ProtocolAction::laser_set(2.0)).unwrap();
        assert!(e.protocol().lines[0].get(ActionKind::LaserSet).is_some());
    }

    #[test]
    fn over_limit_edit_is_rejected_and_not_applied() {
        let mut e = editor();
        e.set_action(0, ProtocolAction::laser_set(2.0)).unwrap();
        let err = e.set_action(0, ProtocolAction::laser_set(50.0)).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::LimitExceeded {
                limit: LimitKind::MaxPowerWatts,
                ..
            }
        ));
        assert_eq!(
            e.protocol().lines[0].get(ActionKind::LaserSet).map(|a| &a.action),
            Some(&ProtocolAction::laser_set(2.0))
        );
    }

    #[test]
    fn relative_move_is_checked_from_preceding_lines() {
        let mut e = editor();
        e.set_action(0, ProtocolAction::move_absolute(45.0, 5.0)).unwrap();
        let second = e.add_line();
        assert!(e.set_action(second, ProtocolAction::move_relative(10.0, 5.0)).is_err());
        assert!(e.set_action(second, ProtocolAction::move_relative(-10.0, 5.0)).is_ok());
    }

    #[test]
    fn enabling_conflicting_action_is_rejected() {
        let mut e = editor();
        e.set_action(0, ProtocolAction::move_absolute(5.0, 5.0)).unwrap();
        e.set_enabled(0, ActionKind::Move, false).unwrap();
        e.set_action(0, ProtocolAction::Home).unwrap();
        assert!(e.set_enabled(0, ActionKind::Move, true).is_err());
    }

    #[test]
    fn missing_line_is_reported() {
        let mut e = editor();
        assert_eq!(
            e.set_action(3, ProtocolAction::Home),
            Err(ValidationError::NoSuchLine(3))
        );
        assert!(e.remove_line(3).is_err());
    }

    #[test]
    fn tightening_limits_below_existing_action_fails() {
        let mut e = editor();
        e.set_action(0, ProtocolAction::laser_set(4.0)).unwrap();
        let tighter = SafetyLimits {
            max_power_watts: 3.0,
            ..SafetyLimits::default()
        };
        assert!(e.set_limits(tighter).is_err());
        assert!((e.protocol().safety_limits.max_power_watts - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn loop_count_must_be_positive() {
        let mut e = editor();
        assert!(e.set_loop_count(0).is_err());
        e.set_loop_count(3).unwrap();
        assert_eq!(e.protocol().loop_count, 3);
    }
}
