//! [`ProtocolValidator`] – rule engine that checks protocols against their
//! [`SafetyLimits`].
//!
//! Validation runs at three points: when an action is edited
//! ([`crate::editor::ProtocolEditor`]), when a protocol is saved
//! ([`crate::document::save`]), and immediately before execution. Every
//! registered [`Rule`] is evaluated in order and the first violation is
//! returned with the offending limit and value.
//!
//! Built-in rules:
//! - [`FiniteValuesRule`] – rejects NaN and infinite parameters.
//! - [`PowerLimitRule`] – laser set and ramp powers within `[0, max_power_watts]`.
//! - [`SpeedCapRule`] – move speed within `(0, max_speed_mm_s]`.
//! - [`PositionRangeRule`] – resulting actuator position within the travel range.
//! - [`DurationLimitRule`] – dwell and ramp durations within `[0, max_duration_s]`.

use std::sync::Arc;
use std::time::Duration;

use lasercore_types::{ActionKind, LimitKind, ValidationError};
use tracing::debug;

use crate::model::{LineBasedProtocol, MoveMode, ProtocolAction, ProtocolLine, SafetyLimits};
use crate::timing::MotionOrigin;

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// Where an action sits when it is checked.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub limits: &'a SafetyLimits,
    /// Line index, when the action belongs to a line.
    pub line: Option<usize>,
    /// Actuator position before the action. `None` when unknown, in which
    /// case relative moves cannot be range-checked.
    pub position_mm: Option<f64>,
}

/// A single constraint an action must satisfy.
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, action: &ProtocolAction, ctx: &RuleContext<'_>) -> Result<(), ValidationError>;
}

fn exceeded(
    ctx: &RuleContext<'_>,
    action: ActionKind,
    limit: LimitKind,
    value: f64,
    allowed: f64,
) -> ValidationError {
    ValidationError::LimitExceeded {
        line: ctx.line,
        action,
        limit,
        value,
        allowed,
    }
}

fn malformed(ctx: &RuleContext<'_>, action: ActionKind, reason: impl Into<String>) -> ValidationError {
    ValidationError::MalformedAction {
        line: ctx.line,
        action,
        reason: reason.into(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

pub struct FiniteValuesRule;

impl Rule for FiniteValuesRule {
    fn name(&self) -> &str {
        "finite_values"
    }

    fn check(&self, action: &ProtocolAction, ctx: &RuleContext<'_>) -> Result<(), ValidationError> {
        let values: Vec<(&str, f64)> = match action {
            ProtocolAction::Move {
                target, speed_mm_s, ..
            } => vec![("target_mm", target.mm()), ("speed_mm_s", *speed_mm_s)],
            ProtocolAction::Home => Vec::new(),
            ProtocolAction::LaserSet { power_watts } => vec![("power_watts", *power_watts)],
            ProtocolAction::LaserRamp {
                start_watts,
                end_watts,
                duration_s,
                ..
            } => vec![
                ("start_watts", *start_watts),
                ("end_watts", *end_watts),
                ("duration_s", *duration_s),
            ],
            ProtocolAction::Dwell { duration_s } => vec![("duration_s", *duration_s)],
        };
        for (field, value) in values {
            if !value.is_finite() {
                return Err(malformed(ctx, action.kind(), format!("{field} is not a finite number")));
            }
        }
        Ok(())
    }
}

pub struct PowerLimitRule;

impl Rule for PowerLimitRule {
    fn name(&self) -> &str {
        "power_limit"
    }

    fn check(&self, action: &ProtocolAction, ctx: &RuleContext<'_>) -> Result<(), ValidationError> {
        let powers = match action {
            ProtocolAction::LaserSet { power_watts } => vec![*power_watts],
            ProtocolAction::LaserRamp {
                start_watts,
                end_watts,
                ..
            } => vec![*start_watts, *end_watts],
            _ => return Ok(()),
        };
        let max = ctx.limits.max_power_watts;
        for p in powers {
            if p < 0.0 {
                return Err(malformed(ctx, action.kind(), format!("negative power {p} W")));
            }
            if p > max {
                return Err(exceeded(ctx, action.kind(), LimitKind::MaxPowerWatts, p, max));
            }
        }
        Ok(())
    }
}

pub struct SpeedCapRule;

impl Rule for SpeedCapRule {
    fn name(&self) -> &str {
        "speed_cap"
    }

    fn check(&self, action: &ProtocolAction, ctx: &RuleContext<'_>) -> Result<(), ValidationError> {
        if let ProtocolAction::Move { speed_mm_s, .. } = action {
            if *speed_mm_s <= 0.0 {
                return Err(malformed(ctx, ActionKind::Move, "speed_mm_s must be positive"));
            }
            let max = ctx.limits.max_speed_mm_s;
            if *speed_mm_s > max {
                return Err(exceeded(ctx, ActionKind::Move, LimitKind::MaxSpeedMmS, *speed_mm_s, max));
            }
        }
        Ok(())
    }
}

pub struct PositionRangeRule;

impl Rule for PositionRangeRule {
    fn name(&self) -> &str {
        "position_range"
    }

    fn check(&self, action: &ProtocolAction, ctx: &RuleContext<'_>) -> Result<(), ValidationError> {
        let end = match (ctx.position_mm, action) {
            (Some(from), _) => action.resulting_position(from),
            // Without a known origin relative targets cannot be checked.
            (
                None,
                ProtocolAction::Move {
                    mode: MoveMode::Relative,
                    ..
                },
            ) => None,
            (None, _) => action.resulting_position(0.0),
        };
        let Some(end) = end else {
            return Ok(());
        };
        let limits = ctx.limits;
        if end < limits.min_position_mm {
            return Err(exceeded(
                ctx,
                action.kind(),
                LimitKind::MinPositionMm,
                end,
                limits.min_position_mm,
            ));
        }
        if end > limits.max_position_mm {
            return Err(exceeded(
                ctx,
                action.kind(),
                LimitKind::MaxPositionMm,
                end,
                limits.max_position_mm,
            ));
        }
        Ok(())
    }
}

pub struct DurationLimitRule;

impl Rule for DurationLimitRule {
    fn name(&self) -> &str {
        "duration_limit"
    }

    fn check(&self, action: &ProtocolAction, ctx: &RuleContext<'_>) -> Result<(), ValidationError> {
        let duration_s = match action {
            ProtocolAction::Dwell { duration_s } => *duration_s,
            ProtocolAction::LaserRamp { duration_s, .. } => {
                if *duration_s <= 0.0 {
                    return Err(malformed(ctx, ActionKind::LaserRamp, "ramp duration must be positive"));
                }
                *duration_s
            }
            _ => return Ok(()),
        };
        if duration_s < 0.0 {
            return Err(malformed(ctx, action.kind(), "duration must not be negative"));
        }
        let max = ctx.limits.max_duration_s;
        if duration_s > max {
            return Err(exceeded(ctx, action.kind(), LimitKind::MaxDurationS, duration_s, max));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Validated protocol
// ────────────────────────────────────────────────────────────────────────────

/// A protocol that passed validation. Immutable; cheap to clone.
#[derive(Debug, Clone)]
pub struct ValidatedProtocol {
    protocol: Arc<LineBasedProtocol>,
    estimated: Duration,
}

impl ValidatedProtocol {
    pub fn protocol(&self) -> &LineBasedProtocol {
        &self.protocol
    }

    /// Expected treatment time over all loops, from the home position.
    pub fn estimated_duration(&self) -> Duration {
        self.estimated
    }
}

impl std::ops::Deref for ValidatedProtocol {
    type Target = LineBasedProtocol;

    fn deref(&self) -> &Self::Target {
        &self.protocol
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ProtocolValidator
// ────────────────────────────────────────────────────────────────────────────

/// Rule engine validating actions and whole protocols.
///
/// # Example
///
/// ```
/// use lasercore_protocol::{LineBasedProtocol, ProtocolAction, ProtocolLine, ProtocolValidator, SafetyLimits};
///
/// let validator = ProtocolValidator::with_default_rules();
/// let protocol = LineBasedProtocol::new("demo", SafetyLimits::default())
///     .with_line(ProtocolLine::new().with(ProtocolAction::laser_set(9.0)));
///
/// // 9 W is above the default 5 W limit.
/// assert!(validator.validate(&protocol).is_err());
/// ```
pub struct ProtocolValidator {
    rules: Vec<Box<dyn Rule>>,
    home_speed_mm_s: f64,
}

impl Default for ProtocolValidator {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            home_speed_mm_s: 5.0,
        }
    }
}

impl ProtocolValidator {
    /// A validator with no rules. Structural checks still apply.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_rules() -> Self {
        let mut v = Self::new();
        v.add_rule(Box::new(FiniteValuesRule));
        v.add_rule(Box::new(PowerLimitRule));
        v.add_rule(Box::new(SpeedCapRule));
        v.add_rule(Box::new(PositionRangeRule));
        v.add_rule(Box::new(DurationLimitRule));
        v
    }

    /// Homing speed used when estimating treatment time.
    pub fn home_speed(mut self, home_speed_mm_s: f64) -> Self {
        self.home_speed_mm_s = home_speed_mm_s;
        self
    }

    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Check a single action in context.
    pub fn check_action(
        &self,
        action: &ProtocolAction,
        ctx: &RuleContext<'_>,
    ) -> Result<(), ValidationError> {
        for rule in &self.rules {
            rule.check(action, ctx)?;
        }
        Ok(())
    }

    /// Limits must describe a usable envelope.
    pub fn check_limits(&self, limits: &SafetyLimits) -> Result<(), ValidationError> {
        let named = [
            ("max_power_watts", limits.max_power_watts),
            ("max_duration_s", limits.max_duration_s),
            ("min_position_mm", limits.min_position_mm),
            ("max_position_mm", limits.max_position_mm),
            ("max_speed_mm_s", limits.max_speed_mm_s),
        ];
        if let Some((name, _)) = named.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ValidationError::InvalidLimits(format!("{name} is not finite")));
        }
        if limits.max_power_watts < 0.0 {
            return Err(ValidationError::InvalidLimits("max_power_watts is negative".into()));
        }
        if limits.max_duration_s <= 0.0 || limits.max_speed_mm_s <= 0.0 {
            return Err(ValidationError::InvalidLimits(
                "max_duration_s and max_speed_mm_s must be positive".into(),
            ));
        }
        if limits.min_position_mm > limits.max_position_mm {
            return Err(ValidationError::InvalidLimits(format!(
                "min_position_mm {} is above max_position_mm {}",
                limits.min_position_mm, limits.max_position_mm
            )));
        }
        Ok(())
    }

    /// Validate every line, every action, the loop count and the total time.
    pub fn validate(&self, protocol: &LineBasedProtocol) -> Result<(), ValidationError> {
        self.check_limits(&protocol.safety_limits)?;
        if protocol.loop_count < 1 {
            return Err(ValidationError::InvalidLoopCount(protocol.loop_count));
        }
        if protocol.lines.is_empty() {
            return Err(ValidationError::Empty);
        }

        for (idx, line) in protocol.lines.iter().enumerate() {
            self.check_line_structure(idx, line)?;
        }
        // Positions carry over between iterations. Every iteration after the
        // first starts at the same place unless all motion is relative, and
        // then each end position moves linearly with the iteration, so its
        // extremes lie in the second and the last iteration.
        let mut iterations = vec![0];
        if protocol.loop_count > 1 {
            iterations.push(1);
        }
        if protocol.loop_count > 2 && protocol.iteration_drift().is_some() {
            iterations.push(protocol.loop_count - 1);
        }
        for iteration in iterations {
            self.check_iteration(protocol, protocol.iteration_start(iteration, 0.0))?;
        }

        let estimated = protocol.estimated_duration(MotionOrigin::at_home(self.home_speed_mm_s));
        let allowed_s = protocol.safety_limits.max_duration_s;
        if estimated.as_secs_f64() > allowed_s {
            return Err(ValidationError::TotalDurationExceeded {
                estimated_s: estimated.as_secs_f64(),
                allowed_s,
            });
        }
        debug!(
            protocol = protocol.name(),
            lines = protocol.lines.len(),
            estimated_s = estimated.as_secs_f64(),
            "protocol validated"
        );
        Ok(())
    }

    fn check_iteration(
        &self,
        protocol: &LineBasedProtocol,
        start_mm: f64,
    ) -> Result<(), ValidationError> {
        let mut position = start_mm;
        for (idx, line) in protocol.lines.iter().enumerate() {
            for slot in line.actions() {
                let ctx = RuleContext {
                    limits: &protocol.safety_limits,
                    line: Some(idx),
                    position_mm: Some(position),
                };
                self.check_action(&slot.action, &ctx)?;
            }
            position = line.end_position(position);
        }
        Ok(())
    }

    /// Validate and freeze `protocol` for execution.
    pub fn approve(&self, protocol: LineBasedProtocol) -> Result<ValidatedProtocol, ValidationError> {
        self.validate(&protocol)?;
        let estimated = protocol.estimated_duration(MotionOrigin::at_home(self.home_speed_mm_s));
        Ok(ValidatedProtocol {
            protocol: Arc::new(protocol),
            estimated,
        })
    }

    /// Duplicate kinds and conflicting actuator commands on one line.
    pub fn check_line_structure(
        &self,
        idx: usize,
        line: &ProtocolLine,
    ) -> Result<(), ValidationError> {
        let mut seen = Vec::with_capacity(line.actions().len());
        for slot in line.actions() {
            let kind = slot.action.kind();
            if seen.contains(&kind) {
                return Err(ValidationError::DuplicateAction { line: idx, action: kind });
            }
            seen.push(kind);
        }
        let drives = |k| line.get(k).is_some_and(|a| a.enabled);
        if drives(ActionKind::Move) && drives(ActionKind::Home) {
            return Err(ValidationError::MalformedAction {
                line: Some(idx),
                action: ActionKind::Home,
                reason: "move and home cannot drive the actuator on the same line".into(),
            });
        }
        if drives(ActionKind::LaserSet) && drives(ActionKind::LaserRamp) {
            return Err(ValidationError::MalformedAction {
                line: Some(idx),
                action: ActionKind::LaserRamp,
                reason: "laser_set and laser_ramp cannot command power on the same line".into(),
            });
        }
        Ok(())
    }
}
