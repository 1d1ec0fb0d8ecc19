//! Protocol data model.
//!
//! A [`LineBasedProtocol`] is an ordered list of [`ProtocolLine`]s, repeated
//! `loop_count` times. Each line carries at most one action of every
//! [`ActionKind`]; all enabled actions of a line run concurrently.

use lasercore_types::ActionKind;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Scalars
// ────────────────────────────────────────────────────────────────────────────

/// Actuator position in millimetres from the home position.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Position(pub f64);

impl Position {
    pub fn mm(self) -> f64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MoveMode {
    Absolute,
    Relative,
}

/// Shape of a power ramp between its start and end values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RampCurve {
    Linear,
    Exponential,
    Logarithmic,
}

// ────────────────────────────────────────────────────────────────────────────
// Actions
// ────────────────────────────────────────────────────────────────────────────

/// One hardware action within a line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtocolAction {
    Move {
        #[serde(rename = "target_mm")]
        target: Position,
        speed_mm_s: f64,
        mode: MoveMode,
    },
    Home,
    LaserSet {
        power_watts: f64,
    },
    LaserRamp {
        start_watts: f64,
        end_watts: f64,
        duration_s: f64,
        curve: RampCurve,
    },
    Dwell {
        duration_s: f64,
    },
}

impl ProtocolAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            ProtocolAction::Move { .. } => ActionKind::Move,
            ProtocolAction::Home => ActionKind::Home,
            ProtocolAction::LaserSet { .. } => ActionKind::LaserSet,
            ProtocolAction::LaserRamp { .. } => ActionKind::LaserRamp,
            ProtocolAction::Dwell { .. } => ActionKind::Dwell,
        }
    }

    pub fn move_absolute(target_mm: f64, speed_mm_s: f64) -> Self {
        ProtocolAction::Move {
            target: Position(target_mm),
            speed_mm_s,
            mode: MoveMode::Absolute,
        }
    }

    pub fn move_relative(delta_mm: f64, speed_mm_s: f64) -> Self {
        ProtocolAction::Move {
            target: Position(delta_mm),
            speed_mm_s,
            mode: MoveMode::Relative,
        }
    }

    pub fn laser_set(power_watts: f64) -> Self {
        ProtocolAction::LaserSet { power_watts }
    }

    pub fn ramp(start_watts: f64, end_watts: f64, duration_s: f64, curve: RampCurve) -> Self {
        ProtocolAction::LaserRamp {
            start_watts,
            end_watts,
            duration_s,
            curve,
        }
    }

    pub fn dwell(duration_s: f64) -> Self {
        ProtocolAction::Dwell { duration_s }
    }
}

/// An action slot on a line. Disabled actions are kept but never dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LineAction {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub action: ProtocolAction,
}

fn enabled_by_default() -> bool {
    true
}

// ────────────────────────────────────────────────────────────────────────────
// Lines
// ────────────────────────────────────────────────────────────────────────────

/// A step of the protocol. Holds no more than one action per kind.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct ProtocolLine {
    #[serde(default)]
    pub(crate) actions: Vec<LineAction>,
}

impl ProtocolLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`ProtocolLine::set`].
    pub fn with(mut self, action: ProtocolAction) -> Self {
        self.set(action);
        self
    }

    /// Attach `action` enabled, replacing any existing action of the same kind.
    pub fn set(&mut self, action: ProtocolAction) {
        let kind = action.kind();
        match self.actions.iter_mut().find(|a| a.action.kind() == kind) {
            Some(slot) => slot.action = action,
            None => self.actions.push(LineAction {
                enabled: true,
                action,
            }),
        }
    }

    pub fn remove(&mut self, kind: ActionKind) -> Option<ProtocolAction> {
        let idx = self.actions.iter().position(|a| a.action.kind() == kind)?;
        Some(self.actions.remove(idx).action)
    }

    /// Returns `false` when the line has no action of that kind.
    pub fn set_enabled(&mut self, kind: ActionKind, enabled: bool) -> bool {
        match self.actions.iter_mut().find(|a| a.action.kind() == kind) {
            Some(slot) => {
                slot.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, kind: ActionKind) -> Option<&LineAction> {
        self.actions.iter().find(|a| a.action.kind() == kind)
    }

    pub fn actions(&self) -> &[LineAction] {
        &self.actions
    }

    pub fn enabled_actions(&self) -> impl Iterator<Item = &ProtocolAction> {
        self.actions
            .iter()
            .filter(|a| a.enabled)
            .map(|a| &a.action)
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Protocol
// ────────────────────────────────────────────────────────────────────────────

/// Hard bounds every action of a protocol is checked against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SafetyLimits {
    pub max_power_watts: f64,
    /// Bound on any single timed action and on the whole treatment.
    pub max_duration_s: f64,
    pub min_position_mm: f64,
    pub max_position_mm: f64,
    pub max_speed_mm_s: f64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_power_watts: 5.0,
            max_duration_s: 600.0,
            min_position_mm: 0.0,
            max_position_mm: 50.0,
            max_speed_mm_s: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct ProtocolMetadata {
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
}

/// An operator-authored treatment sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LineBasedProtocol {
    pub metadata: ProtocolMetadata,
    #[serde(default = "one_loop")]
    pub loop_count: u32,
    pub safety_limits: SafetyLimits,
    #[serde(default)]
    pub lines: Vec<ProtocolLine>,
}

fn one_loop() -> u32 {
    1
}

impl LineBasedProtocol {
    pub fn new(name: impl Into<String>, safety_limits: SafetyLimits) -> Self {
        Self {
            metadata: ProtocolMetadata {
                name: name.into(),
                ..ProtocolMetadata::default()
            },
            loop_count: 1,
            safety_limits,
            lines: Vec::new(),
        }
    }

    pub fn with_line(mut self, line: ProtocolLine) -> Self {
        self.lines.push(line);
        self
    }

    pub fn with_loops(mut self, loop_count: u32) -> Self {
        self.loop_count = loop_count;
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_same_kind() {
        let mut line = ProtocolLine::new()
            .with(ProtocolAction::laser_set(1.0))
            .with(ProtocolAction::dwell(2.0));
        line.set(ProtocolAction::laser_set(3.0));
        assert_eq!(line.actions().len(), 2);
        assert_eq!(
            line.get(ActionKind::LaserSet).map(|a| &a.action),
            Some(&ProtocolAction::laser_set(3.0))
        );
    }

    #[test]
    fn disabled_actions_are_not_enabled() {
        let mut line = ProtocolLine::new()
            .with(ProtocolAction::dwell(2.0))
            .with(ProtocolAction::Home);
        assert!(line.set_enabled(ActionKind::Home, false));
        assert!(!line.set_enabled(ActionKind::Move, false));
        let kinds: Vec<_> = line.enabled_actions().map(|a| a.kind()).collect();
        assert_eq!(kinds, vec![ActionKind::Dwell]);
    }

    #[test]
    fn remove_returns_action() {
        let mut line = ProtocolLine::new().with(ProtocolAction::Home);
        assert_eq!(line.remove(ActionKind::Home), Some(ProtocolAction::Home));
        assert!(line.is_empty());
        assert_eq!(line.remove(ActionKind::Home), None);
    }

    #[test]
    fn action_json_uses_stable_names() {
        let json = serde_json::to_string(&ProtocolAction::move_absolute(5.0, 2.0)).unwrap();
        assert!(json.contains("\"kind\":\"move\""));
        assert!(json.contains("\"target_mm\":5.0"));
        assert!(json.contains("\"mode\":\"absolute\""));
    }
}
