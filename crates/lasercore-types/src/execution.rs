//! Execution vocabulary: action kinds, engine states, the per-run
//! [`ExecutionContext`] and the events the engine emits.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::safety::SafetyState;

/// Discriminant of a protocol action. A line holds at most one of each.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Move,
    Home,
    LaserSet,
    LaserRamp,
    Dwell,
}

impl ActionKind {
    pub const ALL: [ActionKind; 5] = [
        ActionKind::Move,
        ActionKind::Home,
        ActionKind::LaserSet,
        ActionKind::LaserRamp,
        ActionKind::Dwell,
    ];

    /// Critical actions abort the run when their retries are exhausted.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            ActionKind::Move | ActionKind::LaserSet | ActionKind::LaserRamp
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Move => "move",
            ActionKind::Home => "home",
            ActionKind::LaserSet => "laser_set",
            ActionKind::LaserRamp => "laser_ramp",
            ActionKind::Dwell => "dwell",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Running,
    Paused,
    Completed,
    Aborted,
    Faulted,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Aborted | ExecutionState::Faulted
        )
    }
}

/// Why a run was aborted rather than completed or faulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    OperatorStop,
    PermissionLost { state: SafetyState },
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted { reason: AbortReason },
    Faulted { error: String },
}

impl RunOutcome {
    pub fn state(&self) -> ExecutionState {
        match self {
            RunOutcome::Completed => ExecutionState::Completed,
            RunOutcome::Aborted { .. } => ExecutionState::Aborted,
            RunOutcome::Faulted { .. } => ExecutionState::Faulted,
        }
    }
}

/// Engine-owned progress record. Readers only ever see copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub state: ExecutionState,
    /// Zero-based loop iteration.
    pub loop_iteration: u32,
    pub loop_count: u32,
    /// Zero-based index of the current line.
    pub line_index: usize,
    pub line_count: usize,
    /// Retries spent per action kind on the current line.
    pub retry_counters: BTreeMap<ActionKind, u32>,
    pub elapsed: Duration,
    /// Permission as observed immediately before the current line started.
    pub permission_snapshot: bool,
}

impl ExecutionContext {
    pub fn new(run_id: Uuid, line_count: usize, loop_count: u32) -> Self {
        Self {
            run_id,
            state: ExecutionState::Idle,
            loop_iteration: 0,
            loop_count,
            line_index: 0,
            line_count,
            retry_counters: BTreeMap::new(),
            elapsed: Duration::ZERO,
            permission_snapshot: false,
        }
    }

    pub fn total_retries(&self) -> u32 {
        self.retry_counters.values().sum()
    }
}

/// Events the engine publishes while a run is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    RunStarted {
        run_id: Uuid,
        protocol: String,
        line_count: usize,
        loop_count: u32,
        estimated_s: f64,
    },
    LineStarted {
        run_id: Uuid,
        iteration: u32,
        line: usize,
        expected_s: f64,
    },
    LineCompleted {
        run_id: Uuid,
        iteration: u32,
        line: usize,
        elapsed_s: f64,
    },
    LineFailed {
        run_id: Uuid,
        iteration: u32,
        line: usize,
        error: String,
    },
    /// A non-critical action failed and the run was configured to continue.
    ActionFailed {
        run_id: Uuid,
        iteration: u32,
        line: usize,
        action: ActionKind,
        error: String,
    },
    StateChanged {
        run_id: Uuid,
        state: ExecutionState,
    },
    Progress(ExecutionContext),
    RunFinished {
        run_id: Uuid,
        outcome: RunOutcome,
        elapsed_s: f64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criticality_matches_action_kind() {
        assert!(ActionKind::LaserSet.is_critical());
        assert!(ActionKind::LaserRamp.is_critical());
        assert!(ActionKind::Move.is_critical());
        assert!(!ActionKind::Home.is_critical());
        assert!(!ActionKind::Dwell.is_critical());
    }

    #[test]
    fn outcome_maps_to_terminal_state() {
        assert_eq!(RunOutcome::Completed.state(), ExecutionState::Completed);
        let aborted = RunOutcome::Aborted {
            reason: AbortReason::OperatorStop,
        };
        assert!(aborted.state().is_terminal());
        assert!(!ExecutionState::Paused.is_terminal());
    }

    #[test]
    fn context_sums_retries() {
        let mut ctx = ExecutionContext::new(Uuid::new_v4(), 3, 1);
        ctx.retry_counters.insert(ActionKind::Move, 2);
        ctx.retry_counters.insert(ActionKind::LaserSet, 1);
        assert_eq!(ctx.total_retries(), 3);
    }
}
