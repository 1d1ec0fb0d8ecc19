//! Duration and position arithmetic.
//!
//! A line lasts as long as its slowest enabled action; durations of actions
//! on the same line are never summed. `LaserSet` is instantaneous.

use std::time::Duration;

use crate::model::{LineBasedProtocol, MoveMode, ProtocolAction, ProtocolLine, RampCurve};

/// Steepness of the exponential and logarithmic ramp shapes.
const CURVE_SHAPE: f64 = 3.0;

/// Where the actuator is when a line starts, and how fast it homes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionOrigin {
    pub position_mm: f64,
    pub home_speed_mm_s: f64,
}

impl MotionOrigin {
    pub fn at_home(home_speed_mm_s: f64) -> Self {
        Self {
            position_mm: 0.0,
            home_speed_mm_s,
        }
    }
}

/// Seconds to [`Duration`], mapping negative and non-finite values to zero.
pub fn seconds(s: f64) -> Duration {
    Duration::try_from_secs_f64(s).unwrap_or(Duration::ZERO)
}

fn travel(distance_mm: f64, speed_mm_s: f64) -> Duration {
    if speed_mm_s > 0.0 {
        seconds(distance_mm.abs() / speed_mm_s)
    } else {
        Duration::ZERO
    }
}

impl ProtocolAction {
    /// Absolute position the actuator ends at, if this action moves it.
    pub fn resulting_position(&self, from_mm: f64) -> Option<f64> {
        match self {
            ProtocolAction::Move {
                target,
                mode: MoveMode::Absolute,
                ..
            } => Some(target.mm()),
            ProtocolAction::Move {
                target,
                mode: MoveMode::Relative,
                ..
            } => Some(from_mm + target.mm()),
            ProtocolAction::Home => Some(0.0),
            _ => None,
        }
    }

    /// Expected time to complete when started from `origin`.
    pub fn duration(&self, origin: &MotionOrigin) -> Duration {
        match self {
            ProtocolAction::Move { speed_mm_s, .. } => {
                let end = self.resulting_position(origin.position_mm).unwrap_or(origin.position_mm);
                travel(end - origin.position_mm, *speed_mm_s)
            }
            ProtocolAction::Home => travel(origin.position_mm, origin.home_speed_mm_s),
            ProtocolAction::LaserSet { .. } => Duration::ZERO,
            ProtocolAction::LaserRamp { duration_s, .. } => seconds(*duration_s),
            ProtocolAction::Dwell { duration_s } => seconds(*duration_s),
        }
    }
}

impl RampCurve {
    /// Normalised progress (0..=1) of the ramp value at `fraction` of its time.
    pub fn shape(self, fraction: f64) -> f64 {
        let t = fraction.clamp(0.0, 1.0);
        match self {
            RampCurve::Linear => t,
            RampCurve::Exponential => (CURVE_SHAPE * t).exp_m1() / CURVE_SHAPE.exp_m1(),
            RampCurve::Logarithmic => (CURVE_SHAPE.exp_m1() * t).ln_1p() / CURVE_SHAPE,
        }
    }

    /// Power at `fraction` of a ramp from `start` to `end`.
    pub fn interpolate(self, start: f64, end: f64, fraction: f64) -> f64 {
        start + (end - start) * self.shape(fraction)
    }
}

impl ProtocolLine {
    /// Maximum duration among enabled actions.
    pub fn duration(&self, origin: &MotionOrigin) -> Duration {
        self.enabled_actions()
            .map(|a| a.duration(origin))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Actuator position once every enabled action of the line has finished.
    pub fn end_position(&self, from_mm: f64) -> f64 {
        self.enabled_actions()
            .filter_map(|a| a.resulting_position(from_mm))
            .last()
            .unwrap_or(from_mm)
    }
}

/// Expected duration of one line execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineTiming {
    pub iteration: u32,
    pub line: usize,
    pub start_mm: f64,
    pub duration: Duration,
}

impl LineBasedProtocol {
    /// Net displacement of one full iteration when every enabled actuator
    /// action is relative. `None` when a line homes or moves absolutely, in
    /// which case every iteration after the first starts at the same place.
    pub fn iteration_drift(&self) -> Option<f64> {
        let anchored = self.lines.iter().any(|line| {
            line.enabled_actions().any(|a| {
                matches!(
                    a,
                    ProtocolAction::Home
                        | ProtocolAction::Move {
                            mode: MoveMode::Absolute,
                            ..
                        }
                )
            })
        });
        if anchored {
            None
        } else {
            Some(self.lines.iter().fold(0.0, |pos, line| line.end_position(pos)))
        }
    }

    /// Actuator position at the start of `iteration`, without walking the
    /// iterations before it.
    pub fn iteration_start(&self, iteration: u32, origin_mm: f64) -> f64 {
        if iteration == 0 {
            return origin_mm;
        }
        match self.iteration_drift() {
            Some(drift) => origin_mm + drift * f64::from(iteration),
            None => self.lines.iter().fold(origin_mm, |pos, line| line.end_position(pos)),
        }
    }

    /// Expected timing of each line of one loop iteration. `origin` is where
    /// the run starts; positions carry over between iterations.
    pub fn iteration_timeline(&self, iteration: u32, origin: MotionOrigin) -> Vec<LineTiming> {
        let mut position = self.iteration_start(iteration, origin.position_mm);
        self.lines
            .iter()
            .enumerate()
            .map(|(line_idx, line)| {
                let here = MotionOrigin {
                    position_mm: position,
                    ..origin
                };
                let timing = LineTiming {
                    iteration,
                    line: line_idx,
                    start_mm: position,
                    duration: line.duration(&here),
                };
                position = line.end_position(position);
                timing
            })
            .collect()
    }

    /// Sum of per-line maxima over every loop iteration. Iterations after
    /// the first all take the same time, so only two are laid out.
    /// Saturates at [`Duration::MAX`].
    pub fn estimated_duration(&self, origin: MotionOrigin) -> Duration {
        let sum = |iteration| -> Duration {
            self.iteration_timeline(iteration, origin)
                .iter()
                .map(|t| t.duration)
                .sum()
        };
        let first = sum(0);
        if self.loop_count <= 1 {
            return first;
        }
        sum(1)
            .checked_mul(self.loop_count - 1)
            .and_then(|rest| rest.checked_add(first))
            .unwrap_or(Duration::MAX)
    }
}
