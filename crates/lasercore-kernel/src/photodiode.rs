//! [`PowerDeviationCheck`] – measured optical power against commanded power.
//!
//! Readings and commands below the noise floor
//! (`photodiode_noise_watts × calibration_margin`) count as "off". Above it a
//! reading must lie within `power_deviation_tolerance` of the command. A
//! single outlier is not enough: the violation is raised after
//! [`CONSECUTIVE_SAMPLES`] bad readings in a row, which keeps the check quiet
//! while the laser settles after a power step. Steps that stay inside the
//! tolerance band (ramp increments) do not restart the count.

use lasercore_types::{InterlockThresholds, SafetyViolation};

pub const CONSECUTIVE_SAMPLES: u32 = 3;

#[derive(Debug, Clone)]
pub struct PowerDeviationCheck {
    tolerance: f64,
    floor: f64,
    expected: f64,
    bad: u32,
}

impl PowerDeviationCheck {
    pub fn new(thresholds: &InterlockThresholds) -> Self {
        Self {
            tolerance: thresholds.power_deviation_tolerance,
            floor: thresholds.noise_floor_watts(),
            expected: 0.0,
            bad: 0,
        }
    }

    pub fn expected(&self) -> f64 {
        self.expected
    }

    /// Power the laser should be emitting now. Only a step outside the
    /// tolerance band restarts the count.
    pub fn expect(&mut self, watts: f64) {
        if !self.within(self.expected, watts) {
            self.bad = 0;
        }
        self.expected = watts;
    }

    /// `true` when `measured` is acceptable for `commanded`.
    pub fn within(&self, commanded: f64, measured: f64) -> bool {
        if (measured - commanded).abs() <= self.floor {
            return true;
        }
        commanded > self.floor && (measured - commanded).abs() / commanded <= self.tolerance
    }

    pub fn sample(&mut self, measured: f64) -> Result<(), SafetyViolation> {
        if self.within(self.expected, measured) {
            self.bad = 0;
            return Ok(());
        }
        self.bad = self.bad.saturating_add(1);
        if self.bad < CONSECUTIVE_SAMPLES {
            return Ok(());
        }
        Err(SafetyViolation::PowerDeviation {
            commanded_watts: self.expected,
            measured_watts: measured,
            tolerance_pct: self.tolerance * 100.0,
        })
    }
}
