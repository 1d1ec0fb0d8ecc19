//! [`TreatmentGate`] – single interception point between a protocol and the
//! hardware.
//!
//! Before a run starts, [`TreatmentGate::admit`] runs two independent checks
//! in order:
//!
//! 1. **Validation** ([`ProtocolValidator`]): every action against the
//!    protocol's safety limits. The first violated limit is returned with its
//!    value.
//! 2. **Safety state** ([`SafetyMonitor`]): the device must be `Armed` with
//!    laser permission.
//!
//! During the run the engine calls [`TreatmentGate::check_line`] immediately
//! before each line, so a transition that removed permission is seen before
//! the next line can start.

use std::sync::Arc;

use lasercore_protocol::{LineBasedProtocol, ProtocolValidator, ValidatedProtocol};
use lasercore_types::{ExecutionError, OperatorCommand, SafetySnapshot, SafetyState};
use tracing::{debug, info};

use crate::monitor::SafetyMonitor;

pub struct TreatmentGate {
    validator: ProtocolValidator,
    monitor: Arc<SafetyMonitor>,
}

impl TreatmentGate {
    pub fn new(validator: ProtocolValidator, monitor: Arc<SafetyMonitor>) -> Self {
        Self { validator, monitor }
    }

    pub fn monitor(&self) -> &Arc<SafetyMonitor> {
        &self.monitor
    }

    pub fn validator(&self) -> &ProtocolValidator {
        &self.validator
    }

    /// Validate `protocol` and confirm the device is ready to treat.
    pub fn admit(&self, protocol: LineBasedProtocol) -> Result<ValidatedProtocol, ExecutionError> {
        let validated = self.validator.approve(protocol)?;
        let snapshot = self.monitor.snapshot();
        if snapshot.state != SafetyState::Armed || !snapshot.laser_permitted {
            return Err(ExecutionError::NotPermitted {
                state: snapshot.state,
            });
        }
        info!(
            protocol = validated.name(),
            estimated_s = validated.estimated_duration().as_secs_f64(),
            "protocol admitted"
        );
        Ok(validated)
    }

    /// `Armed → Treating`.
    pub fn begin(&self) -> Result<SafetySnapshot, ExecutionError> {
        self.monitor.command(OperatorCommand::BeginTreatment)?;
        Ok(self.monitor.snapshot())
    }

    /// The pre-line permission check.
    pub fn check_line(&self) -> Result<(), ExecutionError> {
        let snapshot = self.monitor.snapshot();
        if snapshot.treatment_permitted() {
            Ok(())
        } else {
            Err(ExecutionError::NotPermitted {
                state: snapshot.state,
            })
        }
    }

    /// `Treating → Armed` after a run. A no-op in any other state.
    ///
    /// The state can still move between the check and the command; the
    /// monitor's rejection is then returned.
    pub fn end(&self) -> Result<(), ExecutionError> {
        let state = self.monitor.state();
        if state != SafetyState::Treating {
            debug!(%state, "run ended outside Treating");
            return Ok(());
        }
        self.monitor.command(OperatorCommand::EndTreatment)?;
        Ok(())
    }
}
