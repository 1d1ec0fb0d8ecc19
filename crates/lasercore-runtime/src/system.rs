//! [`LaserSystem`] – the assembled device: audit trail, safety monitor,
//! interlock aggregator, controllers, shutdown guard and protocol engine,
//! built from one [`StartupConfig`].
//!
//! Construction order matters: the aggregator subscribes to the bus before
//! any controller connects, so the first interlock readings are not missed.

use std::sync::Arc;

use lasercore_hal::{DeviceSet, SerialOpener, SimBench};
use lasercore_kernel::{InterlockAggregator, SafetyMonitor, TreatmentGate};
use lasercore_middleware::{AuditError, AuditSink, EventBus, JsonLinesAuditSink, MemoryAuditSink, Notifier};
use lasercore_protocol::ProtocolValidator;
use lasercore_types::{ConfigError, DeviceKind, HardwareError, OperatorCommand, SafetyError, StartupConfig};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::ProtocolEngine;
use crate::shutdown::ShutdownGuard;

#[derive(Error, Debug)]
pub enum SystemError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("audit log unavailable: {0}")]
    Audit(#[from] AuditError),
}

pub struct LaserSystem {
    config: StartupConfig,
    notifier: Notifier,
    monitor: Arc<SafetyMonitor>,
    devices: Arc<DeviceSet>,
    bench: Option<SimBench>,
    engine: ProtocolEngine,
    guard: ShutdownGuard,
    aggregator: JoinHandle<()>,
    cancel: CancellationToken,
}

impl LaserSystem {
    /// Assemble everything without connecting hardware. Must be called from
    /// within a Tokio runtime.
    pub fn build(config: StartupConfig) -> Result<Self, SystemError> {
        config.validate()?;

        let sink: Arc<dyn AuditSink> = match &config.audit_log {
            Some(path) => {
                info!(path = %path.display(), "auditing to file");
                Arc::new(JsonLinesAuditSink::open(path)?)
            }
            None => Arc::new(MemoryAuditSink::new()),
        };
        let notifier = Notifier::new(EventBus::default(), sink);
        let monitor = Arc::new(SafetyMonitor::new(notifier.clone()));

        let cancel = CancellationToken::new();
        let aggregator = InterlockAggregator::new(Arc::clone(&monitor), &config)
            .spawn(notifier.bus(), cancel.clone());

        let (devices, bench) = if config.simulate {
            let bench = SimBench::assemble(&config, notifier.clone());
            (Arc::clone(&bench.devices), Some(bench))
        } else {
            let devices = DeviceSet::new(&config, Arc::new(SerialOpener), notifier.clone());
            (Arc::new(devices), None)
        };

        let guard = ShutdownGuard::spawn(&monitor, Arc::clone(&devices), notifier.clone());
        let gate = Arc::new(TreatmentGate::new(
            ProtocolValidator::with_default_rules().home_speed(config.engine.home_speed_mm_s),
            Arc::clone(&monitor),
        ));
        let engine = ProtocolEngine::new(
            Arc::clone(&devices),
            gate,
            notifier.clone(),
            config.engine.clone(),
        );

        info!(simulate = config.simulate, "laser system assembled");
        Ok(Self {
            config,
            notifier,
            monitor,
            devices,
            bench,
            engine,
            guard,
            aggregator,
            cancel,
        })
    }

    /// Connect every controller, then bring the thermal loop to its
    /// setpoint.
    pub async fn connect_all(&self) -> Result<(), HardwareError> {
        let devices = Arc::clone(&self.devices);
        let setpoint = self.config.thermal_setpoint_c;
        tokio::task::spawn_blocking(move || {
            devices.connect_all()?;
            devices.thermal().regulate_at(setpoint)
        })
        .await
        .unwrap_or(Err(HardwareError::Cancelled {
            device: DeviceKind::Thermal,
        }))
    }

    pub fn config(&self) -> &StartupConfig {
        &self.config
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn monitor(&self) -> &Arc<SafetyMonitor> {
        &self.monitor
    }

    pub fn devices(&self) -> &Arc<DeviceSet> {
        &self.devices
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    /// Simulated hardware handles, when running simulated.
    pub fn bench(&self) -> Option<&SimBench> {
        self.bench.as_ref()
    }

    pub fn emergency_stop(&self) -> Result<(), SafetyError> {
        self.monitor.command(OperatorCommand::EmergencyStop).map(|_| ())
    }

    /// Remove laser output, stop the background tasks and release every
    /// channel.
    pub async fn shutdown(self) {
        let devices = Arc::clone(&self.devices);
        let released = tokio::task::spawn_blocking(move || {
            let idle = devices.selective_shutdown();
            devices.disconnect_all();
            idle
        })
        .await;
        match released {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "laser idle failed during shutdown"),
            Err(e) => warn!(error = %e, "shutdown task failed"),
        }
        let shutdowns = self.guard.stop().await;
        self.cancel.cancel();
        if let Err(e) = self.aggregator.await {
            warn!(error = %e, "aggregator task ended abnormally");
        }
        info!(guard_shutdowns = shutdowns, "laser system stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use lasercore_types::SafetyState;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn simulated_system_arms_with_pedal_and_session() {
        let system = LaserSystem::build(StartupConfig::simulated()).unwrap();
        system.connect_all().await.unwrap();
        system.bench().unwrap().interlock.set_footpedal(true);
        system.monitor().command(OperatorCommand::StartSession).unwrap();

        let mut rx = system.monitor().subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.state == SafetyState::Armed))
            .await
            .expect("never armed")
            .unwrap();

        system.emergency_stop().unwrap();
        assert_eq!(system.monitor().state(), SafetyState::EmergencyStop);
        system.shutdown().await;
    }

    #[tokio::test]
    async fn audit_log_is_written_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut config = StartupConfig::simulated();
        config.audit_log = Some(path.clone());

        let system = LaserSystem::build(config).unwrap();
        system.monitor().command(OperatorCommand::StartSession).unwrap();
        system.shutdown().await;

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.lines().count() >= 1);
        assert!(written.contains("session_valid"));
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let mut config = StartupConfig::simulated();
        config.watchdog.timeout_ms = config.watchdog.heartbeat_period_ms;
        assert!(matches!(
            LaserSystem::build(config),
            Err(SystemError::Config(_))
        ));
    }
}
