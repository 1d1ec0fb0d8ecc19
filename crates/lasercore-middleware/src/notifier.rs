//! [`Notifier`] – one call site for live notifications and audit records.
//!
//! [`Notifier::record`] appends the event to the audit sink and publishes it
//! on the bus in a single call, so a fault can never reach the operator
//! without also reaching the audit trail (or the other way round).
//! [`Notifier::notify`] publishes high-rate values such as positions and
//! progress that do not belong in the audit trail.

use std::sync::Arc;

use lasercore_types::{Event, EventPayload};
use tracing::error;

use crate::audit::{AuditSink, MemoryAuditSink};
use crate::bus::EventBus;

#[derive(Clone)]
pub struct Notifier {
    bus: EventBus,
    sink: Arc<dyn AuditSink>,
}

impl Notifier {
    pub fn new(bus: EventBus, sink: Arc<dyn AuditSink>) -> Self {
        Self { bus, sink }
    }

    /// A notifier on a fresh bus with an in-memory sink, which is returned
    /// for inspection.
    pub fn in_memory() -> (Self, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        (Self::new(EventBus::default(), sink.clone()), sink)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Publish without auditing.
    pub fn notify(&self, source: &str, payload: EventPayload) -> Event {
        let event = Event::new(source, payload);
        let _ = self.bus.publish(event.clone());
        event
    }

    /// Audit, then publish. Sink failures are logged and do not stop the
    /// live notification.
    pub fn record(&self, source: &str, payload: EventPayload) -> Event {
        let event = Event::new(source, payload);
        if let Err(e) = self.sink.append(&event) {
            error!(error = %e, source, "audit sink rejected record");
        }
        let _ = self.bus.publish(event.clone());
        event
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").field("bus", &self.bus).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditError;
    use crate::bus::Topic;
    use lasercore_types::{DeviceKind, DeviceNotification};

    struct BrokenSink;

    impl AuditSink for BrokenSink {
        fn append(&self, _event: &Event) -> Result<(), AuditError> {
            Err(AuditError::Io {
                path: "/dev/full".into(),
                source: std::io::Error::other("disk full"),
            })
        }
    }

    fn fault() -> EventPayload {
        EventPayload::Device {
            device: DeviceKind::Laser,
            notification: DeviceNotification::ErrorOccurred {
                message: "channel closed".into(),
                permanent: true,
            },
        }
    }

    #[tokio::test]
    async fn record_reaches_bus_and_sink() -> Result<(), Box<dyn std::error::Error>> {
        let (notifier, sink) = Notifier::in_memory();
        let mut rx = notifier.bus().subscribe_to(Topic::Devices);
        let sent = notifier.record("lasercore-hal::laser", fault());
        assert_eq!(rx.recv().await?.id, sent.id);
        assert_eq!(sink.records()[0].id, sent.id);
        Ok(())
    }

    #[tokio::test]
    async fn notify_skips_the_sink() -> Result<(), Box<dyn std::error::Error>> {
        let (notifier, sink) = Notifier::in_memory();
        let mut rx = notifier.bus().subscribe_to(Topic::Devices);
        notifier.notify(
            "lasercore-hal::actuator",
            EventPayload::Device {
                device: DeviceKind::Actuator,
                notification: DeviceNotification::PositionChanged { mm: 1.0 },
            },
        );
        rx.recv().await?;
        assert!(sink.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn broken_sink_does_not_block_live_notification() -> Result<(), Box<dyn std::error::Error>> {
        let notifier = Notifier::new(EventBus::default(), Arc::new(BrokenSink));
        let mut rx = notifier.bus().subscribe_to(Topic::Devices);
        let sent = notifier.record("lasercore-hal::laser", fault());
        assert_eq!(rx.recv().await?.id, sent.id);
        Ok(())
    }
}
