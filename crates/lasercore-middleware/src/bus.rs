//! Typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels so that every subscriber receives
//! every message without any single subscriber blocking the publisher.
//! Publishing never runs subscriber code, so a controller that emits a
//! notification while holding its channel lock cannot be re-entered from the
//! notification path.
//!
//! # Topics
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::Safety`] | State transitions, interlock changes, rejected commands, override changes |
//! | [`Topic::Devices`] | Per-controller connection, value and error notifications |
//! | [`Topic::Execution`] | Run and line lifecycle, progress snapshots, faults |
//!
//! Events are routed by payload ([`Topic::of`]), so a publisher cannot put a
//! safety transition on the device lane by mistake.

use lasercore_types::{BusError, DeviceKind, Event, EventPayload};
use tokio::sync::broadcast;
use tracing::warn;

/// Buffered events per topic before slow subscribers start lagging.
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Safety,
    Devices,
    Execution,
}

impl Topic {
    /// The lane an event payload travels on.
    pub fn of(payload: &EventPayload) -> Topic {
        match payload {
            EventPayload::SafetyStateChanged { .. }
            | EventPayload::InterlockChanged { .. }
            | EventPayload::TransitionRejected { .. }
            | EventPayload::OverrideChanged { .. } => Topic::Safety,
            EventPayload::Device { .. } => Topic::Devices,
            EventPayload::Execution(_) | EventPayload::Fault { .. } => Topic::Execution,
        }
    }
}

/// Shared event bus. Clones share the same underlying channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    safety: broadcast::Sender<Event>,
    devices: broadcast::Sender<Event>,
    execution: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` applies to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (safety, _) = broadcast::channel(capacity);
        let (devices, _) = broadcast::channel(capacity);
        let (execution, _) = broadcast::channel(capacity);
        Self {
            safety,
            devices,
            execution,
        }
    }

    /// Publish `event` on the topic its payload belongs to.
    ///
    /// Returns the number of receivers handed the event, or
    /// [`BusError::NoSubscribers`] when nobody is listening. Callers that do
    /// not care use `let _ =`.
    pub fn publish(&self, event: Event) -> Result<usize, BusError> {
        let topic = Topic::of(&event.payload);
        self.sender(topic)
            .send(event)
            .map_err(|_| BusError::NoSubscribers(format!("{topic:?}")))
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.sender(topic).subscribe(),
        }
    }

    /// Subscribe to the notifications of a single device.
    pub fn subscribe_device(&self, device: DeviceKind) -> DeviceReceiver {
        DeviceReceiver {
            device,
            receiver: self.devices.subscribe(),
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.sender(topic).receiver_count()
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Safety => &self.safety,
            Topic::Devices => &self.devices,
            Topic::Execution => &self.execution,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Receivers
// ---------------------------------------------------------------------------

/// An async receiver bound to one [`Topic`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event.
    ///
    /// `Err(Lagged(n))` means `n` events were dropped for this subscriber;
    /// the caller decides whether to continue.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking poll.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

/// Receiver that yields only one device's notifications.
pub struct DeviceReceiver {
    device: DeviceKind,
    receiver: broadcast::Receiver<Event>,
}

impl DeviceReceiver {
    /// Next event from this device. `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => match &event.payload {
                    EventPayload::Device { device, .. } if *device == self.device => {
                        return Some(event);
                    }
                    _ => continue,
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(device = %self.device, lagged_by = n, "device receiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lasercore_types::{
        DeviceNotification, ExecutionEvent, ExecutionState, InterlockField, InterlockStatus,
    };
    use std::time::Duration;
    use uuid::Uuid;

    fn device_event(device: DeviceKind, mm: f64) -> Event {
        Event::new(
            device.source(),
            EventPayload::Device {
                device,
                notification: DeviceNotification::PositionChanged { mm },
            },
        )
    }

    fn interlock_event() -> Event {
        Event::new(
            "lasercore-kernel::monitor",
            EventPayload::InterlockChanged {
                field: InterlockField::FootpedalPressed,
                value: true,
                status: InterlockStatus::default(),
            },
        )
    }

    #[test]
    fn payloads_route_to_their_topic() {
        assert_eq!(Topic::of(&interlock_event().payload), Topic::Safety);
        assert_eq!(
            Topic::of(&device_event(DeviceKind::Laser, 0.0).payload),
            Topic::Devices
        );
        let started = EventPayload::Execution(ExecutionEvent::StateChanged {
            run_id: Uuid::new_v4(),
            state: ExecutionState::Running,
        });
        assert_eq!(Topic::of(&started), Topic::Execution);
    }

    #[test]
    fn publish_without_subscribers_is_an_error() {
        let bus = EventBus::default();
        assert!(bus.publish(interlock_event()).is_err());
    }

    #[tokio::test]
    async fn every_subscriber_receives_the_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut a = bus.subscribe_to(Topic::Safety);
        let mut b = bus.subscribe_to(Topic::Safety);
        let event = interlock_event();
        assert_eq!(bus.publish(event.clone())?, 2);
        assert_eq!(a.recv().await?.id, event.id);
        assert_eq!(b.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn topics_are_isolated() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut safety = bus.subscribe_to(Topic::Safety);
        let _devices = bus.subscribe_to(Topic::Devices);
        bus.publish(device_event(DeviceKind::Actuator, 1.0))?;
        let result = tokio::time::timeout(Duration::from_millis(50), safety.recv()).await;
        assert!(result.is_err(), "safety lane must not see device traffic");
        Ok(())
    }

    #[tokio::test]
    async fn device_receiver_filters_other_devices() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut actuator = bus.subscribe_device(DeviceKind::Actuator);
        bus.publish(device_event(DeviceKind::Laser, 9.0))?;
        let wanted = device_event(DeviceKind::Actuator, 3.0);
        bus.publish(wanted.clone())?;
        let got = actuator.recv().await.ok_or("bus closed")?;
        assert_eq!(got.id, wanted.id);
        Ok(())
    }

    #[tokio::test]
    async fn per_publisher_order_is_preserved() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Devices);
        for i in 0..20 {
            bus.publish(device_event(DeviceKind::Actuator, f64::from(i)))?;
        }
        for i in 0..20 {
            let event = rx.recv().await?;
            match event.payload {
                EventPayload::Device {
                    notification: DeviceNotification::PositionChanged { mm },
                    ..
                } => assert_eq!(mm, f64::from(i)),
                other => panic!("unexpected payload {other:?}"),
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(16);
        let mut slow = bus.subscribe_to(Topic::Devices);
        for i in 0..1_000 {
            let _ = bus.publish(device_event(DeviceKind::Actuator, f64::from(i)));
        }
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
