//! `lasercore-middleware` – event routing and audit.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-based publish/subscribe [`EventBus`] built on
//!   Tokio broadcast channels.
//! - [`audit`] – the [`AuditSink`] trait with in-memory and JSON-lines
//!   implementations.
//! - [`notifier`] – [`Notifier`], which publishes live notifications and
//!   writes audit records from the same call site.

pub mod audit;
pub mod bus;
pub mod notifier;

pub use audit::{AuditError, AuditSink, JsonLinesAuditSink, MemoryAuditSink};
pub use bus::{DeviceReceiver, EventBus, Topic, TopicReceiver};
pub use notifier::Notifier;
