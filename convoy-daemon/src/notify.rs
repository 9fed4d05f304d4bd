//! Notification boundary.
//!
//! Every event the engine persists is handed to a [`Notifier`] afterwards.
//! Delivery and throttling belong to the implementation; the built-in
//! [`TracingNotifier`] just logs.

use convoy_core::{Event, EventLevel};

pub trait Notifier: Send {
    fn notify(&self, event: &Event);
}

/// Writes each event as a tracing record at the matching level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &Event) {
        let deployment = event
            .deployment_id
            .map(|d| d.to_string())
            .unwrap_or_default();
        match event.level {
            EventLevel::Info => {
                tracing::info!(event_id = event.id, deployment_id = %deployment, "{}", event.message)
            }
            EventLevel::Warn => {
                tracing::warn!(event_id = event.id, deployment_id = %deployment, "{}", event.message)
            }
            EventLevel::Error => {
                tracing::error!(event_id = event.id, deployment_id = %deployment, "{}", event.message)
            }
        }
    }
}
