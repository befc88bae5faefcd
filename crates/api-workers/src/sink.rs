//! Outbound side of the notification path.
//!
//! The dispatcher does not own a notification bus. It republishes every `NOTIFICATION`
//! from its units into a [`NotificationSink`] supplied by the host, keeping `resource`,
//! `event` and `data` exactly as the unit sent them.

use serde_json::Value;

/// Destination for notifications republished by the dispatcher.
pub trait NotificationSink: Send + Sync + 'static {
    fn publish(&self, resource: &str, event: &str, data: Value);
}

impl<F> NotificationSink for F
where
    F: Fn(&str, &str, Value) + Send + Sync + 'static,
{
    fn publish(&self, resource: &str, event: &str, data: Value) {
        self(resource, event, data)
    }
}
