//! Test data builders for creating test objects

use super::wait_until;
use parking_lot::Mutex;
use pvmonitor_rs::{Notification, Value};
use std::sync::Arc;
use std::time::Duration;

/// Collects the notifications of one expression
#[derive(Clone, Default)]
pub struct NotificationRecorder {
    received: Arc<Mutex<Vec<Notification>>>,
}

impl NotificationRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listener appending to this recorder
    pub fn listener(&self) -> impl Fn(&Notification) + Send + Sync + 'static {
        let received = self.received.clone();
        move |notification: &Notification| received.lock().push(notification.clone())
    }

    pub fn len(&self) -> usize {
        self.received.lock().len()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.received.lock().clone()
    }

    /// Values of the notifications that carried one, in order
    pub fn values(&self) -> Vec<Value> {
        self.received
            .lock()
            .iter()
            .filter_map(|n| n.value.clone())
            .collect()
    }

    pub fn errors(&self) -> usize {
        self.received.lock().iter().filter(|n| n.is_error()).count()
    }

    pub fn last_value(&self) -> Option<Value> {
        self.values().pop()
    }

    /// Wait for a notification whose value is `expected`
    pub fn wait_for_value(&self, expected: &Value, timeout: Duration) -> anyhow::Result<()> {
        wait_until(timeout, || self.values().iter().any(|v| v == expected)).map_err(|e| {
            anyhow::anyhow!("{} (got {:?})", e, self.values())
        })
    }
}
