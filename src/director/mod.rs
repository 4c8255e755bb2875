//! Directors: connection lifecycle and notification scheduling
//!
//! A [`PvReader`] owns a set of read expressions. It connects the channels
//! their recipe needs, evaluates every expression once per period on its own
//! notification thread and hands the results to listeners. A [`PvWriter`]
//! routes values written by the application to channels, and a
//! [`PvReadWriter`] pairs the two over a read-write expression.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ─► Connecting ─► Running ◄─► Reconfiguring
//!                        │  ▲
//!                        ▼  │
//!                       Paused
//!            (any) ─► Closing ─► Closed
//! ```
//!
//! # Threading
//!
//! Listeners are called on the reader's notification thread only, one call
//! at a time. Reconfiguration (`add_expression`, `remove_expression`), pause,
//! resume and close may be called from any thread, including from inside a
//! listener.

mod read_writer;
mod reader;
mod scheduler;
mod writer;

pub use crate::config::NotifyPolicy;
pub use read_writer::PvReadWriter;
pub use reader::{PvReader, ReaderBuilder};
pub use writer::PvWriter;

use crate::error::PvError;
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies an expression added to a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExpressionId(pub u64);

impl fmt::Display for ExpressionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a listener receives for one expression on one tick
#[derive(Debug, Clone)]
pub struct Notification {
    pub expression: ExpressionId,
    /// Default name of the expression, e.g. `avg(A)`
    pub name: String,
    /// Computed value; absent when no data is available or on error
    pub value: Option<Value>,
    pub error: Option<PvError>,
    /// Whether every channel the expression reads is connected
    pub connected: bool,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Receives notifications from a reader
pub trait ReadListener: Send + Sync {
    fn on_notify(&self, notification: &Notification);
}

impl<F> ReadListener for F
where
    F: Fn(&Notification) + Send + Sync,
{
    fn on_notify(&self, notification: &Notification) {
        self(notification)
    }
}

/// Director lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectorLifecycle {
    /// No expression added yet
    Idle,
    /// Channels are being requested from the data sources
    Connecting,
    Running,
    /// Applying a recipe change
    Reconfiguring,
    Paused,
    Closing,
    Closed,
}

impl DirectorLifecycle {
    pub fn is_closed(self) -> bool {
        matches!(self, DirectorLifecycle::Closing | DirectorLifecycle::Closed)
    }
}

impl fmt::Display for DirectorLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DirectorLifecycle::Idle => "idle",
            DirectorLifecycle::Connecting => "connecting",
            DirectorLifecycle::Running => "running",
            DirectorLifecycle::Reconfiguring => "reconfiguring",
            DirectorLifecycle::Paused => "paused",
            DirectorLifecycle::Closing => "closing",
            DirectorLifecycle::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Counters of a reader, as returned by [`PvReader::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorStats {
    /// Ticks that evaluated the expressions
    pub ticks: u64,
    /// Listener calls made
    pub notifications: u64,
    /// Evaluations not notified because nothing changed
    pub skipped_notifications: u64,
    /// Ticks dropped because the previous one overran its period
    pub lagged_ticks: u64,
    /// Evaluation errors and listener panics
    pub evaluation_errors: u64,
    /// Channels currently reporting a connection
    pub connected_channels: usize,
}

impl DirectorStats {
    /// Share of evaluations that were notified, as a percentage
    pub fn notify_rate(&self) -> f64 {
        let total = self.notifications + self.skipped_notifications;
        if total == 0 {
            100.0
        } else {
            (self.notifications as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub ticks: AtomicU64,
    pub notifications: AtomicU64,
    pub skipped_notifications: AtomicU64,
    pub lagged_ticks: AtomicU64,
    pub evaluation_errors: AtomicU64,
}

impl StatsCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, connected_channels: usize) -> DirectorStats {
        DirectorStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            skipped_notifications: self.skipped_notifications.load(Ordering::Relaxed),
            lagged_ticks: self.lagged_ticks.load(Ordering::Relaxed),
            evaluation_errors: self.evaluation_errors.load(Ordering::Relaxed),
            connected_channels,
        }
    }
}

/// Message of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_listener() {
        let listener = |n: &Notification| assert_eq!(n.name, "x");
        let notification = Notification {
            expression: ExpressionId(1),
            name: "x".to_string(),
            value: None,
            error: None,
            connected: false,
            timestamp: Utc::now(),
        };
        listener.on_notify(&notification);
        assert!(!notification.is_error());
    }

    #[test]
    fn test_notify_rate() {
        let stats = DirectorStats {
            notifications: 3,
            skipped_notifications: 1,
            ..Default::default()
        };
        assert_eq!(stats.notify_rate(), 75.0);
        assert_eq!(DirectorStats::default().notify_rate(), 100.0);
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");
    }

    #[test]
    fn test_lifecycle_display() {
        assert_eq!(DirectorLifecycle::Reconfiguring.to_string(), "reconfiguring");
        assert!(DirectorLifecycle::Closing.is_closed());
    }
}
