//! Collectors: buffers between source-rate writers and the desired-rate reader
//!
//! Data-source threads push samples into a collector through
//! [`ChannelListener`](crate::cache::ChannelListener); the director's
//! notification thread drains it once per tick through
//! [`ReadFunction`](crate::expression::ReadFunction).
//!
//! # Variants
//!
//! - [`QueueCollector`] - every sample since the last read, in order
//! - [`TimedWindowCollector`] - sliding window of samples younger than a maximum age
//! - [`LastValue`] - newest sample of a queue (kept across empty ticks)
//! - [`Average`] - mean of the queued samples, or no value when nothing arrived
//! - [`StatisticsOf`] - mean, population std-dev, min, max and count
//!
//! # Threading
//!
//! `collect` may run concurrently from any number of data-source threads.
//! `read` is single-consumer: only the director that owns the expression
//! calls it, and never concurrently with itself.

mod aggregate;
mod queue;
mod timed_window;

pub use aggregate::{Average, LastValue, StatisticsOf};
pub use queue::QueueCollector;
pub use timed_window::TimedWindowCollector;

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

/// Monotonic time source for time-based collectors
pub trait Clock: Send + Sync + fmt::Debug {
    /// Time elapsed since the clock's origin
    fn now(&self) -> Duration;
}

/// Wall-clock implementation backed by [`Instant`]
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock advanced by hand, for deterministic tests of time windows
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}
