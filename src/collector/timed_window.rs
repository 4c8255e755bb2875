//! Sliding time-window collector.

use super::Clock;
use crate::cache::ChannelListener;
use crate::error::{PvError, PvResult};
use crate::expression::{EvalContext, ReadFunction};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct WindowState {
    samples: VecDeque<(Duration, Value)>,
    error: Option<PvError>,
    fresh: bool,
}

/// Retains the samples younger than `max_age`.
///
/// Reading does not consume the window: a sample is returned by every read
/// until it ages out. Old samples are dropped on both collect and read, so
/// the buffer stays bounded by the arrival rate times `max_age`.
#[derive(Debug)]
pub struct TimedWindowCollector {
    max_age: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<WindowState>,
}

impl TimedWindowCollector {
    pub fn new(max_age: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_age,
            clock,
            state: Mutex::new(WindowState::default()),
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn collect(&self, sample: Value) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.samples.push_back((now, sample));
        state.fresh = true;
        Self::prune(&mut state.samples, now, self.max_age);
    }

    pub fn collect_error(&self, error: PvError) {
        self.state.lock().error = Some(error);
    }

    /// Empty the window and forget any pending fault
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.samples.clear();
        state.error = None;
        state.fresh = false;
    }

    /// Current window contents, oldest first, and whether anything arrived
    /// since the previous read
    pub fn read(&self) -> PvResult<(Vec<Value>, bool)> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if let Some(error) = state.error.take() {
            return Err(error);
        }
        Self::prune(&mut state.samples, now, self.max_age);
        let fresh = std::mem::take(&mut state.fresh);
        let window = state.samples.iter().map(|(_, v)| v.clone()).collect();
        Ok((window, fresh))
    }

    fn prune(samples: &mut VecDeque<(Duration, Value)>, now: Duration, max_age: Duration) {
        while let Some((stamp, _)) = samples.front() {
            if now.saturating_sub(*stamp) >= max_age {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl ChannelListener for TimedWindowCollector {
    fn on_value(&self, value: &Value) {
        self.collect(value.clone());
    }

    fn on_error(&self, error: &PvError) {
        self.collect_error(error.clone());
    }

    fn clear_pending(&self) {
        self.clear();
    }
}

impl ReadFunction for TimedWindowCollector {
    fn read_value(&self, ctx: &mut EvalContext) -> PvResult<Option<Value>> {
        let (window, fresh) = self.read()?;
        if fresh {
            ctx.mark_new_data();
        }
        Ok(Some(Value::List(window)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::ManualClock;

    fn window(ms: u64) -> (Arc<ManualClock>, TimedWindowCollector) {
        let clock = Arc::new(ManualClock::new());
        let collector = TimedWindowCollector::new(Duration::from_millis(ms), clock.clone());
        (clock, collector)
    }

    #[test]
    fn test_read_is_not_destructive() {
        let (_clock, collector) = window(100);
        collector.collect(1.0.into());
        assert_eq!(collector.read().unwrap(), (vec![Value::Double(1.0)], true));
        assert_eq!(collector.read().unwrap(), (vec![Value::Double(1.0)], false));
    }

    #[test]
    fn test_samples_slide_out() {
        let (clock, collector) = window(100);
        collector.collect(1.0.into());
        clock.advance(Duration::from_millis(60));
        collector.collect(2.0.into());
        clock.advance(Duration::from_millis(60));

        let (values, _) = collector.read().unwrap();
        assert_eq!(values, vec![Value::Double(2.0)]);
    }

    #[test]
    fn test_clear_pending_empties_window() {
        let (_clock, collector) = window(100);
        collector.collect(1.0.into());
        collector.clear_pending();
        assert_eq!(collector.read().unwrap(), (vec![], false));
    }

    #[test]
    fn test_empty_after_window_elapses() {
        let (clock, collector) = window(100);
        collector.collect(1.0.into());
        collector.collect(2.0.into());
        clock.advance(Duration::from_millis(101));
        let (values, _) = collector.read().unwrap();
        assert!(values.is_empty());
    }
}
