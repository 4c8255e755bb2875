//! Single-slot value cache
//!
//! A [`ValueCache`] holds the newest value of one channel for one source-rate
//! expression. Data-source threads overwrite it; the director reads it once
//! per tick. Only the newest value survives between reads.

use crate::error::PvError;
use crate::value::Value;
use parking_lot::Mutex;

/// Something a channel delivers its source-rate events into.
///
/// Implemented by [`ValueCache`] and by the collectors. Calls happen on
/// data-source threads and must return quickly.
pub trait ChannelListener: Send + Sync {
    /// A new value arrived
    fn on_value(&self, value: &Value);

    /// The channel reported a fault
    fn on_error(&self, error: &PvError);

    /// The channel connected or disconnected
    fn on_connection_changed(&self, _connected: bool) {}

    /// Drop whatever is waiting for the next read; called when a director
    /// pauses so nothing collected before the pause is delivered after it
    fn clear_pending(&self) {}
}

/// What a tick observes when reading a cache
#[derive(Debug, Clone)]
pub struct CacheSnapshot<T> {
    /// Last good value, if any was ever written
    pub value: Option<T>,
    /// Error written since the previous read
    pub error: Option<PvError>,
    /// Whether a value or error arrived since the previous read
    pub updated: bool,
}

#[derive(Debug)]
struct CacheState<T> {
    value: Option<T>,
    error: Option<PvError>,
    dirty: bool,
    connected: bool,
}

/// Newest-wins holder for the latest value of one channel
#[derive(Debug)]
pub struct ValueCache<T> {
    state: Mutex<CacheState<T>>,
}

impl<T: Clone> ValueCache<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                value: None,
                error: None,
                dirty: false,
                connected: false,
            }),
        }
    }

    /// Store a value, replacing whatever was there and clearing any error
    pub fn write(&self, value: T) {
        let mut state = self.state.lock();
        state.value = Some(value);
        state.error = None;
        state.dirty = true;
    }

    /// Mark the channel faulted; the last good value stays retrievable
    pub fn write_error(&self, error: PvError) {
        let mut state = self.state.lock();
        state.error = Some(error);
        state.dirty = true;
    }

    /// Read the cache and reset the update flag.
    ///
    /// An error is reported exactly once: the following read returns the
    /// last good value again unless a new error arrived.
    pub fn read_and_clear_dirty(&self) -> CacheSnapshot<T> {
        let mut state = self.state.lock();
        let snapshot = CacheSnapshot {
            value: state.value.clone(),
            error: state.error.take(),
            updated: state.dirty,
        };
        state.dirty = false;
        snapshot
    }

    /// Forget a pending update or error; the last good value is kept
    pub fn clear_pending(&self) {
        let mut state = self.state.lock();
        state.error = None;
        state.dirty = false;
    }

    /// Latest value without touching the update flag
    pub fn latest(&self) -> Option<T> {
        self.state.lock().value.clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

impl<T: Clone> Default for ValueCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelListener for ValueCache<Value> {
    fn on_value(&self, value: &Value) {
        self.write(value.clone());
    }

    fn on_error(&self, error: &PvError) {
        self.write_error(error.clone());
    }

    fn on_connection_changed(&self, connected: bool) {
        self.set_connected(connected);
    }

    fn clear_pending(&self) {
        ValueCache::clear_pending(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_newest_value_wins() {
        let cache = ValueCache::new();
        cache.write(1.0);
        cache.write(2.0);
        cache.write(3.0);

        let snapshot = cache.read_and_clear_dirty();
        assert_eq!(snapshot.value, Some(3.0));
        assert!(snapshot.updated);

        let again = cache.read_and_clear_dirty();
        assert_eq!(again.value, Some(3.0));
        assert!(!again.updated);
    }

    #[test]
    fn test_error_keeps_last_good_value() {
        let cache = ValueCache::new();
        cache.write(5.0);
        cache.read_and_clear_dirty();

        cache.write_error(PvError::connection("A", "lost"));
        let faulted = cache.read_and_clear_dirty();
        assert_eq!(faulted.value, Some(5.0));
        assert!(faulted.error.is_some());
        assert!(faulted.updated);

        // Fault is reported for one tick only
        let next = cache.read_and_clear_dirty();
        assert!(next.error.is_none());
        assert_eq!(next.value, Some(5.0));
    }

    #[test]
    fn test_clear_pending_keeps_value() {
        let cache = ValueCache::new();
        cache.write(1.0);
        cache.write_error(PvError::Read("bad".into()));
        cache.clear_pending();

        let snapshot = cache.read_and_clear_dirty();
        assert!(!snapshot.updated);
        assert!(snapshot.error.is_none());
        assert_eq!(snapshot.value, Some(1.0));
    }

    #[test]
    fn test_write_clears_error() {
        let cache = ValueCache::new();
        cache.write_error(PvError::Read("bad".into()));
        cache.write(1.0);
        let snapshot = cache.read_and_clear_dirty();
        assert!(snapshot.error.is_none());
        assert_eq!(snapshot.value, Some(1.0));
    }

    #[test]
    fn test_concurrent_writers_never_tear() {
        let cache = Arc::new(ValueCache::<Value>::new());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        cache.write(Value::DoubleArray(vec![w as f64; 1 + i % 8]));
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            if let Some(Value::DoubleArray(items)) = cache.read_and_clear_dirty().value {
                // Every element written in one call carries the same writer id
                assert!(items.windows(2).all(|w| w[0] == w[1]));
            }
        }

        for w in writers {
            w.join().unwrap();
        }
    }
}
