//! In-process channels (`loc://name` or `loc://name(initial)`).

use super::{ChannelTarget, DataSource, WriteCallback};
use crate::error::{PvError, PvResult};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct LocalChannel {
    value: Option<Value>,
    targets: Vec<Arc<ChannelTarget>>,
    writers: usize,
}

/// Channels that live in memory and are shared by every reader and writer
/// of this source.
///
/// A channel is created on first use. `loc://x(3.5)` creates `x` with the
/// initial value `3.5` (any JSON literal is accepted); the initial value is
/// ignored if `x` already holds a value. Writes are published to every
/// connected reader.
#[derive(Default)]
pub struct LocalDataSource {
    channels: Mutex<HashMap<String, LocalChannel>>,
}

impl LocalDataSource {
    pub const NAME: &'static str = "loc";

    pub fn new() -> Self {
        Self::default()
    }

    /// Split `x(3.5)` into `x` and its initial value
    fn parse_name(channel: &str) -> PvResult<(String, Option<Value>)> {
        match channel.find('(') {
            None => Ok((channel.trim().to_string(), None)),
            Some(open) => {
                let literal = channel[open + 1..].trim_end().strip_suffix(')').ok_or_else(|| {
                    PvError::Configuration(format!(
                        "Local channel '{}' must look like name(initialValue)",
                        channel
                    ))
                })?;
                let value = Value::from_json_literal(literal)?;
                Ok((channel[..open].trim().to_string(), Some(value)))
            }
        }
    }

    /// Set a channel's value and deliver it to every reader
    pub fn publish(&self, channel: &str, value: Value) -> PvResult<()> {
        let (name, _) = Self::parse_name(channel)?;
        let mut channels = self.channels.lock();
        let entry = channels.entry(name).or_default();
        entry.value = Some(value.clone());
        for target in &entry.targets {
            target.write_value(value.clone());
        }
        Ok(())
    }

    /// Report an error to every reader of a channel
    pub fn fail(&self, channel: &str, error: PvError) -> PvResult<()> {
        let (name, _) = Self::parse_name(channel)?;
        let channels = self.channels.lock();
        if let Some(entry) = channels.get(&name) {
            for target in &entry.targets {
                target.write_error(error.clone());
            }
        }
        Ok(())
    }

    /// Current value of a channel
    pub fn value(&self, channel: &str) -> Option<Value> {
        let (name, _) = Self::parse_name(channel).ok()?;
        self.channels.lock().get(&name).and_then(|c| c.value.clone())
    }

    /// Number of targets currently attached to a channel
    pub fn reader_count(&self, channel: &str) -> usize {
        Self::parse_name(channel)
            .ok()
            .and_then(|(name, _)| self.channels.lock().get(&name).map(|c| c.targets.len()))
            .unwrap_or(0)
    }

    /// Number of writers currently holding a channel open
    pub fn writer_count(&self, channel: &str) -> usize {
        Self::parse_name(channel)
            .ok()
            .and_then(|(name, _)| self.channels.lock().get(&name).map(|c| c.writers))
            .unwrap_or(0)
    }
}

impl DataSource for LocalDataSource {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn connect(&self, channel: &str, target: Arc<ChannelTarget>) {
        let (name, initial) = match Self::parse_name(channel) {
            Ok(parsed) => parsed,
            Err(error) => {
                target.write_error(PvError::connection(channel, error.to_string()));
                return;
            }
        };

        let mut channels = self.channels.lock();
        let entry = channels.entry(name).or_default();
        if entry.value.is_none() {
            entry.value = initial;
        }
        target.set_connected(true);
        if let Some(value) = &entry.value {
            target.write_value(value.clone());
        }
        entry.targets.push(target);
        tracing::debug!("Local channel '{}' connected", channel);
    }

    fn disconnect(&self, channel: &str, target: &Arc<ChannelTarget>) {
        let Ok((name, _)) = Self::parse_name(channel) else {
            return;
        };
        let mut channels = self.channels.lock();
        if let Some(entry) = channels.get_mut(&name) {
            let before = entry.targets.len();
            entry.targets.retain(|t| !Arc::ptr_eq(t, target));
            if entry.targets.len() != before {
                target.set_connected(false);
                tracing::debug!("Local channel '{}' disconnected", channel);
            }
        }
    }

    fn write(&self, channel: &str, value: Value, callback: WriteCallback) {
        callback(self.publish(channel, value));
    }

    fn connect_write(&self, channel: &str) -> PvResult<()> {
        let (name, initial) = Self::parse_name(channel)?;
        let mut channels = self.channels.lock();
        let entry = channels.entry(name).or_default();
        if entry.value.is_none() {
            entry.value = initial;
        }
        entry.writers += 1;
        Ok(())
    }

    fn disconnect_write(&self, channel: &str) {
        let Ok((name, _)) = Self::parse_name(channel) else {
            return;
        };
        if let Some(entry) = self.channels.lock().get_mut(&name) {
            entry.writers = entry.writers.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ValueCache;

    fn target(name: &str) -> (Arc<ValueCache<Value>>, Arc<ChannelTarget>) {
        let cache = Arc::new(ValueCache::new());
        let target = Arc::new(ChannelTarget::new(name, vec![cache.clone()]));
        (cache, target)
    }

    #[test]
    fn test_initial_value() {
        let source = LocalDataSource::new();
        let (cache, t) = target("x(3.5)");
        source.connect("x(3.5)", t.clone());
        assert!(t.is_connected());
        assert_eq!(cache.latest(), Some(Value::Double(3.5)));

        // A later initializer does not override the existing value
        let (other, t2) = target("x(9)");
        source.connect("x(9)", t2);
        assert_eq!(other.latest(), Some(Value::Double(3.5)));
    }

    #[test]
    fn test_write_reaches_readers() {
        let source = LocalDataSource::new();
        let (cache, t) = target("x");
        source.connect("x", t);

        let (tx, rx) = crossbeam_channel::bounded(1);
        source.write(
            "x",
            Value::Text("hello".into()),
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        assert!(rx.recv().unwrap().is_ok());
        assert_eq!(cache.latest(), Some(Value::Text("hello".into())));
        assert_eq!(source.value("x"), Some(Value::Text("hello".into())));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let source = LocalDataSource::new();
        let (cache, t) = target("x");
        source.connect("x", t.clone());
        assert_eq!(source.reader_count("x"), 1);

        source.disconnect("x", &t);
        source.disconnect("x", &t);
        assert_eq!(source.reader_count("x"), 0);
        assert!(!cache.is_connected());

        source.publish("x", Value::Int(1)).unwrap();
        assert_eq!(cache.latest(), None);
    }

    #[test]
    fn test_write_connections_are_counted() {
        let source = LocalDataSource::new();
        source.connect_write("x(7)").unwrap();
        source.connect_write("x").unwrap();
        assert_eq!(source.writer_count("x"), 2);
        assert_eq!(source.value("x"), Some(Value::Int(7)));

        source.disconnect_write("x");
        source.disconnect_write("x");
        source.disconnect_write("x");
        assert_eq!(source.writer_count("x"), 0);
        assert!(source.connect_write("x(nope").is_err());
    }

    #[test]
    fn test_bad_initial_value_is_a_channel_error() {
        let source = LocalDataSource::new();
        let (cache, t) = target("x(nope");
        source.connect("x(nope", t.clone());
        assert!(!t.is_connected());
        assert!(matches!(
            cache.read_and_clear_dirty().error,
            Some(PvError::Connection { .. })
        ));
    }
}
