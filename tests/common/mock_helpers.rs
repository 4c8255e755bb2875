//! Data source doubles

use parking_lot::Mutex;
use pvmonitor_rs::datasource::{ChannelTarget, DataSource, WriteCallback};
use pvmonitor_rs::{PvError, PvResult, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct RecordingState {
    connects: HashMap<String, usize>,
    disconnects: HashMap<String, usize>,
    targets: HashMap<String, Vec<Arc<ChannelTarget>>>,
    failing: HashSet<String>,
    writes: Vec<(String, Value)>,
    write_connects: HashMap<String, usize>,
    write_disconnects: HashMap<String, usize>,
}

/// Data source that counts connections and publishes on demand.
///
/// Channels marked with [`RecordingDataSource::fail_channel`] report a
/// connection error instead of connecting, and refuse write connections.
/// Writes are recorded and then published like
/// [`RecordingDataSource::publish`].
pub struct RecordingDataSource {
    name: String,
    state: Mutex<RecordingState>,
}

impl RecordingDataSource {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(RecordingState::default()),
        })
    }

    pub fn fail_channel(&self, channel: &str) {
        self.state.lock().failing.insert(channel.to_string());
    }

    /// Deliver `value` to every target of `channel`; returns how many
    pub fn publish(&self, channel: &str, value: Value) -> usize {
        let targets = self.targets(channel);
        for target in &targets {
            target.write_value(value.clone());
        }
        targets.len()
    }

    pub fn targets(&self, channel: &str) -> Vec<Arc<ChannelTarget>> {
        self.state
            .lock()
            .targets
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connect_count(&self, channel: &str) -> usize {
        self.state.lock().connects.get(channel).copied().unwrap_or(0)
    }

    pub fn disconnect_count(&self, channel: &str) -> usize {
        self.state.lock().disconnects.get(channel).copied().unwrap_or(0)
    }

    pub fn writes(&self) -> Vec<(String, Value)> {
        self.state.lock().writes.clone()
    }

    pub fn write_connect_count(&self, channel: &str) -> usize {
        self.state.lock().write_connects.get(channel).copied().unwrap_or(0)
    }

    pub fn write_disconnect_count(&self, channel: &str) -> usize {
        self.state
            .lock()
            .write_disconnects
            .get(channel)
            .copied()
            .unwrap_or(0)
    }
}

impl DataSource for RecordingDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self, channel: &str, target: Arc<ChannelTarget>) {
        let failing = {
            let mut state = self.state.lock();
            *state.connects.entry(channel.to_string()).or_default() += 1;
            let failing = state.failing.contains(channel);
            if !failing {
                state
                    .targets
                    .entry(channel.to_string())
                    .or_default()
                    .push(target.clone());
            }
            failing
        };
        if failing {
            target.write_error(PvError::connection(channel, "refused by test source"));
        } else {
            target.set_connected(true);
        }
    }

    fn disconnect(&self, channel: &str, target: &Arc<ChannelTarget>) {
        {
            let mut state = self.state.lock();
            *state.disconnects.entry(channel.to_string()).or_default() += 1;
            if let Some(targets) = state.targets.get_mut(channel) {
                targets.retain(|t| !Arc::ptr_eq(t, target));
            }
        }
        target.set_connected(false);
    }

    fn write(&self, channel: &str, value: Value, callback: WriteCallback) {
        self.state
            .lock()
            .writes
            .push((channel.to_string(), value.clone()));
        self.publish(channel, value);
        callback(Ok(()));
    }

    fn connect_write(&self, channel: &str) -> PvResult<()> {
        let mut state = self.state.lock();
        *state.write_connects.entry(channel.to_string()).or_default() += 1;
        if state.failing.contains(channel) {
            return Err(PvError::write(channel, "refused by test source"));
        }
        Ok(())
    }

    fn disconnect_write(&self, channel: &str) {
        *self
            .state
            .lock()
            .write_disconnects
            .entry(channel.to_string())
            .or_default() += 1;
    }
}
