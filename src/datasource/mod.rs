//! Data sources: where channel values come from
//!
//! A [`DataSource`] owns the protocol side of a channel. Directors never read
//! from a source directly; they hand it a [`ChannelTarget`] on connect and the
//! source pushes values, errors and connection changes into it from its own
//! threads.
//!
//! ## Built-in sources
//!
//! - [`LocalDataSource`] (`loc://`) - in-process channels, writable
//! - [`SimulationDataSource`] (`sim://`) - generated signals such as
//!   `sim://sine(0, 10, 20, 0.1)`
//!
//! [`CompositeDataSource`] routes channel names to sources by prefix.

mod local;
mod name_parser;
mod sim;

pub use local::LocalDataSource;
pub use name_parser::{parse_function, FunctionCall};
pub use sim::{GeneratorFactory, GeneratorRegistry, SimFunction, SimulationDataSource};

use crate::cache::ChannelListener;
use crate::error::{PvError, PvResult};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Completion of a single channel write
pub type WriteCallback = Box<dyn FnOnce(PvResult<()>) + Send>;

/// Connector for one family of channels.
///
/// `connect` must not block: a failure to connect is reported later by
/// writing an error into the target. `disconnect` is idempotent.
#[cfg_attr(test, mockall::automock)]
pub trait DataSource: Send + Sync {
    /// Short name, also the channel prefix used by [`CompositeDataSource`]
    fn name(&self) -> &str;

    /// Start delivering `channel` updates into `target`
    fn connect(&self, channel: &str, target: Arc<ChannelTarget>);

    /// Stop delivering into `target`
    fn disconnect(&self, channel: &str, target: &Arc<ChannelTarget>);

    /// Write a value; `callback` runs exactly once with the outcome
    fn write(&self, channel: &str, value: Value, callback: WriteCallback);

    /// Open `channel` for writing. Sources that cannot write refuse here.
    fn connect_write(&self, _channel: &str) -> PvResult<()> {
        Ok(())
    }

    /// Release a channel opened by `connect_write`
    fn disconnect_write(&self, _channel: &str) {}
}

struct TargetState {
    connected: bool,
    last_value: Option<Value>,
    listeners: Vec<Arc<dyn ChannelListener>>,
}

/// Per-connection fan-out point a data source writes into.
///
/// One target exists per connected channel per director. Events are
/// delivered to the listeners while the target's lock is held, so listeners
/// observe a channel's events in the order the source produced them.
pub struct ChannelTarget {
    channel: String,
    state: Mutex<TargetState>,
}

impl ChannelTarget {
    pub fn new(channel: impl Into<String>, listeners: Vec<Arc<dyn ChannelListener>>) -> Self {
        Self {
            channel: channel.into(),
            state: Mutex::new(TargetState {
                connected: false,
                last_value: None,
                listeners,
            }),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn write_value(&self, value: Value) {
        let mut state = self.state.lock();
        for listener in &state.listeners {
            listener.on_value(&value);
        }
        state.last_value = Some(value);
    }

    pub fn write_error(&self, error: PvError) {
        let state = self.state.lock();
        tracing::warn!("Channel '{}' reported: {}", self.channel, error);
        for listener in &state.listeners {
            listener.on_error(&error);
        }
    }

    /// Record a connection change; repeated states are ignored
    pub fn set_connected(&self, connected: bool) {
        let mut state = self.state.lock();
        if state.connected == connected {
            return;
        }
        state.connected = connected;
        tracing::debug!(
            "Channel '{}' {}",
            self.channel,
            if connected { "connected" } else { "disconnected" }
        );
        for listener in &state.listeners {
            listener.on_connection_changed(connected);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn last_value(&self) -> Option<Value> {
        self.state.lock().last_value.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Swap the listener list in place.
    ///
    /// Listeners that were not attached before receive the current
    /// connection state and the last value, so they start in step with the
    /// ones already attached.
    pub fn replace_listeners(&self, listeners: Vec<Arc<dyn ChannelListener>>) {
        let mut state = self.state.lock();
        let is_new = |listener: &Arc<dyn ChannelListener>| {
            let ptr = Arc::as_ptr(listener) as *const ();
            !state
                .listeners
                .iter()
                .any(|old| Arc::as_ptr(old) as *const () == ptr)
        };
        let added: Vec<Arc<dyn ChannelListener>> =
            listeners.iter().filter(|&l| is_new(l)).cloned().collect();

        for listener in &added {
            if state.connected {
                listener.on_connection_changed(true);
            }
            if let Some(value) = &state.last_value {
                listener.on_value(value);
            }
        }
        state.listeners = listeners;
    }
}

impl fmt::Debug for ChannelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChannelTarget")
            .field("channel", &self.channel)
            .field("connected", &state.connected)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

/// Routes `<prefix><delimiter><name>` channels to the source named `prefix`.
///
/// Names without a delimiter go to the default source, if one is set.
pub struct CompositeDataSource {
    sources: HashMap<String, Arc<dyn DataSource>>,
    default_source: Option<String>,
    delimiter: String,
}

impl CompositeDataSource {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
            default_source: None,
            delimiter: "://".to_string(),
        }
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn with_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.register(source);
        self
    }

    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default_source = Some(name.into());
        self
    }

    pub fn register(&mut self, source: Arc<dyn DataSource>) {
        self.sources.insert(source.name().to_string(), source);
    }

    pub fn set_default_source(&mut self, name: Option<String>) {
        self.default_source = name;
    }

    pub fn default_source(&self) -> Option<&str> {
        self.default_source.as_deref()
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    pub fn source(&self, name: &str) -> Option<&Arc<dyn DataSource>> {
        self.sources.get(name)
    }

    pub fn source_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Source responsible for `channel` and the name that source knows it by
    pub fn resolve(&self, channel: &str) -> PvResult<(Arc<dyn DataSource>, String)> {
        self.resolve_with_default(channel, None)
    }

    /// Like [`CompositeDataSource::resolve`], sending unprefixed names to
    /// `default` instead of the configured default source when given
    pub fn resolve_with_default(
        &self,
        channel: &str,
        default: Option<&str>,
    ) -> PvResult<(Arc<dyn DataSource>, String)> {
        let (prefix, name) = match channel.split_once(self.delimiter.as_str()) {
            Some((prefix, name)) => (prefix.to_string(), name.to_string()),
            None => {
                let default = default.map(str::to_string).or_else(|| self.default_source.clone());
                let default = default.ok_or_else(|| {
                    PvError::Configuration(format!(
                        "Channel '{}' has no data source prefix and no default source is set",
                        channel
                    ))
                })?;
                (default, channel.to_string())
            }
        };
        let source = self
            .sources
            .get(&prefix)
            .cloned()
            .ok_or(PvError::UnknownDataSource(prefix))?;
        Ok((source, name))
    }
}

impl Default for CompositeDataSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompositeDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeDataSource")
            .field("sources", &self.source_names())
            .field("default_source", &self.default_source)
            .field("delimiter", &self.delimiter)
            .finish()
    }
}

impl DataSource for CompositeDataSource {
    fn name(&self) -> &str {
        "composite"
    }

    fn connect(&self, channel: &str, target: Arc<ChannelTarget>) {
        match self.resolve(channel) {
            Ok((source, name)) => source.connect(&name, target),
            Err(error) => target.write_error(error),
        }
    }

    fn disconnect(&self, channel: &str, target: &Arc<ChannelTarget>) {
        if let Ok((source, name)) = self.resolve(channel) {
            source.disconnect(&name, target);
        }
    }

    fn write(&self, channel: &str, value: Value, callback: WriteCallback) {
        match self.resolve(channel) {
            Ok((source, name)) => source.write(&name, value, callback),
            Err(error) => callback(Err(error)),
        }
    }
}
