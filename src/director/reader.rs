//! Reader director.

use super::scheduler::Scheduler;
use super::{
    panic_message, DirectorLifecycle, DirectorStats, ExpressionId, Notification, PvReadWriter,
    ReadListener, StatsCounters,
};
use crate::config::{NotifyPolicy, ReaderConfig};
use crate::context::PvContext;
use crate::datasource::{ChannelTarget, DataSource};
use crate::error::{PvError, PvResult};
use crate::expression::{DesiredRateExpression, EvalContext, ReadRecipe, ReadWriteExpression};
use crate::value::Value;
use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One channel connected on behalf of this reader
struct Connection {
    source: Arc<dyn DataSource>,
    /// Channel name as known by `source` (prefix stripped)
    source_channel: String,
    target: Arc<ChannelTarget>,
}

impl Connection {
    fn disconnect(self) {
        self.source.disconnect(&self.source_channel, &self.target);
    }
}

struct Subscription {
    id: ExpressionId,
    expression: DesiredRateExpression,
    listener: Arc<dyn ReadListener>,
    channels: Vec<String>,
    last_value: Option<Value>,
    last_connected: Option<bool>,
}

struct ReaderState {
    lifecycle: DirectorLifecycle,
    subscriptions: Vec<Subscription>,
    /// Recipe of the channels currently connected; empty while paused
    recipe: ReadRecipe,
    connections: HashMap<String, Connection>,
}

struct ReaderShared {
    name: String,
    config: ReaderConfig,
    context: Arc<PvContext>,
    state: Mutex<ReaderState>,
    /// Held while listeners run; `false` once closed. Reentrant so a
    /// listener can close its own reader.
    gate: ReentrantMutex<Cell<bool>>,
    stats: Arc<StatsCounters>,
    next_id: AtomicU64,
}

struct ReaderInner {
    shared: Arc<ReaderShared>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl Drop for ReaderInner {
    fn drop(&mut self) {
        close(&self.shared, &self.scheduler);
    }
}

/// Builder for [`PvReader`]
pub struct ReaderBuilder {
    context: Arc<PvContext>,
    config: ReaderConfig,
    name: String,
}

impl ReaderBuilder {
    pub fn config(mut self, config: ReaderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn period(mut self, period: Duration) -> Self {
        self.config = self.config.with_period(period);
        self
    }

    pub fn notify(mut self, policy: NotifyPolicy) -> Self {
        self.config.notify = policy;
        self
    }

    /// Data source for channels without a prefix
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.config.source = Some(source.into());
        self
    }

    /// Name used for the notification thread and in logs
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub(super) fn context(&self) -> &Arc<PvContext> {
        &self.context
    }

    pub(super) fn default_source(&self) -> Option<&str> {
        self.config.source.as_deref()
    }

    /// Build a reader for the read side of `expression` and a writer for
    /// its write side
    pub fn build_read_writer<L>(
        self,
        expression: ReadWriteExpression,
        listener: L,
    ) -> PvResult<PvReadWriter>
    where
        L: ReadListener + 'static,
    {
        PvReadWriter::build(self, expression, listener)
    }

    pub fn build(self) -> PvResult<PvReader> {
        self.config.validate()?;
        if let Some(source) = &self.config.source {
            if self.context.data_sources().source(source).is_none() {
                return Err(PvError::UnknownDataSource(source.clone()));
            }
        }

        let stats = Arc::new(StatsCounters::default());
        let shared = Arc::new(ReaderShared {
            name: self.name,
            config: self.config,
            context: self.context,
            state: Mutex::new(ReaderState {
                lifecycle: DirectorLifecycle::Idle,
                subscriptions: Vec::new(),
                recipe: ReadRecipe::empty(),
                connections: HashMap::new(),
            }),
            gate: ReentrantMutex::new(Cell::new(true)),
            stats: stats.clone(),
            next_id: AtomicU64::new(1),
        });

        let ticking = shared.clone();
        let scheduler = Scheduler::spawn(&shared.name, shared.config.period(), stats, move || {
            tick(&ticking)
        })?;

        tracing::info!(
            "Reader '{}' started (period {:?}, notify {})",
            shared.name,
            shared.config.period(),
            shared.config.notify
        );

        Ok(PvReader {
            inner: Arc::new(ReaderInner {
                shared,
                scheduler: Mutex::new(Some(scheduler)),
            }),
        })
    }
}

/// Reads a set of expressions at a fixed rate and notifies their listeners.
///
/// Cloning gives another handle to the same reader. The reader closes when
/// [`PvReader::close`] is called or the last handle is dropped; a listener
/// that holds a handle keeps its reader alive until it is closed explicitly.
///
/// ```ignore
/// let reader = PvReader::builder(context)
///     .period(Duration::from_millis(100))
///     .build()?;
/// let id = reader.add_expression(average_of(&channel("sim://noise")), |n: &Notification| {
///     println!("{} = {:?}", n.name, n.value);
/// })?;
/// ```
#[derive(Clone)]
pub struct PvReader {
    inner: Arc<ReaderInner>,
}

impl PvReader {
    pub fn builder(context: Arc<PvContext>) -> ReaderBuilder {
        ReaderBuilder {
            context,
            config: ReaderConfig::default(),
            name: "reader".to_string(),
        }
    }

    fn shared(&self) -> &ReaderShared {
        &self.inner.shared
    }

    pub fn name(&self) -> &str {
        &self.shared().name
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.shared().config
    }

    /// Start notifying `listener` with the value of `expression`.
    ///
    /// New channels are connected before this returns; channels already
    /// used by other expressions of this reader are shared, not reconnected.
    /// Fails without changing anything if a channel cannot be routed to a
    /// data source.
    pub fn add_expression<L>(&self, expression: DesiredRateExpression, listener: L) -> PvResult<ExpressionId>
    where
        L: ReadListener + 'static,
    {
        let shared = self.shared();
        let mut state = shared.state.lock();
        if state.lifecycle.is_closed() {
            return Err(PvError::Closed(format!("Reader '{}' is closed", shared.name)));
        }

        let id = ExpressionId(shared.next_id.fetch_add(1, Ordering::Relaxed));
        let channels = expression.channels().into_iter().collect();
        tracing::debug!("Reader '{}': adding {} '{}'", shared.name, id, expression.name());
        state.subscriptions.push(Subscription {
            id,
            expression,
            listener: Arc::new(listener),
            channels,
            last_value: None,
            last_connected: None,
        });

        if let Err(error) = reconfigure(shared, &mut state) {
            state.subscriptions.pop();
            return Err(error);
        }
        Ok(id)
    }

    /// Stop notifying an expression; channels nothing else reads are
    /// disconnected before this returns
    pub fn remove_expression(&self, id: ExpressionId) -> PvResult<()> {
        let shared = self.shared();
        let mut state = shared.state.lock();
        if state.lifecycle.is_closed() {
            return Err(PvError::Closed(format!("Reader '{}' is closed", shared.name)));
        }
        let position = state
            .subscriptions
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| {
                PvError::Configuration(format!("Reader '{}' has no expression {}", shared.name, id))
            })?;
        let removed = state.subscriptions.remove(position);
        tracing::debug!(
            "Reader '{}': removed {} '{}'",
            shared.name,
            id,
            removed.expression.name()
        );
        reconfigure(shared, &mut state)
    }

    /// Stop ticking and disconnect every channel
    pub fn pause(&self) -> PvResult<()> {
        let shared = self.shared();
        {
            let mut state = shared.state.lock();
            match state.lifecycle {
                DirectorLifecycle::Paused => return Ok(()),
                l if l.is_closed() => {
                    return Err(PvError::Closed(format!("Reader '{}' is closed", shared.name)))
                }
                _ => {}
            }
            state.lifecycle = DirectorLifecycle::Paused;
            let connections: Vec<Connection> =
                state.connections.drain().map(|(_, c)| c).collect();
            let recipe = std::mem::replace(&mut state.recipe, ReadRecipe::empty());
            for connection in connections {
                connection.disconnect();
            }
            for listener in recipe.channel_read_recipes().flat_map(|r| r.listeners.iter()) {
                listener.clear_pending();
            }
        }
        if let Some(scheduler) = self.inner.scheduler.lock().as_ref() {
            scheduler.pause();
        }
        tracing::info!("Reader '{}' paused", shared.name);
        Ok(())
    }

    /// Reconnect every channel and restart ticking
    pub fn resume(&self) -> PvResult<()> {
        let shared = self.shared();
        {
            let mut state = shared.state.lock();
            match state.lifecycle {
                DirectorLifecycle::Paused => {}
                l if l.is_closed() => {
                    return Err(PvError::Closed(format!("Reader '{}' is closed", shared.name)))
                }
                _ => return Ok(()),
            }
            state.lifecycle = DirectorLifecycle::Connecting;
            for subscription in state.subscriptions.iter_mut() {
                subscription.last_connected = None;
            }
            if let Err(error) = reconfigure(shared, &mut state) {
                state.lifecycle = DirectorLifecycle::Paused;
                return Err(error);
            }
        }
        if let Some(scheduler) = self.inner.scheduler.lock().as_ref() {
            scheduler.resume();
        }
        tracing::info!("Reader '{}' resumed", shared.name);
        Ok(())
    }

    /// Disconnect everything and stop the notification thread.
    ///
    /// Idempotent, callable from any thread including a listener. No
    /// listener is called after this returns.
    pub fn close(&self) {
        close(&self.inner.shared, &self.inner.scheduler);
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle() == DirectorLifecycle::Closed
    }

    pub fn lifecycle(&self) -> DirectorLifecycle {
        self.shared().state.lock().lifecycle
    }

    pub fn stats(&self) -> DirectorStats {
        let connected = self.connected_channels().len();
        self.shared().stats.snapshot(connected)
    }

    /// Channels whose data source currently reports a connection, sorted
    pub fn connected_channels(&self) -> Vec<String> {
        let state = self.shared().state.lock();
        let mut names: Vec<String> = state
            .connections
            .iter()
            .filter(|(_, c)| c.target.is_connected())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Recipe of the channels currently requested from data sources
    pub fn current_read_recipe(&self) -> ReadRecipe {
        self.shared().state.lock().recipe.clone()
    }

    /// Ids of the expressions currently read
    pub fn expressions(&self) -> Vec<ExpressionId> {
        let state = self.shared().state.lock();
        state.subscriptions.iter().map(|s| s.id).collect()
    }
}

impl std::fmt::Debug for PvReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PvReader")
            .field("name", &self.shared().name)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

/// Bring the connections in line with the current subscriptions.
///
/// Every new channel is routed before anything is connected, so a routing
/// failure leaves the reader as it was.
fn reconfigure(shared: &ReaderShared, state: &mut ReaderState) -> PvResult<()> {
    let previous = state.lifecycle;
    let recipe = ReadRecipe::build(state.subscriptions.iter().map(|s| &s.expression))?;
    let diff = recipe.diff(&state.recipe);

    let sources = shared.context.data_sources();
    let default_source = shared.config.source.as_deref();
    let routed = diff
        .to_connect
        .iter()
        .map(|name| {
            sources
                .resolve_with_default(name, default_source)
                .map(|(source, source_channel)| (name.clone(), source, source_channel))
        })
        .collect::<PvResult<Vec<_>>>()?;

    if previous == DirectorLifecycle::Paused {
        // Routing was checked; channels connect on resume
        return Ok(());
    }

    state.lifecycle = match previous {
        DirectorLifecycle::Idle => DirectorLifecycle::Connecting,
        DirectorLifecycle::Connecting => DirectorLifecycle::Connecting,
        _ => DirectorLifecycle::Reconfiguring,
    };
    tracing::debug!(
        "Reader '{}': connect {:?}, disconnect {:?}, keep {:?}",
        shared.name,
        diff.to_connect,
        diff.to_disconnect,
        diff.retained
    );

    for name in &diff.to_disconnect {
        if let Some(connection) = state.connections.remove(name) {
            connection.disconnect();
        }
    }

    for name in &diff.retained {
        if let (Some(connection), Some(channel_recipe)) =
            (state.connections.get(name), recipe.recipe_for(name))
        {
            connection
                .target
                .replace_listeners(channel_recipe.listeners.clone());
        }
    }

    for (name, source, source_channel) in routed {
        let listeners = recipe
            .recipe_for(&name)
            .map(|r| r.listeners.clone())
            .unwrap_or_default();
        let target = Arc::new(ChannelTarget::new(name.clone(), listeners));
        source.connect(&source_channel, target.clone());
        state.connections.insert(
            name,
            Connection {
                source,
                source_channel,
                target,
            },
        );
    }

    state.recipe = recipe;
    state.lifecycle = DirectorLifecycle::Running;
    Ok(())
}

fn close(shared: &ReaderShared, scheduler: &Mutex<Option<Scheduler>>) {
    {
        let gate = shared.gate.lock();
        gate.set(false);

        let connections: Vec<Connection> = {
            let mut state = shared.state.lock();
            if state.lifecycle == DirectorLifecycle::Closed {
                return;
            }
            state.lifecycle = DirectorLifecycle::Closing;
            state.subscriptions.clear();
            state.recipe = ReadRecipe::empty();
            state.connections.drain().map(|(_, c)| c).collect()
        };

        for connection in connections {
            connection.disconnect();
        }
        shared.state.lock().lifecycle = DirectorLifecycle::Closed;
    }

    // The gate is released first: the tick being waited for may need it
    if let Some(scheduler) = scheduler.lock().take() {
        scheduler.stop();
    }
    tracing::info!("Reader '{}' closed", shared.name);
}

struct Pending {
    listener: Arc<dyn ReadListener>,
    notification: Notification,
}

fn tick(shared: &ReaderShared) {
    let gate = shared.gate.lock();
    if !gate.get() {
        return;
    }

    let policy = shared.config.notify;
    let mut state = shared.state.lock();
    if state.lifecycle != DirectorLifecycle::Running {
        return;
    }
    StatsCounters::bump(&shared.stats.ticks);

    let connected: HashMap<&str, bool> = state
        .connections
        .iter()
        .map(|(name, c)| (name.as_str(), c.target.is_connected()))
        .collect();

    let mut ctx = EvalContext::new();
    let mut pending = Vec::new();
    let mut updates = Vec::new();
    for subscription in &state.subscriptions {
        ctx.reset_new_data();
        let result = catch_unwind(AssertUnwindSafe(|| ctx.evaluate(&subscription.expression)))
            .unwrap_or_else(|payload| {
                Err(PvError::Read(format!(
                    "Evaluation panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });
        let new_data = ctx.has_new_data();
        let all_connected = subscription
            .channels
            .iter()
            .all(|c| connected.get(c.as_str()).copied().unwrap_or(false));

        let (value, error) = match result {
            Ok(value) => (value, None),
            Err(error) => {
                StatsCounters::bump(&shared.stats.evaluation_errors);
                tracing::warn!(
                    "Reader '{}': {} '{}' failed: {}",
                    shared.name,
                    subscription.id,
                    subscription.expression.name(),
                    error
                );
                (None, Some(error))
            }
        };

        let connection_changed = subscription.last_connected != Some(all_connected);
        let notify = match policy {
            NotifyPolicy::Always => true,
            NotifyPolicy::OnChange => {
                error.is_some()
                    || connection_changed
                    || (new_data && value != subscription.last_value)
            }
        };
        if !notify {
            StatsCounters::bump(&shared.stats.skipped_notifications);
            continue;
        }

        updates.push((subscription.id, value.clone(), all_connected));
        pending.push(Pending {
            listener: subscription.listener.clone(),
            notification: Notification {
                expression: subscription.id,
                name: subscription.expression.name().to_string(),
                value,
                error,
                connected: all_connected,
                timestamp: Utc::now(),
            },
        });
    }
    drop(connected);

    for (id, value, all_connected) in updates {
        if let Some(subscription) = state.subscriptions.iter_mut().find(|s| s.id == id) {
            subscription.last_connected = Some(all_connected);
            // An error clears it, so the next good value is always a change
            subscription.last_value = value;
        }
    }
    drop(state);

    // Listeners run without the state lock so they may reconfigure or close
    for Pending {
        listener,
        notification,
    } in pending
    {
        if !gate.get() {
            break;
        }
        match catch_unwind(AssertUnwindSafe(|| listener.on_notify(&notification))) {
            Ok(()) => StatsCounters::bump(&shared.stats.notifications),
            Err(payload) => {
                StatsCounters::bump(&shared.stats.evaluation_errors);
                tracing::error!(
                    "Reader '{}': listener of '{}' panicked: {}",
                    shared.name,
                    notification.name,
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{CompositeDataSource, MockDataSource};
    use crate::expression::{average_of, channel, value_of};
    use crate::function::FunctionRegistry;

    fn context_with(source: MockDataSource) -> Arc<PvContext> {
        let sources = CompositeDataSource::new()
            .with_source(Arc::new(source))
            .with_default("mock");
        Arc::new(PvContext::new(sources, FunctionRegistry::new()))
    }

    fn reader(context: Arc<PvContext>) -> PvReader {
        PvReader::builder(context)
            .period(Duration::from_millis(10))
            .build()
            .unwrap()
    }

    #[test]
    fn test_shared_channel_is_connected_once() {
        let mut source = MockDataSource::new();
        source.expect_name().return_const("mock".to_string());
        source
            .expect_connect()
            .withf(|channel, _| channel == "A")
            .times(1)
            .return_const(());
        source.expect_disconnect().times(1).return_const(());

        let reader = reader(context_with(source));
        let a = channel("A");
        reader.add_expression(average_of(&a), |_: &Notification| {}).unwrap();
        reader.add_expression(value_of(&a), |_: &Notification| {}).unwrap();
        assert_eq!(reader.lifecycle(), DirectorLifecycle::Running);
        assert_eq!(reader.current_read_recipe().len(), 1);

        reader.close();
        reader.close();
        assert_eq!(reader.lifecycle(), DirectorLifecycle::Closed);
    }

    #[test]
    fn test_unknown_source_leaves_reader_unchanged() {
        let mut source = MockDataSource::new();
        source.expect_name().return_const("mock".to_string());
        source.expect_connect().times(0);

        let reader = reader(context_with(source));
        let result = reader.add_expression(value_of(&channel("nope://A")), |_: &Notification| {});
        assert!(matches!(result, Err(PvError::UnknownDataSource(_))));
        assert!(reader.expressions().is_empty());
        assert_eq!(reader.lifecycle(), DirectorLifecycle::Idle);
    }

    #[test]
    fn test_closed_reader_rejects_expressions() {
        let mut source = MockDataSource::new();
        source.expect_name().return_const("mock".to_string());
        let reader = reader(context_with(source));
        reader.close();
        let result = reader.add_expression(value_of(&channel("A")), |_: &Notification| {});
        assert!(matches!(result, Err(PvError::Closed(_))));
        assert!(reader.pause().is_err());
    }

    #[test]
    fn test_unknown_reader_source_is_rejected() {
        let mut source = MockDataSource::new();
        source.expect_name().return_const("mock".to_string());
        let result = PvReader::builder(context_with(source)).source("ca").build();
        assert!(matches!(result, Err(PvError::UnknownDataSource(_))));
    }

    #[test]
    fn test_remove_unknown_expression() {
        let mut source = MockDataSource::new();
        source.expect_name().return_const("mock".to_string());
        let reader = reader(context_with(source));
        assert!(matches!(
            reader.remove_expression(ExpressionId(42)),
            Err(PvError::Configuration(_))
        ));
    }
}
