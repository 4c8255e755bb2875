//! Writer director.

use super::DirectorLifecycle;
use crate::context::PvContext;
use crate::datasource::DataSource;
use crate::error::{PvError, PvResult};
use crate::expression::{WriteExpression, WriteRecipe};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Route {
    source: Arc<dyn DataSource>,
    source_channel: String,
    /// Whether `connect_write` succeeded and still needs releasing
    connected: bool,
}

type Completion = Box<dyn FnOnce(PvResult<()>) + Send>;

/// Joins the per-channel callbacks of one write into a single completion
struct WriteTracker {
    remaining: AtomicUsize,
    first_error: Mutex<Option<PvError>>,
    callback: Mutex<Option<Completion>>,
}

impl WriteTracker {
    fn new(parts: usize, callback: Completion) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(parts),
            first_error: Mutex::new(None),
            callback: Mutex::new(Some(callback)),
        })
    }

    fn complete(&self, result: PvResult<()>) {
        if let Err(error) = result {
            self.first_error.lock().get_or_insert(error);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let outcome = match self.first_error.lock().take() {
                Some(error) => Err(error),
                None => Ok(()),
            };
            if let Some(callback) = self.callback.lock().take() {
                callback(outcome);
            }
        }
    }
}

/// Writes values to the channels of a [`WriteExpression`].
///
/// Channels are routed to their data sources when the writer is created, so
/// an unknown source fails early, and each channel is then opened with
/// [`DataSource::connect_write`]. A channel the source refuses stays routed
/// and its writes fail. Closing, or dropping the last handle, releases every
/// opened channel once.
///
/// A multi-channel write completes once every channel write has completed;
/// the first failure is reported.
#[derive(Clone)]
pub struct PvWriter {
    inner: Arc<WriterInner>,
}

struct WriterInner {
    expression: WriteExpression,
    recipe: WriteRecipe,
    routes: Mutex<HashMap<String, Route>>,
    lifecycle: Mutex<DirectorLifecycle>,
}

impl WriterInner {
    /// Release every opened channel; later calls find nothing to release
    fn disconnect_all(&self) {
        for (channel, route) in self.routes.lock().iter_mut() {
            if std::mem::take(&mut route.connected) {
                route.source.disconnect_write(&route.source_channel);
                tracing::debug!("Writer '{}' released '{}'", self.expression.name(), channel);
            }
        }
    }
}

impl Drop for WriterInner {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

impl PvWriter {
    pub fn new(context: &PvContext, expression: WriteExpression) -> PvResult<Self> {
        Self::with_default_source(context, expression, None)
    }

    /// Like [`PvWriter::new`], routing unprefixed channels to `source`
    pub fn with_default_source(
        context: &PvContext,
        expression: WriteExpression,
        source: Option<&str>,
    ) -> PvResult<Self> {
        let recipe = WriteRecipe::build(&expression)?;
        let mut routes = HashMap::new();
        for channel in recipe.channel_write_recipes() {
            let (source, source_channel) = context
                .data_sources()
                .resolve_with_default(&channel.channel_name, source)?;
            routes.insert(
                channel.channel_name.clone(),
                Route {
                    source,
                    source_channel,
                    connected: false,
                },
            );
        }

        // Every channel is routed before any is opened
        for (channel, route) in routes.iter_mut() {
            match route.source.connect_write(&route.source_channel) {
                Ok(()) => route.connected = true,
                Err(error) => tracing::warn!(
                    "Writer '{}' could not open '{}': {}",
                    expression.name(),
                    channel,
                    error
                ),
            }
        }
        tracing::info!("Writer '{}' ready ({} channels)", expression.name(), routes.len());
        Ok(Self {
            inner: Arc::new(WriterInner {
                expression,
                recipe,
                routes: Mutex::new(routes),
                lifecycle: Mutex::new(DirectorLifecycle::Running),
            }),
        })
    }

    pub fn name(&self) -> &str {
        self.inner.expression.name()
    }

    pub fn recipe(&self) -> &WriteRecipe {
        &self.inner.recipe
    }

    pub fn lifecycle(&self) -> DirectorLifecycle {
        *self.inner.lifecycle.lock()
    }

    /// Channels currently open for writing, sorted
    pub fn connected_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .inner
            .routes
            .lock()
            .iter()
            .filter(|(_, route)| route.connected)
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels
    }

    /// Write `value`; `callback` runs once, possibly on a data-source thread
    pub fn write<F>(&self, value: Value, callback: F)
    where
        F: FnOnce(PvResult<()>) + Send + 'static,
    {
        if self.lifecycle().is_closed() {
            callback(Err(PvError::Closed(format!(
                "Writer '{}' is closed",
                self.name()
            ))));
            return;
        }

        let plan = match self.inner.expression.function().plan(value) {
            Ok(plan) => plan,
            Err(error) => {
                callback(Err(error));
                return;
            }
        };
        if plan.is_empty() {
            callback(Ok(()));
            return;
        }

        let tracker = WriteTracker::new(plan.len(), Box::new(callback));
        for (channel, value) in plan {
            let tracker = tracker.clone();
            let route = self
                .inner
                .routes
                .lock()
                .get(&channel)
                .map(|route| (route.source.clone(), route.source_channel.clone()));
            match route {
                Some((source, source_channel)) => {
                    tracing::debug!("Writer '{}': {} <- {}", self.name(), channel, value);
                    // Outside the routes lock: the callback may run synchronously
                    source.write(
                        &source_channel,
                        value,
                        Box::new(move |result| tracker.complete(result)),
                    );
                }
                None => tracker.complete(Err(PvError::write(
                    channel,
                    "Channel is not part of this writer",
                ))),
            }
        }
    }

    /// Write and wait for completion
    pub fn write_blocking(&self, value: Value, timeout: Duration) -> PvResult<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.write(value, move |result| {
            let _ = tx.send(result);
        });
        rx.recv_timeout(timeout).map_err(|_| {
            PvError::Timeout(format!(
                "Write to '{}' did not complete within {:?}",
                self.name(),
                timeout
            ))
        })?
    }

    /// Reject further writes and release the write channels. Idempotent.
    pub fn close(&self) {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if *lifecycle == DirectorLifecycle::Closed {
                return;
            }
            *lifecycle = DirectorLifecycle::Closed;
        }
        self.inner.disconnect_all();
        tracing::info!("Writer '{}' closed", self.inner.expression.name());
    }
}

impl fmt::Debug for PvWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PvWriter")
            .field("name", &self.name())
            .field("channels", &self.inner.recipe.channel_names())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}
