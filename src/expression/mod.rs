//! Expression graph: what to read and write, and how to combine it
//!
//! Expressions come in two layers:
//!
//! - [`SourceRateExpression`] - one channel at the rate its data source
//!   produces values.
//! - [`DesiredRateExpression`] - a node evaluated once per director tick.
//!   Leaf nodes wrap source-rate expressions with a collector or a
//!   [`ValueCache`](crate::cache::ValueCache) of their own; composite nodes
//!   apply a function to other desired-rate expressions.
//!
//! A [`ReadWriteExpression`] pairs a read side with a [`WriteExpression`]
//! for channels that are both monitored and set.
//!
//! Building an expression connects nothing. A director turns the graph into
//! a [`ReadRecipe`] and asks its data sources to connect the channels.
//!
//! ```text
//! channel("A") ──► queue_of ──► average_of ─┐
//!                                           ├─► combine(+) ──► listener
//! channel("B") ──► latest_value_of ─────────┘
//! ```
//!
//! Evaluation is pull based: the director asks the top-level node for its
//! value and each node asks its children through an [`EvalContext`], which
//! memoizes results so a node shared by several parents (a diamond) is
//! evaluated, and its collector drained, once per tick.

mod language;
mod recipe;

pub use language::*;
pub use recipe::{ChannelReadRecipe, ChannelWriteRecipe, ReadRecipe, RecipeDiff, WriteRecipe};

use crate::cache::ChannelListener;
use crate::error::PvResult;
use crate::value::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_EXPRESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-tick evaluation state.
#[derive(Debug, Default)]
pub struct EvalContext {
    new_data: bool,
    memo: HashMap<u64, (PvResult<Option<Value>>, bool)>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by functions whose inputs changed since the previous tick
    pub fn mark_new_data(&mut self) {
        self.new_data = true;
    }

    pub fn has_new_data(&self) -> bool {
        self.new_data
    }

    /// Forget the new-data flag before evaluating another top-level expression.
    /// Memoized results are kept for the rest of the tick.
    pub fn reset_new_data(&mut self) {
        self.new_data = false;
    }

    /// Evaluate a node, at most once per context
    pub fn evaluate(&mut self, expression: &DesiredRateExpression) -> PvResult<Option<Value>> {
        if let Some((result, fresh)) = self.memo.get(&expression.id()) {
            self.new_data |= *fresh;
            return result.clone();
        }

        let outer = std::mem::take(&mut self.new_data);
        let result = expression.function().read_value(self);
        let fresh = self.new_data;
        self.memo.insert(expression.id(), (result.clone(), fresh));
        self.new_data = outer || fresh;
        result
    }
}

/// Computes a node's value from buffered state.
///
/// `Ok(None)` means no value is available (nothing received yet, or an
/// aggregate over an empty tick); errors are values too and travel up to
/// the listener of the top-level expression.
pub trait ReadFunction: Send + Sync {
    fn read_value(&self, ctx: &mut EvalContext) -> PvResult<Option<Value>>;
}

/// A channel observed at the rate its data source produces values.
///
/// Holds no buffer itself: every desired-rate leaf built on it attaches its
/// own cache or collector, so two leaves never consume each other's updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRateExpression {
    channel: String,
}

impl SourceRateExpression {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// A listener that must be fed by a channel for a leaf node to work
#[derive(Clone)]
pub struct ChannelSubscription {
    pub channel: String,
    pub listener: Arc<dyn ChannelListener>,
}

/// Shape of a desired-rate node
#[derive(Clone)]
pub enum ExpressionNode {
    /// Collector (or cache) fed directly by one or more channels
    Leaf(Vec<ChannelSubscription>),
    /// Function of other desired-rate expressions
    Composite(Vec<DesiredRateExpression>),
}

struct DesiredInner {
    id: u64,
    name: String,
    function: Arc<dyn ReadFunction>,
    node: ExpressionNode,
}

/// A node evaluated at the director's rate. Cheap to clone; clones share
/// the same collectors.
#[derive(Clone)]
pub struct DesiredRateExpression {
    inner: Arc<DesiredInner>,
}

impl DesiredRateExpression {
    pub fn new(name: impl Into<String>, function: Arc<dyn ReadFunction>, node: ExpressionNode) -> Self {
        Self {
            inner: Arc::new(DesiredInner {
                id: NEXT_EXPRESSION_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                function,
                node,
            }),
        }
    }

    /// Identity of this node; clones share it
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Default name, e.g. `avg(A)`
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn function(&self) -> &Arc<dyn ReadFunction> {
        &self.inner.function
    }

    pub fn node(&self) -> &ExpressionNode {
        &self.inner.node
    }

    /// Every channel this expression depends on, transitively
    pub fn channels(&self) -> BTreeSet<String> {
        ReadRecipe::from_expressions([self]).channel_names()
    }

    /// Evaluate with a fresh context (tests and one-off reads)
    pub fn evaluate(&self) -> PvResult<Option<Value>> {
        EvalContext::new().evaluate(self)
    }
}

impl fmt::Debug for DesiredRateExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesiredRateExpression")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

/// Splits a value written by a consumer into per-channel writes
pub trait WriteFunction: Send + Sync {
    fn plan(&self, value: Value) -> PvResult<Vec<(String, Value)>>;
}

/// Where and how a writer delivers values
#[derive(Clone)]
pub struct WriteExpression {
    name: String,
    channels: Vec<String>,
    function: Arc<dyn WriteFunction>,
}

impl WriteExpression {
    pub fn new(name: impl Into<String>, channels: Vec<String>, function: Arc<dyn WriteFunction>) -> Self {
        Self {
            name: name.into(),
            channels,
            function,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn function(&self) -> &Arc<dyn WriteFunction> {
        &self.function
    }
}

impl fmt::Debug for WriteExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteExpression")
            .field("name", &self.name)
            .field("channels", &self.channels)
            .finish()
    }
}

/// A read side and a write side used together, usually over the same
/// channels. Either half can be handed to a reader or writer on its own.
#[derive(Clone, Debug)]
pub struct ReadWriteExpression {
    read: DesiredRateExpression,
    write: WriteExpression,
}

impl ReadWriteExpression {
    pub fn new(read: DesiredRateExpression, write: WriteExpression) -> Self {
        Self { read, write }
    }

    /// Name of the read side
    pub fn name(&self) -> &str {
        self.read.name()
    }

    pub fn read_expression(&self) -> &DesiredRateExpression {
        &self.read
    }

    pub fn write_expression(&self) -> &WriteExpression {
        &self.write
    }

    pub fn into_parts(self) -> (DesiredRateExpression, WriteExpression) {
        (self.read, self.write)
    }
}
