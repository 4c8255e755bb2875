//! Operators that build expressions.
//!
//! ```ignore
//! use pvmonitor_rs::expression::*;
//!
//! let a = channel("sim://sine(0, 10, 20, 0.01)");
//! let b = channel("loc://setpoint(5.0)");
//! let error = combine(&average_of(&a), &latest_value_of(&b), "-", |x, y| {
//!     Ok(Value::Double(x.expect_f64("x")? - y.expect_f64("y")?))
//! });
//! ```

use super::{
    ChannelSubscription, DesiredRateExpression, EvalContext, ExpressionNode, ReadFunction,
    ReadWriteExpression, SourceRateExpression, WriteExpression, WriteFunction,
};
use crate::cache::ValueCache;
use crate::collector::{
    Average, Clock, LastValue, MonotonicClock, QueueCollector, StatisticsOf, TimedWindowCollector,
};
use crate::error::{PvError, PvResult};
use crate::function::FunctionRegistry;
use crate::value::{Column, Table, Value};
use std::sync::Arc;
use std::time::Duration;

/// A channel read at the source rate.
pub fn channel(name: impl Into<String>) -> SourceRateExpression {
    SourceRateExpression::new(name)
}

fn leaf(
    name: impl Into<String>,
    source: &SourceRateExpression,
    function: Arc<dyn ReadFunction>,
    listener: Arc<dyn crate::cache::ChannelListener>,
) -> DesiredRateExpression {
    DesiredRateExpression::new(
        name,
        function,
        ExpressionNode::Leaf(vec![ChannelSubscription {
            channel: source.channel().to_string(),
            listener,
        }]),
    )
}

struct CacheFunction {
    cache: Arc<ValueCache<Value>>,
}

impl ReadFunction for CacheFunction {
    fn read_value(&self, ctx: &mut EvalContext) -> PvResult<Option<Value>> {
        let snapshot = self.cache.read_and_clear_dirty();
        if snapshot.updated {
            ctx.mark_new_data();
        }
        match snapshot.error {
            Some(error) => Err(error),
            None => Ok(snapshot.value),
        }
    }
}

/// The newest value of a channel, from a cache owned by this leaf.
pub fn value_of(source: &SourceRateExpression) -> DesiredRateExpression {
    let cache = Arc::new(ValueCache::new());
    leaf(
        source.channel(),
        source,
        Arc::new(CacheFunction {
            cache: cache.clone(),
        }),
        cache,
    )
}

/// Every value received since the previous tick, as a list.
pub fn queue_of(source: &SourceRateExpression) -> DesiredRateExpression {
    let queue = Arc::new(QueueCollector::new());
    leaf(
        format!("queue({})", source.channel()),
        source,
        queue.clone(),
        queue,
    )
}

/// Values received during the last `max_age`, as a list.
pub fn timed_window_of(source: &SourceRateExpression, max_age: Duration) -> DesiredRateExpression {
    timed_window_of_with_clock(source, max_age, Arc::new(MonotonicClock::new()))
}

/// [`timed_window_of`] with an explicit clock.
pub fn timed_window_of_with_clock(
    source: &SourceRateExpression,
    max_age: Duration,
    clock: Arc<dyn Clock>,
) -> DesiredRateExpression {
    let window = Arc::new(TimedWindowCollector::new(max_age, clock));
    leaf(
        format!("window({}, {}ms)", source.channel(), max_age.as_millis()),
        source,
        window.clone(),
        window,
    )
}

/// The newest value received, at the desired rate.
pub fn latest_value_of(source: &SourceRateExpression) -> DesiredRateExpression {
    let queue = Arc::new(QueueCollector::new());
    leaf(
        source.channel(),
        source,
        Arc::new(LastValue::new(queue.clone())),
        queue,
    )
}

/// Mean of the values received during each tick.
pub fn average_of(source: &SourceRateExpression) -> DesiredRateExpression {
    let queue = Arc::new(QueueCollector::new());
    leaf(
        format!("avg({})", source.channel()),
        source,
        Arc::new(Average::new(queue.clone())),
        queue,
    )
}

/// Mean, standard deviation, min, max and count of each tick's values.
pub fn statistics_of(source: &SourceRateExpression) -> DesiredRateExpression {
    let queue = Arc::new(QueueCollector::new());
    leaf(
        format!("stats({})", source.channel()),
        source,
        Arc::new(StatisticsOf::new(queue.clone())),
        queue,
    )
}

type CombineFn = dyn Fn(&[Value]) -> PvResult<Value> + Send + Sync;

struct CombinedFunction {
    args: Vec<DesiredRateExpression>,
    function: Box<CombineFn>,
}

impl ReadFunction for CombinedFunction {
    fn read_value(&self, ctx: &mut EvalContext) -> PvResult<Option<Value>> {
        // Every argument is evaluated, even after a failure, so each
        // collector is drained once per tick.
        let results: Vec<_> = self.args.iter().map(|arg| ctx.evaluate(arg)).collect();

        let mut values = Vec::with_capacity(results.len());
        for result in results {
            match result? {
                Some(value) => values.push(value),
                None => return Ok(None),
            }
        }
        (self.function)(&values).map(Some)
    }
}

/// A user function of any number of desired-rate expressions.
///
/// The result is absent whenever one of the arguments is absent; an error
/// in any argument becomes the result's error.
pub fn result_of<F>(
    name: impl Into<String>,
    args: &[DesiredRateExpression],
    function: F,
) -> PvResult<DesiredRateExpression>
where
    F: Fn(&[Value]) -> PvResult<Value> + Send + Sync + 'static,
{
    let name = name.into();
    if args.is_empty() {
        return Err(PvError::Configuration(format!(
            "Function '{}' needs at least one argument",
            name
        )));
    }
    let label = format!(
        "{}({})",
        name,
        args.iter().map(|a| a.name()).collect::<Vec<_>>().join(", ")
    );
    Ok(DesiredRateExpression::new(
        label,
        Arc::new(CombinedFunction {
            args: args.to_vec(),
            function: Box::new(function),
        }),
        ExpressionNode::Composite(args.to_vec()),
    ))
}

/// A one-argument user function.
pub fn map<F>(arg: &DesiredRateExpression, name: &str, function: F) -> DesiredRateExpression
where
    F: Fn(&Value) -> PvResult<Value> + Send + Sync + 'static,
{
    let label = format!("{}({})", name, arg.name());
    DesiredRateExpression::new(
        label,
        Arc::new(CombinedFunction {
            args: vec![arg.clone()],
            function: Box::new(move |values: &[Value]| function(&values[0])),
        }),
        ExpressionNode::Composite(vec![arg.clone()]),
    )
}

/// A two-argument user function.
pub fn combine<F>(
    first: &DesiredRateExpression,
    second: &DesiredRateExpression,
    name: &str,
    function: F,
) -> DesiredRateExpression
where
    F: Fn(&Value, &Value) -> PvResult<Value> + Send + Sync + 'static,
{
    let label = format!("{}({}, {})", name, first.name(), second.name());
    let args = vec![first.clone(), second.clone()];
    DesiredRateExpression::new(
        label,
        Arc::new(CombinedFunction {
            args: args.clone(),
            function: Box::new(move |values: &[Value]| function(&values[0], &values[1])),
        }),
        ExpressionNode::Composite(args),
    )
}

/// The values of several expressions as one list.
pub fn list_of(items: &[DesiredRateExpression]) -> PvResult<DesiredRateExpression> {
    result_of("list", items, |values| Ok(Value::List(values.to_vec())))
}

/// A table whose columns are list-valued expressions.
///
/// Column lengths are only known once data arrives, so a mismatch is
/// reported by the evaluation, as a configuration error.
pub fn table_of(columns: &[(&str, DesiredRateExpression)]) -> PvResult<DesiredRateExpression> {
    let names: Vec<String> = columns.iter().map(|(n, _)| n.to_string()).collect();
    let args: Vec<DesiredRateExpression> = columns.iter().map(|(_, e)| e.clone()).collect();
    result_of("table", &args, move |values| {
        let columns = names
            .iter()
            .zip(values)
            .map(|(name, value)| {
                let values = value.as_list().ok_or_else(|| {
                    PvError::Read(format!(
                        "Column '{}' must be a list (was {})",
                        name,
                        value.kind()
                    ))
                })?;
                Ok(Column {
                    name: name.clone(),
                    values,
                })
            })
            .collect::<PvResult<Vec<_>>>()?;
        Table::new(columns).map(Value::Table)
    })
}

/// A registry function applied to the given arguments.
pub fn formula(
    registry: &FunctionRegistry,
    name: &str,
    args: &[DesiredRateExpression],
) -> PvResult<DesiredRateExpression> {
    let function = registry.lookup(name, args.len())?;
    result_of(name, args, move |values| function.call(values))
}

struct SingleChannelWrite {
    channel: String,
}

impl WriteFunction for SingleChannelWrite {
    fn plan(&self, value: Value) -> PvResult<Vec<(String, Value)>> {
        Ok(vec![(self.channel.clone(), value)])
    }
}

struct DistributedWrite {
    channels: Vec<String>,
}

impl WriteFunction for DistributedWrite {
    fn plan(&self, value: Value) -> PvResult<Vec<(String, Value)>> {
        let items = value.as_list().ok_or_else(|| {
            PvError::Configuration(format!(
                "Writing {} channels needs a list (was {})",
                self.channels.len(),
                value.kind()
            ))
        })?;
        if items.len() != self.channels.len() {
            return Err(PvError::Configuration(format!(
                "Writing {} channels needs {} values (got {})",
                self.channels.len(),
                self.channels.len(),
                items.len()
            )));
        }
        Ok(self.channels.iter().cloned().zip(items).collect())
    }
}

/// A channel that receives every value written.
pub fn channel_for_write(name: impl Into<String>) -> WriteExpression {
    let name = name.into();
    WriteExpression::new(
        name.clone(),
        vec![name.clone()],
        Arc::new(SingleChannelWrite { channel: name }),
    )
}

/// Several channels written together; the value must be a list with one
/// element per channel.
pub fn channels_for_write(names: &[&str]) -> PvResult<WriteExpression> {
    if names.is_empty() {
        return Err(PvError::Configuration(
            "A write expression needs at least one channel".to_string(),
        ));
    }
    let channels: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    Ok(WriteExpression::new(
        format!("[{}]", channels.join(", ")),
        channels.clone(),
        Arc::new(DistributedWrite { channels }),
    ))
}

/// Each element of a list value goes to the matching write expression
struct ListWrite {
    parts: Vec<WriteExpression>,
}

impl WriteFunction for ListWrite {
    fn plan(&self, value: Value) -> PvResult<Vec<(String, Value)>> {
        let items = value.as_list().ok_or_else(|| {
            PvError::Configuration(format!(
                "Writing {} expressions needs a list (was {})",
                self.parts.len(),
                value.kind()
            ))
        })?;
        if items.len() != self.parts.len() {
            return Err(PvError::Configuration(format!(
                "Writing {} expressions needs {} values (got {})",
                self.parts.len(),
                self.parts.len(),
                items.len()
            )));
        }
        let mut plan = Vec::new();
        for (part, item) in self.parts.iter().zip(items) {
            plan.extend(part.function().plan(item)?);
        }
        Ok(plan)
    }
}

/// Several write expressions written together; the value must be a list
/// with one element per expression.
pub fn write_list_of(items: &[WriteExpression]) -> PvResult<WriteExpression> {
    if items.is_empty() {
        return Err(PvError::Configuration(
            "A write list needs at least one expression".to_string(),
        ));
    }
    let names: Vec<&str> = items.iter().map(|e| e.name()).collect();
    let mut channels: Vec<String> = Vec::new();
    for channel in items.iter().flat_map(|e| e.channels()) {
        if !channels.contains(channel) {
            channels.push(channel.clone());
        }
    }
    Ok(WriteExpression::new(
        format!("[{}]", names.join(", ")),
        channels,
        Arc::new(ListWrite {
            parts: items.to_vec(),
        }),
    ))
}

/// A channel that is both read, through its own cache, and written.
pub fn channel_read_write(name: impl Into<String>) -> ReadWriteExpression {
    let name = name.into();
    ReadWriteExpression::new(value_of(&channel(name.clone())), channel_for_write(name))
}

/// Read-write expressions combined: the read side is a [`list_of`] the
/// reads and the write side a [`write_list_of`] the writes.
pub fn read_write_list_of(items: &[ReadWriteExpression]) -> PvResult<ReadWriteExpression> {
    let reads: Vec<DesiredRateExpression> =
        items.iter().map(|e| e.read_expression().clone()).collect();
    let writes: Vec<WriteExpression> = items.iter().map(|e| e.write_expression().clone()).collect();
    Ok(ReadWriteExpression::new(list_of(&reads)?, write_list_of(&writes)?))
}
