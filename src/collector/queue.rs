//! Unbounded FIFO collector.

use crate::cache::ChannelListener;
use crate::error::{PvError, PvResult};
use crate::expression::{EvalContext, ReadFunction};
use crate::value::Value;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct QueueState {
    samples: Vec<Value>,
    error: Option<PvError>,
}

/// Keeps every sample collected since the last read.
///
/// The queue is not bounded: the reader's tick period decides how much it
/// holds, so a queue whose director is paused or slow grows until read.
#[derive(Debug, Default)]
pub struct QueueCollector {
    state: Mutex<QueueState>,
}

impl QueueCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample (producer side)
    pub fn collect(&self, sample: Value) {
        self.state.lock().samples.push(sample);
    }

    /// Record a channel fault to be reported by the next read
    pub fn collect_error(&self, error: PvError) {
        self.state.lock().error = Some(error);
    }

    /// Drain all samples in submission order.
    ///
    /// A pending fault is returned instead and the samples stay queued for
    /// the following read, so none is lost.
    pub fn read(&self) -> PvResult<Vec<Value>> {
        let mut state = self.state.lock();
        if let Some(error) = state.error.take() {
            return Err(error);
        }
        Ok(std::mem::take(&mut state.samples))
    }

    /// Discard queued samples and any pending fault
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.samples.clear();
        state.error = None;
    }

    /// Number of samples waiting to be read
    pub fn len(&self) -> usize {
        self.state.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChannelListener for QueueCollector {
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

impl ReadFunction for QueueCollector {
    fn read_value(&self, ctx: &mut EvalContext) -> PvResult<Option<Value>> {
        let samples = self.read()?;
        if !samples.is_empty() {
            ctx.mark_new_data();
        }
        Ok(Some(Value::List(samples)))
    }
}
