//! Reductions composed on top of a [`QueueCollector`].

use super::QueueCollector;
use crate::error::PvResult;
use crate::expression::{EvalContext, ReadFunction};
use crate::value::{Statistics, Value};
use parking_lot::Mutex;
use std::sync::Arc;

/// Newest sample of a queue.
///
/// Between ticks without new samples the previous value is returned again,
/// but the tick is not flagged as carrying new data.
#[derive(Debug)]
pub struct LastValue {
    queue: Arc<QueueCollector>,
    last: Mutex<Option<Value>>,
}

impl LastValue {
    pub fn new(queue: Arc<QueueCollector>) -> Self {
        Self {
            queue,
            last: Mutex::new(None),
        }
    }
}

impl ReadFunction for LastValue {
    fn read_value(&self, ctx: &mut EvalContext) -> PvResult<Option<Value>> {
        let mut samples = self.queue.read()?;
        let mut last = self.last.lock();
        if let Some(newest) = samples.pop() {
            ctx.mark_new_data();
            *last = Some(newest);
        }
        Ok(last.clone())
    }
}

fn numeric_samples(samples: &[Value]) -> PvResult<Vec<f64>> {
    samples.iter().map(|s| s.expect_f64("Averaged sample")).collect()
}

/// Mean of the samples queued since the previous tick
#[derive(Debug)]
pub struct Average {
    queue: Arc<QueueCollector>,
}

impl Average {
    pub fn new(queue: Arc<QueueCollector>) -> Self {
        Self { queue }
    }
}

impl ReadFunction for Average {
    fn read_value(&self, ctx: &mut EvalContext) -> PvResult<Option<Value>> {
        let samples = self.queue.read()?;
        if samples.is_empty() {
            return Ok(None);
        }
        ctx.mark_new_data();
        let numbers = numeric_samples(&samples)?;
        Ok(Statistics::from_samples(numbers).map(|s| Value::Double(s.mean)))
    }
}

/// Full [`Statistics`] of the samples queued since the previous tick
#[derive(Debug)]
pub struct StatisticsOf {
    queue: Arc<QueueCollector>,
}

impl StatisticsOf {
    pub fn new(queue: Arc<QueueCollector>) -> Self {
        Self { queue }
    }
}

impl ReadFunction for StatisticsOf {
    fn read_value(&self, ctx: &mut EvalContext) -> PvResult<Option<Value>> {
        let samples = self.queue.read()?;
        if samples.is_empty() {
            return Ok(None);
        }
        ctx.mark_new_data();
        let numbers = numeric_samples(&samples)?;
        Ok(Statistics::from_samples(numbers).map(Value::Statistics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PvError;

    fn queue_with(values: &[f64]) -> Arc<QueueCollector> {
        let queue = Arc::new(QueueCollector::new());
        for v in values {
            queue.collect(Value::Double(*v));
        }
        queue
    }

    #[test]
    fn test_average_of_one_two_three() {
        let avg = Average::new(queue_with(&[1.0, 2.0, 3.0]));
        let mut ctx = EvalContext::new();
        assert_eq!(avg.read_value(&mut ctx).unwrap(), Some(Value::Double(2.0)));
        assert!(ctx.has_new_data());
    }

    #[test]
    fn test_average_empty_is_no_value() {
        let avg = Average::new(queue_with(&[]));
        let mut ctx = EvalContext::new();
        assert_eq!(avg.read_value(&mut ctx).unwrap(), None);
        assert!(!ctx.has_new_data());
    }

    #[test]
    fn test_statistics_of_one_two_three() {
        let stats = StatisticsOf::new(queue_with(&[1.0, 2.0, 3.0]));
        let mut ctx = EvalContext::new();
        match stats.read_value(&mut ctx).unwrap() {
            Some(Value::Statistics(s)) => {
                assert_eq!(s.mean, 2.0);
                assert_eq!(s.min, 1.0);
                assert_eq!(s.max, 3.0);
                assert_eq!(s.count, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_average_rejects_text() {
        let queue = Arc::new(QueueCollector::new());
        queue.collect(Value::Text("oops".into()));
        let avg = Average::new(queue);
        let err = avg.read_value(&mut EvalContext::new()).unwrap_err();
        assert!(matches!(err, PvError::Read(_)));
    }

    #[test]
    fn test_last_value_keeps_previous() {
        let queue = queue_with(&[1.0, 2.0]);
        let last = LastValue::new(queue.clone());

        let mut ctx = EvalContext::new();
        assert_eq!(last.read_value(&mut ctx).unwrap(), Some(Value::Double(2.0)));
        assert!(ctx.has_new_data());

        let mut ctx = EvalContext::new();
        assert_eq!(last.read_value(&mut ctx).unwrap(), Some(Value::Double(2.0)));
        assert!(!ctx.has_new_data());

        queue.collect(Value::Double(9.0));
        assert_eq!(
            last.read_value(&mut EvalContext::new()).unwrap(),
            Some(Value::Double(9.0))
        );
    }
}
