//! Value envelope carried through the pipeline
//!
//! The expression graph is type-agnostic: every cache, collector and function
//! exchanges [`Value`]s. Individual functions check and convert the variants
//! they need and report mismatches as [`PvError::Read`].

use crate::error::{PvError, PvResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A value produced by a channel or computed by an expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Double(f64),
    Int(i64),
    Bool(bool),
    Text(String),
    DoubleArray(Vec<f64>),
    List(Vec<Value>),
    Statistics(Statistics),
    Table(Table),
}

impl Value {
    /// Short name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Double(_) => "double",
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Text(_) => "text",
            Value::DoubleArray(_) => "double array",
            Value::List(_) => "list",
            Value::Statistics(_) => "statistics",
            Value::Table(_) => "table",
        }
    }

    /// Numeric view of scalar values
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Statistics(stats) => Some(stats.mean),
            _ => None,
        }
    }

    /// Numeric view that fails with a read error naming the offending kind
    pub fn expect_f64(&self, what: &str) -> PvResult<f64> {
        self.as_f64().ok_or_else(|| {
            PvError::Read(format!("{} must be numeric (was {})", what, self.kind()))
        })
    }

    /// List view, used by the table and write-distribution combinators
    pub fn as_list(&self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) => Some(items.clone()),
            Value::DoubleArray(items) => Some(items.iter().map(|v| Value::Double(*v)).collect()),
            _ => None,
        }
    }

    /// Parse a JSON literal such as `3.5`, `"text"`, `true` or `[1, 2]`
    pub fn from_json_literal(literal: &str) -> PvResult<Value> {
        let json: serde_json::Value = serde_json::from_str(literal.trim())?;
        Self::from_json(&json).ok_or_else(|| {
            PvError::Serialization(format!("Unsupported initial value '{}'", literal))
        })
    }

    fn from_json(json: &serde_json::Value) -> Option<Value> {
        match json {
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) if !n.is_f64() => Some(Value::Int(i)),
                _ => n.as_f64().map(Value::Double),
            },
            serde_json::Value::String(s) => Some(Value::Text(s.clone())),
            serde_json::Value::Array(items) => {
                if items.iter().all(|i| i.is_number()) {
                    Some(Value::DoubleArray(
                        items.iter().filter_map(|i| i.as_f64()).collect(),
                    ))
                } else {
                    items
                        .iter()
                        .map(Self::from_json)
                        .collect::<Option<Vec<_>>>()
                        .map(Value::List)
                }
            }
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Double(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
            Value::DoubleArray(v) => write!(f, "{:?}", v),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Statistics(s) => write!(
                f,
                "mean={} stddev={} min={} max={} n={}",
                s.mean, s.std_dev, s.min, s.max, s.count
            ),
            Value::Table(t) => write!(f, "table({} columns, {} rows)", t.columns.len(), t.rows()),
        }
    }
}

/// Summary of the samples collected during one tick
///
/// `std_dev` is the population standard deviation (divides by `count`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl Statistics {
    /// Single-pass (Welford) reduction; `None` when there are no samples
    pub fn from_samples(samples: impl IntoIterator<Item = f64>) -> Option<Self> {
        let mut count = 0usize;
        let mut mean = 0.0;
        let mut m2 = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;

        for x in samples {
            count += 1;
            let delta = x - mean;
            mean += delta / count as f64;
            m2 += delta * (x - mean);
            min = min.min(x);
            max = max.max(x);
        }

        if count == 0 {
            return None;
        }

        Some(Self {
            mean,
            std_dev: (m2 / count as f64).sqrt(),
            min,
            max,
            count,
        })
    }
}

/// A named column of a [`Table`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

/// Column-oriented table; every column has the same length
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<Column>,
}

impl Table {
    /// Build a table, rejecting columns of different lengths
    pub fn new(columns: Vec<Column>) -> PvResult<Self> {
        if let Some(first) = columns.first() {
            let rows = first.values.len();
            if let Some(bad) = columns.iter().find(|c| c.values.len() != rows) {
                return Err(PvError::Configuration(format!(
                    "Column '{}' has {} rows, expected {} (as column '{}')",
                    bad.name,
                    bad.values.len(),
                    rows,
                    first.name
                )));
            }
        }
        Ok(Self { columns })
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.columns.first().map(|c| c.values.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_of_one_two_three() {
        let stats = Statistics::from_samples([1.0, 2.0, 3.0]).unwrap();
        assert_eq!(stats.mean, 2.0);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 3.0);
        assert_eq!(stats.count, 3);
        assert!((stats.std_dev - (2.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_statistics_empty() {
        assert!(Statistics::from_samples(std::iter::empty()).is_none());
    }

    #[test]
    fn test_json_literals() {
        assert_eq!(Value::from_json_literal("3.5").unwrap(), Value::Double(3.5));
        assert_eq!(Value::from_json_literal("7").unwrap(), Value::Int(7));
        assert_eq!(
            Value::from_json_literal("\"hi\"").unwrap(),
            Value::Text("hi".to_string())
        );
        assert_eq!(
            Value::from_json_literal("[1, 2.5]").unwrap(),
            Value::DoubleArray(vec![1.0, 2.5])
        );
        assert!(Value::from_json_literal("{").is_err());
    }

    #[test]
    fn test_table_rejects_mismatched_columns() {
        let result = Table::new(vec![
            Column {
                name: "a".into(),
                values: vec![1.0.into(), 2.0.into()],
            },
            Column {
                name: "b".into(),
                values: vec![1.0.into()],
            },
        ]);
        assert!(matches!(result, Err(PvError::Configuration(_))));
    }

    #[test]
    fn test_expect_f64_names_kind() {
        let err = Value::Text("x".into()).expect_f64("Argument").unwrap_err();
        assert!(err.to_string().contains("text"));
    }
}
