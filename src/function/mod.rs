//! Formula function registry
//!
//! Functions usable by [`formula`](crate::expression::formula) are looked up
//! by name and arity in a [`FunctionRegistry`]. Registries are filled
//! explicitly, one [`FunctionSet`] at a time; there is no process-wide
//! default instance.
//!
//! ```ignore
//! let mut registry = FunctionRegistry::new();
//! registry.register_set(numeric_operators());
//! registry.register_set(math_functions());
//! registry.register(FormulaFunction::script("scale", &["x", "k"], "x * k")?);
//! ```

mod script;

pub use script::ScriptFunction;

use crate::error::{PvError, PvResult};
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Signature shared by every formula function
pub type FormulaFn = dyn Fn(&[Value]) -> PvResult<Value> + Send + Sync;

/// A named function of a fixed number of arguments
#[derive(Clone)]
pub struct FormulaFunction {
    name: String,
    description: String,
    arg_names: Vec<String>,
    function: Arc<FormulaFn>,
}

impl FormulaFunction {
    pub fn new<F>(name: &str, description: &str, arg_names: &[&str], function: F) -> Self
    where
        F: Fn(&[Value]) -> PvResult<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            arg_names: arg_names.iter().map(|a| a.to_string()).collect(),
            function: Arc::new(function),
        }
    }

    /// A function whose body is a Rhai expression over its named arguments
    pub fn script(name: &str, arg_names: &[&str], source: &str) -> PvResult<Self> {
        let script = ScriptFunction::compile(name, arg_names, source)?;
        Ok(Self::new(
            name,
            &format!("Script: {}", source),
            arg_names,
            move |args| script.call(args),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn arg_names(&self) -> &[String] {
        &self.arg_names
    }

    pub fn arity(&self) -> usize {
        self.arg_names.len()
    }

    pub fn call(&self, args: &[Value]) -> PvResult<Value> {
        if args.len() != self.arity() {
            return Err(PvError::UnknownFunction {
                name: self.name.clone(),
                arity: args.len(),
            });
        }
        (self.function)(args)
    }
}

impl fmt::Debug for FormulaFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormulaFunction")
            .field("name", &self.name)
            .field("arg_names", &self.arg_names)
            .finish()
    }
}

/// A group of functions registered together
#[derive(Debug, Clone, Default)]
pub struct FunctionSet {
    name: String,
    functions: Vec<FormulaFunction>,
}

impl FunctionSet {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            functions: Vec::new(),
        }
    }

    pub fn with(mut self, function: FormulaFunction) -> Self {
        self.functions.push(function);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn functions(&self) -> &[FormulaFunction] {
        &self.functions
    }
}

/// Name and arity to function lookup
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Vec<FormulaFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the numeric operators and the math functions
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_set(numeric_operators());
        registry.register_set(math_functions());
        registry
    }

    /// Add a function; a previous one with the same name and arity is replaced
    pub fn register(&mut self, function: FormulaFunction) {
        let overloads = self.functions.entry(function.name.clone()).or_default();
        overloads.retain(|f| f.arity() != function.arity());
        overloads.push(function);
    }

    pub fn register_set(&mut self, set: FunctionSet) {
        tracing::debug!(
            "Registering function set '{}' ({} functions)",
            set.name,
            set.functions.len()
        );
        for function in set.functions {
            self.register(function);
        }
    }

    pub fn lookup(&self, name: &str, arity: usize) -> PvResult<FormulaFunction> {
        self.functions
            .get(name)
            .and_then(|overloads| overloads.iter().find(|f| f.arity() == arity))
            .cloned()
            .ok_or_else(|| PvError::UnknownFunction {
                name: name.to_string(),
                arity,
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn binary_numeric(
    name: &str,
    description: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> FormulaFunction {
    let label = name.to_string();
    FormulaFunction::new(name, description, &["left", "right"], move |args| {
        match (&args[0], &args[1]) {
            (Value::Int(a), Value::Int(b)) => int_op(*a, *b).map(Value::Int).ok_or_else(|| {
                PvError::Read(format!("Integer overflow in {} {} {}", a, label, b))
            }),
            (a, b) => Ok(Value::Double(float_op(
                a.expect_f64("Left operand")?,
                b.expect_f64("Right operand")?,
            ))),
        }
    })
}

/// `+ - * /` on numbers; integers stay integers except for division
pub fn numeric_operators() -> FunctionSet {
    FunctionSet::new("numeric operators")
        .with(binary_numeric("+", "Addition", i64::checked_add, |a, b| a + b))
        .with(binary_numeric("-", "Subtraction", i64::checked_sub, |a, b| a - b))
        .with(binary_numeric("*", "Multiplication", i64::checked_mul, |a, b| a * b))
        .with(FormulaFunction::new("/", "Division", &["left", "right"], |args| {
            Ok(Value::Double(
                args[0].expect_f64("Dividend")? / args[1].expect_f64("Divisor")?,
            ))
        }))
        .with(FormulaFunction::new("-", "Negation", &["value"], |args| {
            match &args[0] {
                Value::Int(v) => v
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| PvError::Read(format!("Integer overflow negating {}", v))),
                other => Ok(Value::Double(-other.expect_f64("Operand")?)),
            }
        }))
}

fn unary_math(name: &str, description: &str, op: fn(f64) -> f64) -> FormulaFunction {
    FormulaFunction::new(name, description, &["x"], move |args| {
        Ok(Value::Double(op(args[0].expect_f64("Argument")?)))
    })
}

fn binary_math(name: &str, description: &str, op: fn(f64, f64) -> f64) -> FormulaFunction {
    FormulaFunction::new(name, description, &["x", "y"], move |args| {
        Ok(Value::Double(op(
            args[0].expect_f64("First argument")?,
            args[1].expect_f64("Second argument")?,
        )))
    })
}

/// `abs sqrt min max pow`
pub fn math_functions() -> FunctionSet {
    FunctionSet::new("math")
        .with(unary_math("abs", "Absolute value", f64::abs))
        .with(unary_math("sqrt", "Square root", f64::sqrt))
        .with(binary_math("min", "Smaller of two values", f64::min))
        .with(binary_math("max", "Larger of two values", f64::max))
        .with(binary_math("pow", "x raised to y", f64::powf))
}
