//! Formula functions written as Rhai expressions.

use crate::error::{PvError, PvResult, ResultExt};
use crate::value::Value;
use rhai::{Dynamic, Engine, Scope, AST};
use std::fmt;
use std::sync::Arc;

/// A compiled Rhai expression whose free variables are the argument names
#[derive(Clone)]
pub struct ScriptFunction {
    name: String,
    arg_names: Vec<String>,
    engine: Arc<Engine>,
    ast: AST,
}

impl ScriptFunction {
    pub fn compile(name: &str, arg_names: &[&str], source: &str) -> PvResult<Self> {
        let engine = Self::create_engine();
        let ast = engine.compile_expression(source).map_err(|e| {
            PvError::Script(format!("Compile error in '{}': {}", name, e))
        })?;
        Ok(Self {
            name: name.to_string(),
            arg_names: arg_names.iter().map(|a| a.to_string()).collect(),
            engine: Arc::new(engine),
            ast,
        })
    }

    fn create_engine() -> Engine {
        let mut engine = Engine::new();
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_operations(10_000);
        engine.set_max_string_size(10_000);
        engine.set_max_array_size(1_000);

        engine.register_fn("abs", |x: f64| x.abs());
        engine.register_fn("sqrt", |x: f64| x.sqrt());
        engine.register_fn("pow", |x: f64, y: f64| x.powf(y));
        engine.register_fn("exp", |x: f64| x.exp());
        engine.register_fn("ln", |x: f64| x.ln());
        engine.register_fn("sin", |x: f64| x.sin());
        engine.register_fn("cos", |x: f64| x.cos());
        engine.register_fn("min", |a: f64, b: f64| a.min(b));
        engine.register_fn("max", |a: f64, b: f64| a.max(b));
        engine.register_fn("clamp", |x: f64, min: f64, max: f64| x.clamp(min, max));
        engine.register_fn("pi", || std::f64::consts::PI);
        engine
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &[Value]) -> PvResult<Value> {
        let mut scope = Scope::new();
        for (name, value) in self.arg_names.iter().zip(args) {
            scope.push_dynamic(name.as_str(), to_dynamic(value)?);
        }
        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
            .with_context(|| format!("Evaluating script function '{}'", self.name))?;
        from_dynamic(result)
    }
}

impl fmt::Debug for ScriptFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptFunction")
            .field("name", &self.name)
            .field("arg_names", &self.arg_names)
            .finish()
    }
}

fn to_dynamic(value: &Value) -> PvResult<Dynamic> {
    match value {
        Value::Double(v) => Ok(Dynamic::from_float(*v)),
        Value::Int(v) => Ok(Dynamic::from_int(*v)),
        Value::Bool(v) => Ok(Dynamic::from_bool(*v)),
        Value::Text(v) => Ok(Dynamic::from(v.clone())),
        Value::Statistics(stats) => Ok(Dynamic::from_float(stats.mean)),
        other => Err(PvError::Read(format!(
            "Script arguments must be scalar (was {})",
            other.kind()
        ))),
    }
}

fn from_dynamic(result: Dynamic) -> PvResult<Value> {
    if let Ok(f) = result.as_float() {
        Ok(Value::Double(f))
    } else if let Ok(i) = result.as_int() {
        Ok(Value::Int(i))
    } else if let Ok(b) = result.as_bool() {
        Ok(Value::Bool(b))
    } else if result.is_string() {
        Ok(Value::Text(result.to_string()))
    } else {
        Err(PvError::Script(format!(
            "Script returned an unsupported value of type {}",
            result.type_name()
        )))
    }
}
