//! Simulated channels (`sim://sine(0, 10, 20, 0.1)`)
//!
//! Each channel name is a function call resolved through a
//! [`GeneratorRegistry`]. Intervals are in seconds.
//!
//! | Function | Arguments | Default |
//! |---|---|---|
//! | `sine` | min, max, samples per cycle, interval | `-5, 5, 10, <default>` |
//! | `ramp` | min, max, step, interval | `-5, 5, 1, <default>` |
//! | `triangle` | min, max, samples per cycle, interval | `-5, 5, 10, <default>` |
//! | `noise` | min, max, interval | `-5, 5, <default>` |
//! | `gaussian` | average, std dev, interval | `0, 1, <default>` |
//! | `flipflop` | interval | `<default>` |
//! | `const` | value | - |

use super::name_parser::parse_function;
use super::{ChannelTarget, DataSource, WriteCallback};
use crate::error::{PvError, PvResult};
use crate::value::Value;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A signal generator behind one simulated channel
pub trait SimFunction: Send {
    /// Next sample
    fn next_value(&mut self) -> Value;

    /// Time between samples; `None` publishes a single value
    fn interval(&self) -> Option<Duration>;
}

/// Builds a generator from parsed arguments and the default interval
pub type GeneratorFactory = fn(&[f64], Duration) -> PvResult<Box<dyn SimFunction>>;

fn interval_from_secs(secs: f64) -> PvResult<Duration> {
    let invalid = || {
        PvError::Configuration(format!(
            "Interval must be a positive number of seconds (was {})",
            secs
        ))
    };
    if secs <= 0.0 {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(secs).map_err(|_| invalid())
}

/// Arguments with the documented defaults filled in when none are given
fn args_or_defaults<'a>(
    name: &str,
    args: &'a [f64],
    defaults: &'a [f64],
) -> PvResult<&'a [f64]> {
    if args.is_empty() {
        Ok(defaults)
    } else if args.len() == defaults.len() {
        Ok(args)
    } else {
        Err(PvError::Configuration(format!(
            "Wrong parameter number for function {} (expected {}, got {})",
            name,
            defaults.len(),
            args.len()
        )))
    }
}

struct Sine {
    min: f64,
    max: f64,
    samples_per_cycle: f64,
    count: u64,
    interval: Duration,
}

impl SimFunction for Sine {
    fn next_value(&mut self) -> Value {
        let range = self.max - self.min;
        let phase = 2.0 * PI * (self.count as f64) / self.samples_per_cycle;
        self.count += 1;
        Value::Double(self.min + range / 2.0 + range / 2.0 * phase.sin())
    }

    fn interval(&self) -> Option<Duration> {
        Some(self.interval)
    }
}

struct Ramp {
    min: f64,
    max: f64,
    step: f64,
    current: Option<f64>,
    interval: Duration,
}

impl SimFunction for Ramp {
    fn next_value(&mut self) -> Value {
        let next = match self.current {
            None => {
                if self.step >= 0.0 {
                    self.min
                } else {
                    self.max
                }
            }
            Some(current) => {
                let next = current + self.step;
                if next > self.max {
                    self.min
                } else if next < self.min {
                    self.max
                } else {
                    next
                }
            }
        };
        self.current = Some(next);
        Value::Double(next)
    }

    fn interval(&self) -> Option<Duration> {
        Some(self.interval)
    }
}

struct Triangle {
    min: f64,
    max: f64,
    samples_per_cycle: f64,
    count: u64,
    interval: Duration,
}

impl SimFunction for Triangle {
    fn next_value(&mut self) -> Value {
        let position = (self.count as f64 % self.samples_per_cycle) / self.samples_per_cycle;
        self.count += 1;
        let range = self.max - self.min;
        let value = if position < 0.5 {
            self.min + range * 2.0 * position
        } else {
            self.max - range * 2.0 * (position - 0.5)
        };
        Value::Double(value)
    }

    fn interval(&self) -> Option<Duration> {
        Some(self.interval)
    }
}

struct Noise {
    min: f64,
    max: f64,
    rng: fastrand::Rng,
    interval: Duration,
}

impl SimFunction for Noise {
    fn next_value(&mut self) -> Value {
        Value::Double(self.min + self.rng.f64() * (self.max - self.min))
    }

    fn interval(&self) -> Option<Duration> {
        Some(self.interval)
    }
}

struct Gaussian {
    average: f64,
    std_dev: f64,
    rng: fastrand::Rng,
    interval: Duration,
}

impl SimFunction for Gaussian {
    fn next_value(&mut self) -> Value {
        // Box-Muller; 1 - f64() keeps the logarithm finite
        let u1 = 1.0 - self.rng.f64();
        let u2 = self.rng.f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
        Value::Double(self.average + self.std_dev * z)
    }

    fn interval(&self) -> Option<Duration> {
        Some(self.interval)
    }
}

struct FlipFlop {
    state: bool,
    interval: Duration,
}

impl SimFunction for FlipFlop {
    fn next_value(&mut self) -> Value {
        self.state = !self.state;
        Value::Bool(self.state)
    }

    fn interval(&self) -> Option<Duration> {
        Some(self.interval)
    }
}

struct Constant(f64);

impl SimFunction for Constant {
    fn next_value(&mut self) -> Value {
        Value::Double(self.0)
    }

    fn interval(&self) -> Option<Duration> {
        None
    }
}

fn sine(args: &[f64], default_interval: Duration) -> PvResult<Box<dyn SimFunction>> {
    let defaults = [-5.0, 5.0, 10.0, default_interval.as_secs_f64()];
    let a = args_or_defaults("sine", args, &defaults)?;
    if a[2] <= 0.0 {
        return Err(PvError::Configuration(
            "sine needs a positive number of samples per cycle".to_string(),
        ));
    }
    Ok(Box::new(Sine {
        min: a[0],
        max: a[1],
        samples_per_cycle: a[2],
        count: 0,
        interval: interval_from_secs(a[3])?,
    }))
}

fn ramp(args: &[f64], default_interval: Duration) -> PvResult<Box<dyn SimFunction>> {
    let defaults = [-5.0, 5.0, 1.0, default_interval.as_secs_f64()];
    let a = args_or_defaults("ramp", args, &defaults)?;
    Ok(Box::new(Ramp {
        min: a[0],
        max: a[1],
        step: a[2],
        current: None,
        interval: interval_from_secs(a[3])?,
    }))
}

fn triangle(args: &[f64], default_interval: Duration) -> PvResult<Box<dyn SimFunction>> {
    let defaults = [-5.0, 5.0, 10.0, default_interval.as_secs_f64()];
    let a = args_or_defaults("triangle", args, &defaults)?;
    if a[2] <= 0.0 {
        return Err(PvError::Configuration(
            "triangle needs a positive number of samples per cycle".to_string(),
        ));
    }
    Ok(Box::new(Triangle {
        min: a[0],
        max: a[1],
        samples_per_cycle: a[2],
        count: 0,
        interval: interval_from_secs(a[3])?,
    }))
}

fn noise(args: &[f64], default_interval: Duration) -> PvResult<Box<dyn SimFunction>> {
    let defaults = [-5.0, 5.0, default_interval.as_secs_f64()];
    let a = args_or_defaults("noise", args, &defaults)?;
    Ok(Box::new(Noise {
        min: a[0],
        max: a[1],
        rng: fastrand::Rng::new(),
        interval: interval_from_secs(a[2])?,
    }))
}

fn gaussian(args: &[f64], default_interval: Duration) -> PvResult<Box<dyn SimFunction>> {
    let defaults = [0.0, 1.0, default_interval.as_secs_f64()];
    let a = args_or_defaults("gaussian", args, &defaults)?;
    Ok(Box::new(Gaussian {
        average: a[0],
        std_dev: a[1],
        rng: fastrand::Rng::new(),
        interval: interval_from_secs(a[2])?,
    }))
}

fn flipflop(args: &[f64], default_interval: Duration) -> PvResult<Box<dyn SimFunction>> {
    let defaults = [default_interval.as_secs_f64()];
    let a = args_or_defaults("flipflop", args, &defaults)?;
    Ok(Box::new(FlipFlop {
        state: false,
        interval: interval_from_secs(a[0])?,
    }))
}

fn constant(args: &[f64], _default_interval: Duration) -> PvResult<Box<dyn SimFunction>> {
    match args {
        [value] => Ok(Box::new(Constant(*value))),
        _ => Err(PvError::Configuration(format!(
            "Wrong parameter number for function const (expected 1, got {})",
            args.len()
        ))),
    }
}

/// Function name to generator factory
#[derive(Clone)]
pub struct GeneratorRegistry {
    factories: HashMap<String, GeneratorFactory>,
}

impl GeneratorRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, factory: GeneratorFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the generator for a channel name such as `ramp(0, 10, 1, 0.5)`
    pub fn create(&self, channel: &str, default_interval: Duration) -> PvResult<Box<dyn SimFunction>> {
        let call = parse_function(channel)?;
        let factory = self.factories.get(&call.name).ok_or_else(|| {
            PvError::Configuration(format!("Function {} is not defined", call.name))
        })?;
        factory(&call.args, default_interval)
    }
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("sine", sine);
        registry.register("ramp", ramp);
        registry.register("triangle", triangle);
        registry.register("noise", noise);
        registry.register("gaussian", gaussian);
        registry.register("flipflop", flipflop);
        registry.register("const", constant);
        registry
    }
}

struct RunningChannel {
    target: Arc<ChannelTarget>,
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Data source whose channels are generated signals.
///
/// Every connection gets its own generator thread; two readers of the same
/// name see independent signals. Simulated channels are read-only.
pub struct SimulationDataSource {
    generators: GeneratorRegistry,
    default_interval: Duration,
    running: Mutex<Vec<RunningChannel>>,
}

impl SimulationDataSource {
    pub const NAME: &'static str = "sim";

    pub fn new(default_interval: Duration) -> Self {
        Self::with_generators(GeneratorRegistry::default(), default_interval)
    }

    pub fn with_generators(generators: GeneratorRegistry, default_interval: Duration) -> Self {
        Self {
            generators,
            default_interval,
            running: Mutex::new(Vec::new()),
        }
    }

    /// Number of generator threads currently running
    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    fn spawn(
        channel: &str,
        mut generator: Box<dyn SimFunction>,
        target: Arc<ChannelTarget>,
    ) -> PvResult<(Sender<()>, JoinHandle<()>)> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(format!("sim:{}", channel))
            .spawn(move || {
                target.set_connected(true);
                target.write_value(generator.next_value());
                let Some(interval) = generator.interval() else {
                    // Single value: park until stopped
                    let _ = stop_rx.recv();
                    return;
                };
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => target.write_value(generator.next_value()),
                        _ => break,
                    }
                }
            })
            .map_err(|e| PvError::connection(channel, format!("Failed to start generator: {}", e)))?;
        Ok((stop_tx, handle))
    }
}

impl Default for SimulationDataSource {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl DataSource for SimulationDataSource {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn connect(&self, channel: &str, target: Arc<ChannelTarget>) {
        let started = self
            .generators
            .create(channel, self.default_interval)
            .and_then(|generator| Self::spawn(channel, generator, target.clone()));

        match started {
            Ok((stop, handle)) => {
                tracing::debug!("Simulated channel '{}' started", channel);
                self.running.lock().push(RunningChannel {
                    target,
                    stop,
                    handle,
                });
            }
            Err(error) => {
                target.write_error(PvError::connection(channel, error.root().to_string()));
            }
        }
    }

    fn disconnect(&self, channel: &str, target: &Arc<ChannelTarget>) {
        let stopped: Vec<RunningChannel> = {
            let mut running = self.running.lock();
            let (stopped, kept): (Vec<_>, Vec<_>) = running
                .drain(..)
                .partition(|r| Arc::ptr_eq(&r.target, target));
            *running = kept;
            stopped
        };

        for channel_thread in stopped {
            let _ = channel_thread.stop.send(());
            if channel_thread.handle.join().is_err() {
                tracing::error!("Generator thread for '{}' panicked", channel);
            }
            channel_thread.target.set_connected(false);
            tracing::debug!("Simulated channel '{}' stopped", channel);
        }
    }

    fn write(&self, channel: &str, _value: Value, callback: WriteCallback) {
        callback(Err(PvError::write(channel, "Simulated channels are read-only")));
    }

    fn connect_write(&self, channel: &str) -> PvResult<()> {
        Err(PvError::write(channel, "Simulated channels are read-only"))
    }
}

impl Drop for SimulationDataSource {
    fn drop(&mut self) {
        for channel_thread in self.running.get_mut().drain(..) {
            let _ = channel_thread.stop.send(());
            let _ = channel_thread.handle.join();
        }
    }
}
