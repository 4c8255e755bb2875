//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use pvmonitor_rs::datasource::{CompositeDataSource, DataSource};
use pvmonitor_rs::function::FunctionRegistry;
use pvmonitor_rs::PvContext;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Default time to wait for something asynchronous to happen
pub fn test_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(2));
    }
    if condition() {
        Ok(())
    } else {
        anyhow::bail!("condition not met within {:?}", timeout)
    }
}

/// Context whose only (and default) source is `source`
pub fn context_with(source: Arc<dyn DataSource>) -> Arc<PvContext> {
    let name = source.name().to_string();
    let sources = CompositeDataSource::new()
        .with_source(source)
        .with_default(name);
    Arc::new(PvContext::new(sources, FunctionRegistry::with_defaults()))
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}
