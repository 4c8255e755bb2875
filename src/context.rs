//! Explicit runtime context handed to directors.

use crate::config::DataSourceConfig;
use crate::datasource::{CompositeDataSource, LocalDataSource, SimulationDataSource};
use crate::function::FunctionRegistry;
use std::sync::Arc;

/// Data-source bindings and formula functions shared by readers and writers.
///
/// Nothing in the crate holds a global instance; build one at startup and
/// pass it (usually as `Arc<PvContext>`) to every director.
pub struct PvContext {
    data_sources: Arc<CompositeDataSource>,
    functions: Arc<FunctionRegistry>,
    local: Option<Arc<LocalDataSource>>,
}

impl PvContext {
    pub fn new(data_sources: CompositeDataSource, functions: FunctionRegistry) -> Self {
        Self {
            data_sources: Arc::new(data_sources),
            functions: Arc::new(functions),
            local: None,
        }
    }

    /// Local and simulated sources plus the default function sets
    pub fn from_config(config: &DataSourceConfig) -> Self {
        let local = Arc::new(LocalDataSource::new());
        let mut sources = CompositeDataSource::new()
            .with_delimiter(config.delimiter.clone())
            .with_source(local.clone())
            .with_source(Arc::new(SimulationDataSource::new(
                config.sim.default_interval(),
            )));
        sources.set_default_source(config.default_source.clone());
        let mut context = Self::new(sources, FunctionRegistry::with_defaults());
        context.local = Some(local);
        context
    }

    pub fn data_sources(&self) -> &Arc<CompositeDataSource> {
        &self.data_sources
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// The built-in local source, for publishing values from application code
    pub fn local(&self) -> Option<&Arc<LocalDataSource>> {
        self.local.as_ref()
    }
}

impl std::fmt::Debug for PvContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PvContext")
            .field("data_sources", &self.data_sources)
            .field("functions", &self.functions.names())
            .finish()
    }
}

impl Default for PvContext {
    fn default() -> Self {
        Self::from_config(&DataSourceConfig::default())
    }
}
