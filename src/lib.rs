//! # pvmonitor-rs: live process-variable monitoring
//!
//! A runtime that reads values from named channels (process variables),
//! buffers them as they arrive, and hands computed results to the
//! application at a fixed rate of its choosing. The architecture separates
//! the rate at which data sources produce values from the rate at which
//! listeners are notified.
//!
//! ## Architecture
//!
//! - **Data sources**: produce channel values on their own threads and write
//!   them into a [`datasource::ChannelTarget`] per connection
//! - **Collectors**: caches, queues and time windows that buffer the values
//!   between notifications
//! - **Expressions**: a graph of functions over collectors, built with the
//!   combinators in [`expression`]
//! - **Directors**: [`PvReader`] connects the channels an expression needs,
//!   evaluates it on its notification thread and notifies listeners;
//!   [`PvWriter`] routes writes to channels
//!
//! ## Configuration
//!
//! Settings live in a TOML file in the platform config directory under
//! `pvmonitor/` (see [`config`]).
//!
//! ## Example
//!
//! ```ignore
//! use pvmonitor_rs::{
//!     config::PvConfig,
//!     expression::{average_of, channel},
//!     Notification, PvContext, PvReader,
//! };
//! use std::sync::Arc;
//!
//! fn main() -> pvmonitor_rs::PvResult<()> {
//!     let config = PvConfig::load_or_default();
//!     let _guard = pvmonitor_rs::logging::init_logging(&config.logging)?;
//!
//!     let context = Arc::new(PvContext::from_config(&config.data_sources));
//!     let reader = PvReader::builder(context).config(config.reader).build()?;
//!     reader.add_expression(average_of(&channel("sim://sine(-5, 5, 20, 0.05)")), |n: &Notification| {
//!         println!("{} = {:?}", n.name, n.value);
//!     })?;
//!
//!     std::thread::sleep(std::time::Duration::from_secs(2));
//!     reader.close();
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod collector;
pub mod config;
pub mod context;
pub mod datasource;
pub mod director;
pub mod error;
pub mod expression;
pub mod function;
pub mod logging;
pub mod value;

// Re-export commonly used types
pub use cache::{ChannelListener, ValueCache};
pub use config::{NotifyPolicy, PvConfig, ReaderConfig};
pub use context::PvContext;
pub use datasource::{ChannelTarget, CompositeDataSource, DataSource};
pub use director::{
    DirectorLifecycle, DirectorStats, ExpressionId, Notification, PvReadWriter, PvReader,
    PvWriter, ReadListener,
};
pub use error::{PvError, PvResult};
pub use expression::{
    DesiredRateExpression, ReadWriteExpression, SourceRateExpression, WriteExpression,
};
pub use value::{Statistics, Table, Value};
