//! Error handling for pvmonitor
//!
//! This module defines the error taxonomy shared by the whole runtime and a
//! Result alias for use throughout the crate.
//!
//! Source-rate failures never escape as panics: data sources turn them into
//! [`PvError`] values written into channel targets, and directors deliver
//! them to listeners as part of a notification. `PvError` is therefore
//! `Clone`, since one channel error may reach several expressions.

use std::sync::Arc;
use thiserror::Error;

/// Main error type for pvmonitor operations
#[derive(Error, Debug, Clone)]
pub enum PvError {
    /// Malformed expression graph or invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A channel failed to connect, or its data source reported a fault
    #[error("Connection error on channel '{channel}': {message}")]
    Connection { channel: String, message: String },

    /// Errors raised while evaluating an expression
    #[error("Read error: {0}")]
    Read(String),

    /// A write to a channel failed
    #[error("Write error on channel '{channel}': {message}")]
    Write { channel: String, message: String },

    /// No function registered under this name and arity
    #[error("Unknown function '{name}' with {arity} argument(s)")]
    UnknownFunction { name: String, arity: usize },

    /// A channel prefix named a data source that is not registered
    #[error("Unknown data source '{0}'")]
    UnknownDataSource(String),

    /// Errors related to Rhai script compilation or execution
    #[error("Script error: {0}")]
    Script(String),

    /// Operation attempted on a reader or writer that was closed
    #[error("Closed: {0}")]
    Closed(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PvError>,
    },
}

impl PvError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        PvError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a connection error for a channel
    pub fn connection(channel: impl Into<String>, message: impl Into<String>) -> Self {
        PvError::Connection {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Create a write error for a channel
    pub fn write(channel: impl Into<String>, message: impl Into<String>) -> Self {
        PvError::Write {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Create a script error from a Rhai error
    pub fn from_rhai_error(err: Box<rhai::EvalAltResult>) -> Self {
        PvError::Script(err.to_string())
    }

    /// The innermost error, skipping any context wrappers
    pub fn root(&self) -> &PvError {
        match self {
            PvError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<std::io::Error> for PvError {
    fn from(err: std::io::Error) -> Self {
        PvError::Io(Arc::new(err))
    }
}

impl From<toml::de::Error> for PvError {
    fn from(err: toml::de::Error) -> Self {
        PvError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for PvError {
    fn from(err: toml::ser::Error) -> Self {
        PvError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for PvError {
    fn from(err: serde_json::Error) -> Self {
        PvError::Serialization(err.to_string())
    }
}

/// Result type alias for pvmonitor operations
pub type PvResult<T> = std::result::Result<T, PvError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> PvResult<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> PvResult<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for PvResult<T> {
    fn context(self, context: impl Into<String>) -> PvResult<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> PvResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, Box<rhai::EvalAltResult>> {
    fn context(self, context: impl Into<String>) -> PvResult<T> {
        self.map_err(|e| PvError::from_rhai_error(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> PvResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| PvError::from_rhai_error(e).with_context(f()))
    }
}
