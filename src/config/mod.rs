//! Configuration module for pvmonitor
//!
//! Configuration is a TOML file with one table per concern:
//!
//! ```toml
//! [reader]
//! period_ms = 100
//! notify = "on-change"
//! source = "sim"
//!
//! [data_sources]
//! default_source = "loc"
//! delimiter = "://"
//!
//! [data_sources.sim]
//! default_interval_ms = 100
//!
//! [logging]
//! filter = "info,pvmonitor_rs=debug"
//! file = "/tmp/pvmonitor.log"
//! ```
//!
//! Every table and key is optional; missing ones take their defaults.
//!
//! # File Location
//!
//! [`PvConfig::default_path`] resolves to the platform config directory:
//! - **Linux**: `~/.config/pvmonitor/pvmonitor.toml`
//! - **macOS**: `~/Library/Application Support/pvmonitor/pvmonitor.toml`
//! - **Windows**: `%APPDATA%\pvmonitor\pvmonitor.toml`

use crate::error::{PvError, PvResult, ResultExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name under the platform config directory
pub const APP_DIR: &str = "pvmonitor";

/// Config filename
pub const CONFIG_FILE: &str = "pvmonitor.toml";

/// Default notification period in milliseconds
pub const DEFAULT_PERIOD_MS: u64 = 100;

/// Default sample interval of simulated channels in milliseconds
pub const DEFAULT_SIM_INTERVAL_MS: u64 = 100;

/// When a reader notifies its listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyPolicy {
    /// Every tick, whether or not anything changed
    Always,
    /// Only when a tick brings a different value, an error, or a connection change
    #[default]
    OnChange,
}

impl std::fmt::Display for NotifyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyPolicy::Always => write!(f, "always"),
            NotifyPolicy::OnChange => write!(f, "on-change"),
        }
    }
}

/// Options of a reader director
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Notification tick interval
    pub period_ms: u64,
    pub notify: NotifyPolicy,
    /// Data source for channels without a prefix; overrides
    /// [`DataSourceConfig::default_source`]
    pub source: Option<String>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            period_ms: DEFAULT_PERIOD_MS,
            notify: NotifyPolicy::default(),
            source: None,
        }
    }
}

impl ReaderConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period_ms = period.as_millis() as u64;
        self
    }

    pub fn with_notify(mut self, notify: NotifyPolicy) -> Self {
        self.notify = notify;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn validate(&self) -> PvResult<()> {
        if self.period_ms == 0 {
            return Err(PvError::Configuration(
                "reader.period_ms must be greater than zero".to_string(),
            ));
        }
        if matches!(&self.source, Some(s) if s.trim().is_empty()) {
            return Err(PvError::Configuration(
                "reader.source must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Options of the simulation data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Interval used by generators whose interval argument is omitted
    pub default_interval_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: DEFAULT_SIM_INTERVAL_MS,
        }
    }
}

impl SimConfig {
    pub fn default_interval(&self) -> Duration {
        Duration::from_millis(self.default_interval_ms)
    }
}

/// Data source bindings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourceConfig {
    /// Source for channels without a prefix
    pub default_source: Option<String>,
    /// Separator between source prefix and channel name
    pub delimiter: String,
    pub sim: SimConfig,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            default_source: Some("loc".to_string()),
            delimiter: "://".to_string(),
            sim: SimConfig::default(),
        }
    }
}

/// Logging options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set
    pub filter: String,
    /// Also write logs to this file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            file: None,
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PvConfig {
    pub reader: ReaderConfig,
    pub data_sources: DataSourceConfig,
    pub logging: LoggingConfig,
}

impl PvConfig {
    /// Platform config file path, if the platform has a config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs_next::config_dir().map(|p| p.join(APP_DIR).join(CONFIG_FILE))
    }

    pub fn from_toml_str(content: &str) -> PvResult<Self> {
        let config: PvConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> PvResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> PvResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(PvError::from)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        Self::from_toml_str(&content).with_context(|| format!("Invalid config {:?}", path))
    }

    /// Load the config at [`PvConfig::default_path`], or defaults when it is
    /// missing or invalid
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> PvResult<()> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(PvError::from)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        std::fs::write(path, self.to_toml_string()?)
            .map_err(PvError::from)
            .with_context(|| format!("Failed to write config {:?}", path))
    }

    pub fn validate(&self) -> PvResult<()> {
        self.reader.validate()?;
        if self.data_sources.delimiter.is_empty() {
            return Err(PvError::Configuration(
                "data_sources.delimiter must not be empty".to_string(),
            ));
        }
        if self.data_sources.sim.default_interval_ms == 0 {
            return Err(PvError::Configuration(
                "data_sources.sim.default_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
