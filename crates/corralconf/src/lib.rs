//! Minimal configuration loading for the corral control plane.
//!
//! Configuration is loaded in layers (later wins):
//! 1. Compiled defaults
//! 2. `/etc/corral/config.toml` (system)
//! 3. `~/.config/corral/config.toml` (user)
//! 4. `./corral.toml` (local override, or an explicit `--config` path)
//! 5. Environment variables (`CORRAL_*`)
//!
//! # Example Config
//!
//! ```toml
//! [bind]
//! router = "tcp://0.0.0.0:5670"
//!
//! [heartbeat]
//! check_interval_secs = 30
//! overdue_threshold_secs = 90
//!
//! [dispatch]
//! default_timeout_secs = 30
//!
//! [limits]
//! max_sessions = 256
//!
//! [paths]
//! db_path = "~/.local/share/corral/corral.db"
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod loader;

pub use loader::{discover_config_files, expand_path, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete corral configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CorralConfig {
    pub bind: BindConfig,
    pub heartbeat: HeartbeatConfig,
    pub dispatch: DispatchConfig,
    pub limits: LimitsConfig,
    pub paths: PathsConfig,
    pub telemetry: TelemetryConfig,
}

impl CorralConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an optional explicit config path.
    ///
    /// If `config_path` is provided, it takes precedence over the local
    /// `./corral.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut table = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let layer = loader::load_table(&path)?;
            loader::merge_tables(&mut table, layer);
            sources.files.push(path);
        }

        let mut config: CorralConfig =
            toml::Value::Table(table)
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::Parse {
                    path: PathBuf::from("<merged>"),
                    message: e.to_string(),
                })?;
        config.paths.db_path = expand_path(&config.paths.db_path.to_string_lossy());

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    pub fn heartbeat_check_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.check_interval_secs)
    }

    pub fn heartbeat_overdue_threshold(&self) -> Duration {
        Duration::from_secs(self.heartbeat.overdue_threshold_secs)
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.default_timeout_secs)
    }
}

/// Socket bind addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BindConfig {
    /// ROUTER endpoint host streams connect to.
    pub router: String,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            router: "tcp://0.0.0.0:5670".to_string(),
        }
    }
}

/// Heartbeat monitoring knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// How often the per-session monitor ticks.
    pub check_interval_secs: u64,
    /// Quiet period after which a host is marked overdue.
    pub overdue_threshold_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            overdue_threshold_secs: 90,
        }
    }
}

/// Dispatcher defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Timeout applied when a caller does not specify one.
    pub default_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
        }
    }
}

/// Resource limits.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LimitsConfig {
    /// Refuse new host sessions past this count. Unlimited when unset.
    pub max_sessions: Option<usize>,
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Sqlite database for the persistent host records.
    pub db_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            db_path: expand_path("~/.local/share/corral/corral.db"),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Default tracing filter, overridable with RUST_LOG.
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}
