//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, CorralConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/corral/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("corral/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("corral.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load one file into a raw TOML table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Merge `overlay` into `base`, recursing into nested tables so a layer can
/// set a single key without clobbering its siblings.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut CorralConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("CORRAL_ROUTER") {
        config.bind.router = v;
        sources.env_overrides.push("CORRAL_ROUTER".to_string());
    }
    if let Ok(v) = env::var("CORRAL_DB_PATH") {
        config.paths.db_path = expand_path(&v);
        sources.env_overrides.push("CORRAL_DB_PATH".to_string());
    }
    if let Ok(v) = env::var("CORRAL_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("CORRAL_LOG_LEVEL".to_string());
    }
    if let Ok(v) = env::var("CORRAL_MAX_SESSIONS") {
        if let Ok(n) = v.parse() {
            config.limits.max_sessions = Some(n);
            sources.env_overrides.push("CORRAL_MAX_SESSIONS".to_string());
        }
    }
    if let Ok(v) = env::var("CORRAL_DEFAULT_TIMEOUT_SECS") {
        if let Ok(n) = v.parse() {
            config.dispatch.default_timeout_secs = n;
            sources
                .env_overrides
                .push("CORRAL_DEFAULT_TIMEOUT_SECS".to_string());
        }
    }
}

/// Expand a leading ~ in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
