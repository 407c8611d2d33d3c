//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, WeaverConfig};
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

    let system = PathBuf::from("/etc/weaverlink/config.toml");
    if system.exists() {
        files.push(system);
    }

    // User config (XDG_CONFIG_HOME or ~/.config)
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("weaverlink/config.toml");
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

    let local = PathBuf::from("weaverlink.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a config file into a raw TOML table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_table(&contents, path)
}

fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Load a single config file (defaults fill whatever it omits).
pub fn load_from_file(path: &Path) -> Result<WeaverConfig, ConfigError> {
    let table = load_table(path)?;
    from_table(table, path)
}

/// Turn a merged raw table into a typed config.
pub fn from_table(table: toml::Table, path: &Path) -> Result<WeaverConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Deep-merge `overlay` into `base`. Tables merge key by key, anything else
/// in `overlay` replaces the value in `base`.
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
pub fn apply_env_overrides(config: &mut WeaverConfig, sources: &mut ConfigSources) {
    apply_overrides_with(config, sources, |key| env::var(key).ok());
}

/// Apply overrides from an arbitrary lookup (the process environment in
/// production, a map in tests).
pub fn apply_overrides_with<F>(config: &mut WeaverConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // Daemon address
    if let Some(v) = lookup("WEAVERLINK_HOST") {
        config.infra.daemon.host = v;
        sources.env_overrides.push("WEAVERLINK_HOST".to_string());
    }
    if let Some(v) = lookup("WEAVERLINK_PORT") {
        if let Ok(port) = v.parse() {
            config.infra.daemon.port = port;
            sources.env_overrides.push("WEAVERLINK_PORT".to_string());
        }
    }

    // Session timing
    if let Some(v) = lookup("WEAVERLINK_COMMAND_TIMEOUT_MS") {
        if let Ok(ms) = v.parse() {
            config.infra.session.command_timeout_ms = ms;
            sources.env_overrides.push("WEAVERLINK_COMMAND_TIMEOUT_MS".to_string());
        }
    }
    if let Some(v) = lookup("WEAVERLINK_BACKOFF_MAX_MS") {
        if let Ok(ms) = v.parse() {
            config.infra.session.backoff_max_ms = ms;
            sources.env_overrides.push("WEAVERLINK_BACKOFF_MAX_MS".to_string());
        }
    }

    // Telemetry
    if let Some(v) = lookup("WEAVERLINK_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("WEAVERLINK_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Some(v) = lookup("RUST_LOG") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    // Control seed
    if let Some(v) = lookup("WEAVERLINK_DEVICE") {
        config.bootstrap.control.device_id = Some(v);
        sources.env_overrides.push("WEAVERLINK_DEVICE".to_string());
    }
    if let Some(v) = lookup("WEAVERLINK_VOLUME_STEP") {
        if let Ok(step) = v.parse::<u8>() {
            config.bootstrap.control.volume_step = crate::bootstrap::clamp_volume_step(step);
            sources.env_overrides.push("WEAVERLINK_VOLUME_STEP".to_string());
        }
    }
}
