//! Minimal configuration loading for weaverlink.
//!
//! This crate provides configuration loading with minimal dependencies,
//! designed to be imported by every weaverlink crate.
//!
//! # Configuration Philosophy
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): things that cannot change at
//!   runtime - daemon address, reconnect timing, log level.
//!
//! - **Bootstrap** (`BootstrapConfig`): initial values that seed a control
//!   instance. After startup, the host runtime owns them.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/weaverlink/config.toml` (system)
//! 2. `~/.config/weaverlink/config.toml` (user)
//! 3. `./weaverlink.toml` (local override, or the `--config` path)
//! 4. Environment variables (`WEAVERLINK_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [daemon]
//! host = "localhost"
//! port = 14565
//!
//! [session]
//! backoff_base_ms = 250
//! backoff_max_ms = 5000
//! command_timeout_ms = 5000
//!
//! [telemetry]
//! log_level = "info"
//!
//! [bootstrap.control]
//! device_name = "Music"
//! mixes = ["A"]
//! volume_step = 5
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::{clamp_volume_step, BootstrapConfig, ControlConfig, MAX_VOLUME_STEP, MIN_VOLUME_STEP};
pub use infra::{DaemonConfig, InfraConfig, SessionConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete weaverlink configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WeaverConfig {
    /// Infrastructure - cannot change at runtime.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Bootstrap - seeds a control instance.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

impl WeaverConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with `config_path` taking the place of the local
    /// `./weaverlink.toml` override.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::from_table(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources);
        config.bootstrap.control.volume_step = clamp_volume_step(config.bootstrap.control.volume_step);

        Ok((config, sources))
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> String {
        // Build TOML manually for nicer formatting
        let mut output = String::new();

        output.push_str("# weaverlink configuration\n\n");

        let daemon = &self.infra.daemon;
        output.push_str("[daemon]\n");
        output.push_str(&format!("host = \"{}\"\n", daemon.host));
        output.push_str(&format!("port = {}\n", daemon.port));
        output.push_str(&format!("api_path = \"{}\"\n", daemon.api_path));
        output.push_str(&format!("meter_path = \"{}\"\n", daemon.meter_path));

        let session = &self.infra.session;
        output.push_str("\n[session]\n");
        output.push_str(&format!("backoff_base_ms = {}\n", session.backoff_base_ms));
        output.push_str(&format!("backoff_max_ms = {}\n", session.backoff_max_ms));
        output.push_str(&format!("jitter = {:?}\n", session.jitter));
        output.push_str(&format!("connect_timeout_ms = {}\n", session.connect_timeout_ms));
        output.push_str(&format!("command_timeout_ms = {}\n", session.command_timeout_ms));
        output.push_str(&format!("snapshot_timeout_ms = {}\n", session.snapshot_timeout_ms));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = \"{}\"\n",
            self.infra.telemetry.log_level
        ));

        let control = &self.bootstrap.control;
        output.push_str("\n[bootstrap.control]\n");
        if let Some(id) = &control.device_id {
            output.push_str(&format!("device_id = \"{}\"\n", id));
        }
        if let Some(name) = &control.device_name {
            output.push_str(&format!("device_name = \"{}\"\n", name));
        }
        output.push_str(&format!("mixes = {}\n", quoted_list(&control.mixes)));
        output.push_str(&format!("volume_step = {}\n", control.volume_step));
        output.push_str(&format!("mute_targets = {}\n", quoted_list(&control.mute_targets)));

        output
    }
}

fn quoted_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| format!("\"{}\"", s)).collect();
    format!("[{}]", quoted.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = WeaverConfig::default();
        assert_eq!(config.infra.daemon.port, 14565);
        assert_eq!(config.bootstrap.control.volume_step, 5);
    }

    #[test]
    fn test_to_toml_round_trips() {
        let mut config = WeaverConfig::default();
        config.bootstrap.control.device_name = Some("Music".to_string());
        config.bootstrap.control.mixes = vec!["A".to_string(), "B".to_string()];

        let toml = config.to_toml();
        assert!(toml.contains("[daemon]"));
        assert!(toml.contains("[bootstrap.control]"));

        let table: toml::Table = toml.parse().unwrap();
        let parsed = loader::from_table(table, Path::new("rendered")).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[daemon]\nport = 16000\n\n[bootstrap.control]\nvolume_step = 0").unwrap();

        let (config, sources) = WeaverConfig::load_with_sources_from(Some(file.path())).unwrap();
        assert_eq!(config.infra.daemon.port, 16000);
        // Out-of-range step gets clamped
        assert_eq!(config.bootstrap.control.volume_step, MIN_VOLUME_STEP);
        assert!(sources.files.iter().any(|p| p == file.path()));
    }
}
