//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where the PipeWeaver daemon listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Daemon host.
    /// Default: localhost
    #[serde(default = "DaemonConfig::default_host")]
    pub host: String,

    /// Daemon HTTP/WebSocket port.
    /// Default: 14565
    #[serde(default = "DaemonConfig::default_port")]
    pub port: u16,

    /// Path of the command + patch WebSocket.
    /// Default: /api/websocket
    #[serde(default = "DaemonConfig::default_api_path")]
    pub api_path: String,

    /// Path of the meter WebSocket.
    /// Default: /api/websocket/meter
    #[serde(default = "DaemonConfig::default_meter_path")]
    pub meter_path: String,
}

impl DaemonConfig {
    fn default_host() -> String {
        "localhost".to_string()
    }

    fn default_port() -> u16 {
        14565
    }

    fn default_api_path() -> String {
        "/api/websocket".to_string()
    }

    fn default_meter_path() -> String {
        "/api/websocket/meter".to_string()
    }

    /// WebSocket URL for commands and the patch stream.
    pub fn api_url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.api_path)
    }

    /// WebSocket URL for the meter stream.
    pub fn meter_url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.meter_path)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            api_path: Self::default_api_path(),
            meter_path: Self::default_meter_path(),
        }
    }
}

/// Connection lifecycle and command timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// First reconnect delay in milliseconds (doubles each failed attempt).
    /// Default: 250
    #[serde(default = "SessionConfig::default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Reconnect delay ceiling in milliseconds.
    /// Default: 5000
    #[serde(default = "SessionConfig::default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Random jitter applied to each reconnect delay, as a fraction (0.0 - 1.0).
    /// Default: 0.2
    #[serde(default = "SessionConfig::default_jitter")]
    pub jitter: f64,

    /// Connect attempt timeout in milliseconds.
    /// Default: 5000
    #[serde(default = "SessionConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long a dispatched command may wait for a confirming patch.
    /// Default: 5000
    #[serde(default = "SessionConfig::default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// How long to wait for the status snapshot before asking again.
    /// Default: 10000
    #[serde(default = "SessionConfig::default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,
}

impl SessionConfig {
    fn default_backoff_base_ms() -> u64 {
        250
    }

    fn default_backoff_max_ms() -> u64 {
        5_000
    }

    fn default_jitter() -> f64 {
        0.2
    }

    fn default_connect_timeout_ms() -> u64 {
        5_000
    }

    fn default_command_timeout_ms() -> u64 {
        5_000
    }

    fn default_snapshot_timeout_ms() -> u64 {
        10_000
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: Self::default_backoff_base_ms(),
            backoff_max_ms: Self::default_backoff_max_ms(),
            jitter: Self::default_jitter(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            command_timeout_ms: Self::default_command_timeout_ms(),
            snapshot_timeout_ms: Self::default_snapshot_timeout_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level or full EnvFilter directive (trace, debug, info, warn, error).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// All infrastructure configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InfraConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_urls() {
        let daemon = DaemonConfig::default();
        assert_eq!(daemon.api_url(), "ws://localhost:14565/api/websocket");
        assert_eq!(daemon.meter_url(), "ws://localhost:14565/api/websocket/meter");
    }

    #[test]
    fn session_durations() {
        let session = SessionConfig::default();
        assert_eq!(session.backoff_base(), Duration::from_millis(250));
        assert_eq!(session.backoff_max(), Duration::from_secs(5));
        assert_eq!(session.command_timeout(), Duration::from_secs(5));
    }
}
