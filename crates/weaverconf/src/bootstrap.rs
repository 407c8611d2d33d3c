//! Bootstrap configuration - seeds a control instance, then the host owns it.
//!
//! The host plugin runtime normally hands these values to each control at
//! runtime. This section exists so `weaverctl` and tests can seed a control
//! without a host.

use serde::{Deserialize, Serialize};

/// Smallest accepted dial step.
pub const MIN_VOLUME_STEP: u8 = 1;

/// Largest accepted dial step.
pub const MAX_VOLUME_STEP: u8 = 20;

/// Per-control defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Device identifier the control targets.
    #[serde(default)]
    pub device_id: Option<String>,

    /// Device display name, used to re-resolve the id after a daemon restart.
    #[serde(default)]
    pub device_name: Option<String>,

    /// Selected mixes for source devices ("A", "B").
    /// Default: ["A"]
    #[serde(default = "ControlConfig::default_mixes")]
    pub mixes: Vec<String>,

    /// Volume change per dial detent, 1..=20.
    /// Default: 5
    #[serde(default = "ControlConfig::default_volume_step")]
    pub volume_step: u8,

    /// Target ids the source mutes to. Empty means "all targets".
    #[serde(default)]
    pub mute_targets: Vec<String>,
}

impl ControlConfig {
    fn default_mixes() -> Vec<String> {
        vec!["A".to_string()]
    }

    fn default_volume_step() -> u8 {
        5
    }

    /// Volume step clamped into the accepted range.
    pub fn clamped_volume_step(&self) -> u8 {
        clamp_volume_step(self.volume_step)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            device_name: None,
            mixes: Self::default_mixes(),
            volume_step: Self::default_volume_step(),
            mute_targets: Vec::new(),
        }
    }
}

/// Clamp a dial step into `MIN_VOLUME_STEP..=MAX_VOLUME_STEP`.
pub fn clamp_volume_step(step: u8) -> u8 {
    step.clamp(MIN_VOLUME_STEP, MAX_VOLUME_STEP)
}

/// Everything that seeds runtime state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub control: ControlConfig,
}
