//! Typed views over the daemon's status tree.
//!
//! The tree keeps devices in arrays, so a device's pointer contains its
//! array index and can move when another device is removed. Look devices up
//! by id and re-derive the pointer after every structural change.

use crate::command::{Mix, MuteState, MuteTarget};
use crate::patch::is_ancestor_or_self;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

pub const SOURCES_PATH: &str = "/audio/profile/devices/sources/virtual_devices";
pub const TARGETS_PATH: &str = "/audio/profile/devices/targets/virtual_devices";
pub const PHYSICAL_TARGETS_PATH: &str = "/audio/profile/devices/targets/physical_devices";

/// Where a device lives in the tree. Fixed for the device's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Source,
    Target,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Source => "source",
            DeviceKind::Target => "target",
        }
    }
}

/// Identity and location of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
    /// Pointer to the device node.
    pub path: String,
    /// Physical targets can be mute targets but are not controllable.
    pub physical: bool,
}

impl DeviceSummary {
    /// `<device>/volumes/volume/<mix>` for sources, `<device>/volume` for
    /// targets.
    pub fn volume_path(&self, mix: Option<Mix>) -> String {
        match (self.kind, mix) {
            (DeviceKind::Source, Some(mix)) => format!("{}/volumes/volume/{}", self.path, mix),
            (DeviceKind::Source, None) => format!("{}/volumes/volume", self.path),
            (DeviceKind::Target, _) => format!("{}/volume", self.path),
        }
    }

    pub fn linked_path(&self) -> String {
        format!("{}/volumes/volumes_linked", self.path)
    }

    /// Source mute set, or the target's `"Muted"`/`"Unmuted"` string.
    pub fn mute_state_path(&self) -> String {
        match self.kind {
            DeviceKind::Source => format!("{}/mute_states/mute_state", self.path),
            DeviceKind::Target => format!("{}/mute_state", self.path),
        }
    }

    pub fn mute_targets_path(&self, mute_target: MuteTarget) -> String {
        format!(
            "{}/mute_states/mute_targets/{}",
            self.path,
            mute_target.as_str()
        )
    }

    /// Does a change at `path` affect this device?
    pub fn owns(&self, path: &str) -> bool {
        is_ancestor_or_self(&self.path, path)
    }
}

/// Normalize a raw volume: values above 100 are on a 0..=255 scale.
pub fn normalize_volume(raw: &Value) -> Option<u8> {
    let raw = raw.as_f64()?;
    if raw < 0.0 {
        return Some(0);
    }
    let percent = if raw > 100.0 { raw / 255.0 * 100.0 } else { raw };
    Some(percent.min(100.0) as u8)
}

fn section<'a>(root: &'a Value, path: &str) -> &'a [Value] {
    root.pointer(path)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn summarize(
    section_path: &str,
    index: usize,
    node: &Value,
    kind: DeviceKind,
    physical: bool,
) -> Option<DeviceSummary> {
    let description = node.get("description")?;
    let id = match description.get("id")? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let name = description
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(&id)
        .to_string();

    Some(DeviceSummary {
        id,
        name,
        kind,
        path: format!("{section_path}/{index}"),
        physical,
    })
}

fn scan(root: &Value, path: &str, kind: DeviceKind, physical: bool) -> Vec<DeviceSummary> {
    section(root, path)
        .iter()
        .enumerate()
        .filter_map(|(i, node)| summarize(path, i, node, kind, physical))
        .collect()
}

/// Controllable devices: virtual sources, then virtual targets.
pub fn list_devices(root: &Value) -> Vec<DeviceSummary> {
    let mut devices = scan(root, SOURCES_PATH, DeviceKind::Source, false);
    devices.extend(scan(root, TARGETS_PATH, DeviceKind::Target, false));
    devices
}

pub fn find_device(root: &Value, id: &str) -> Option<DeviceSummary> {
    list_devices(root).into_iter().find(|d| d.id == id)
}

/// Exact name match first, then case-insensitive.
pub fn find_device_by_name(root: &Value, name: &str) -> Option<DeviceSummary> {
    let devices = list_devices(root);
    if let Some(found) = devices.iter().find(|d| d.name == name) {
        return Some(found.clone());
    }
    let lowered = name.to_lowercase();
    devices.into_iter().find(|d| d.name.to_lowercase() == lowered)
}

/// Every device a source can mute to: virtual and physical targets.
pub fn mute_target_candidates(root: &Value) -> Vec<DeviceSummary> {
    let mut targets = scan(root, TARGETS_PATH, DeviceKind::Target, false);
    targets.extend(scan(root, PHYSICAL_TARGETS_PATH, DeviceKind::Target, true));
    targets
}

/// Drop ids that no longer name a mute-target candidate.
pub fn live_target_ids<'a, I>(root: &Value, ids: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let known: BTreeSet<String> = mute_target_candidates(root)
        .into_iter()
        .map(|d| d.id)
        .collect();
    ids.into_iter().filter(|id| known.contains(*id)).cloned().collect()
}

fn string_set(value: Option<Value>) -> BTreeSet<String> {
    match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        _ => BTreeSet::new(),
    }
}

/// Rendered state of a source device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceView {
    pub device: DeviceSummary,
    pub volume_a: u8,
    pub volume_b: u8,
    pub linked: bool,
    pub muted: BTreeSet<MuteTarget>,
    pub mute_targets_a: BTreeSet<String>,
    pub mute_targets_b: BTreeSet<String>,
}

impl SourceView {
    pub fn volume(&self, mix: Mix) -> u8 {
        match mix {
            Mix::A => self.volume_a,
            Mix::B => self.volume_b,
        }
    }

    pub fn is_muted(&self, mix: Mix) -> bool {
        self.muted.contains(&mix.mute_target())
    }

    pub fn mute_targets(&self, mute_target: MuteTarget) -> &BTreeSet<String> {
        match mute_target {
            MuteTarget::TargetA => &self.mute_targets_a,
            MuteTarget::TargetB => &self.mute_targets_b,
        }
    }
}

/// Rendered state of a target device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetView {
    pub device: DeviceSummary,
    pub volume: u8,
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceView {
    Source(SourceView),
    Target(TargetView),
}

impl DeviceView {
    /// Read a device straight from the tree.
    pub fn read(root: &Value, device: &DeviceSummary) -> Self {
        Self::read_with(device, |path| root.pointer(path).cloned())
    }

    /// Read a device through `lookup`, which may shadow tree values (the
    /// optimistic overlay does).
    pub fn read_with<F>(device: &DeviceSummary, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<Value>,
    {
        let volume_at = |path: String| {
            lookup(&path)
                .as_ref()
                .and_then(normalize_volume)
                .unwrap_or(0)
        };

        match device.kind {
            DeviceKind::Source => {
                let linked = lookup(&device.linked_path()).is_some_and(|v| !v.is_null());
                let muted = string_set(lookup(&device.mute_state_path()))
                    .into_iter()
                    .filter_map(|s| match s.as_str() {
                        "TargetA" => Some(MuteTarget::TargetA),
                        "TargetB" => Some(MuteTarget::TargetB),
                        _ => None,
                    })
                    .collect();

                DeviceView::Source(SourceView {
                    volume_a: volume_at(device.volume_path(Some(Mix::A))),
                    volume_b: volume_at(device.volume_path(Some(Mix::B))),
                    linked,
                    muted,
                    mute_targets_a: string_set(
                        lookup(&device.mute_targets_path(MuteTarget::TargetA)),
                    ),
                    mute_targets_b: string_set(
                        lookup(&device.mute_targets_path(MuteTarget::TargetB)),
                    ),
                    device: device.clone(),
                })
            }
            DeviceKind::Target => {
                let muted = lookup(&device.mute_state_path())
                    .and_then(|v| serde_json::from_value::<MuteState>(v).ok())
                    .is_some_and(MuteState::is_muted);

                DeviceView::Target(TargetView {
                    volume: volume_at(device.volume_path(None)),
                    muted,
                    device: device.clone(),
                })
            }
        }
    }

    pub fn device(&self) -> &DeviceSummary {
        match self {
            DeviceView::Source(s) => &s.device,
            DeviceView::Target(t) => &t.device,
        }
    }

    pub fn as_source(&self) -> Option<&SourceView> {
        match self {
            DeviceView::Source(s) => Some(s),
            DeviceView::Target(_) => None,
        }
    }

    pub fn as_target(&self) -> Option<&TargetView> {
        match self {
            DeviceView::Target(t) => Some(t),
            DeviceView::Source(_) => None,
        }
    }
}
