//! One hardware control bound to one device.
//!
//! A control owns its settings (device, bus selection, dial step, mute
//! targets), turns gestures into intents, and renders the device through
//! a callback whenever the device, its meter, or one of its intents
//! changes. The host decides what "render" means.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use weaverconf::{clamp_volume_step, ControlConfig};
use weaverproto::status::live_target_ids;
use weaverproto::{is_ancestor_or_self, DeviceKind, DeviceSummary, DeviceView, Mix};

use crate::bus::{BusPress, BusSelection};
use crate::client::WeaverClient;
use crate::dispatcher::VolumeChange;
use crate::error::ValidationError;
use crate::fanout::{Subscription, Update};
use crate::util::lock;

/// Per-control settings, normally owned by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSettings {
    pub device_id: Option<String>,
    /// Used to find the device again when the daemon restarts with new ids.
    pub device_name: Option<String>,
    pub selection: BusSelection,
    /// Volume change per dial detent, 1..=20.
    pub volume_step: u8,
    /// Targets the source mutes to. Empty means all.
    pub mute_targets: BTreeSet<String>,
}

impl ControlSettings {
    pub fn from_config(config: &ControlConfig) -> Self {
        Self {
            device_id: config.device_id.clone(),
            device_name: config.device_name.clone(),
            selection: BusSelection::from_names(&config.mixes),
            volume_step: config.clamped_volume_step(),
            mute_targets: config.mute_targets.iter().cloned().collect(),
        }
    }
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self::from_config(&ControlConfig::default())
    }
}

/// What a control shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderState {
    pub device_id: String,
    pub display_value: u8,
    pub muted: bool,
    pub level: u8,
    pub linked: bool,
    pub selection: BusSelection,
}

/// Compute what a control shows for a device view.
pub fn render_state(view: &DeviceView, selection: BusSelection, level: u8) -> RenderState {
    match view {
        DeviceView::Source(source) => {
            let muted = if source.linked {
                source.is_muted(Mix::B)
            } else {
                selection.mixes().into_iter().any(|m| source.is_muted(m))
            };
            RenderState {
                device_id: source.device.id.clone(),
                display_value: source.volume(selection.display_mix()),
                muted,
                level,
                linked: source.linked,
                selection,
            }
        }
        DeviceView::Target(target) => RenderState {
            device_id: target.device.id.clone(),
            display_value: target.volume,
            muted: target.muted,
            level,
            linked: false,
            selection,
        },
    }
}

type RenderFn = dyn Fn(RenderState) + Send + Sync;

struct ControlCore {
    client: Arc<WeaverClient>,
    settings: Mutex<ControlSettings>,
    /// The device as last resolved.
    device: Mutex<Option<DeviceSummary>>,
    render: Box<RenderFn>,
}

impl ControlCore {
    fn device_id(&self) -> Result<String, ValidationError> {
        lock(&self.settings)
            .device_id
            .clone()
            .ok_or_else(|| ValidationError::UnknownDevice(String::new()))
    }

    /// Find the device by id, falling back to its name.
    fn resolve(&self) -> Result<DeviceSummary, ValidationError> {
        let (id, name) = {
            let settings = lock(&self.settings);
            (settings.device_id.clone(), settings.device_name.clone())
        };

        if let Some(id) = &id {
            if let Some(device) = self.client.devices().into_iter().find(|d| &d.id == id) {
                return Ok(device);
            }
        }
        if let Some(name) = &name {
            if let Some(device) = self.client.find_device_by_name(name) {
                if id.as_ref() != Some(&device.id) {
                    info!(name = %name, old = ?id, new = %device.id, "device re-resolved by name");
                }
                return Ok(device);
            }
        }
        Err(ValidationError::UnknownDevice(id.or(name).unwrap_or_default()))
    }

    fn adopt(&self, device: &DeviceSummary) {
        *lock(&self.device) = Some(device.clone());
        let mut settings = lock(&self.settings);
        settings.device_id = Some(device.id.clone());
        if settings.device_name.is_none() {
            settings.device_name = Some(device.name.clone());
        }
        if device.kind == DeviceKind::Source && settings.selection.is_empty() {
            settings.selection = BusSelection::A;
        }
    }

    fn render_state(&self) -> Option<RenderState> {
        let (id, selection) = {
            let settings = lock(&self.settings);
            (settings.device_id.clone()?, settings.selection)
        };
        let view = self.client.view(&id)?;
        let level = self.client.meter_level(&id).unwrap_or(0);
        Some(render_state(&view, selection, level))
    }

    fn render(&self) {
        if let Some(state) = self.render_state() {
            (self.render)(state);
        }
    }

    fn on_update(&self, update: Update) {
        // Snapshots and array reshuffles can renumber the device
        let known = lock(&self.device).clone();
        let moved = update.paths.iter().any(|path| match &known {
            Some(device) => is_ancestor_or_self(path, &device.path),
            None => true,
        });
        if moved {
            match self.resolve() {
                Ok(device) => self.adopt(&device),
                Err(e) => debug!(error = %e, "control device not present after update"),
            }
        }

        let Some(device) = lock(&self.device).clone() else {
            return;
        };
        let relevant = moved
            || update.paths.iter().any(|path| device.owns(path))
            || update.meters.iter().any(|(id, _)| id == &device.id)
            || update.intents.iter().any(|event| event.device_id == device.id);
        if relevant {
            self.render();
        }
    }
}

pub struct Control {
    core: Arc<ControlCore>,
    subscription: Mutex<Option<Subscription>>,
}

impl Control {
    pub fn new<F>(client: Arc<WeaverClient>, settings: ControlSettings, render: F) -> Self
    where
        F: Fn(RenderState) + Send + Sync + 'static,
    {
        Self {
            core: Arc::new(ControlCore {
                client,
                settings: Mutex::new(settings),
                device: Mutex::new(None),
                render: Box::new(render),
            }),
            subscription: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> ControlSettings {
        lock(&self.core.settings).clone()
    }

    pub fn set_volume_step(&self, step: u8) {
        lock(&self.core.settings).volume_step = clamp_volume_step(step);
    }

    pub fn set_mute_targets(&self, targets: BTreeSet<String>) {
        lock(&self.core.settings).mute_targets = targets;
    }

    /// Bind to the device: resolve it, subscribe, reconcile divergent mute
    /// states, and render once.
    pub fn enable(&self) -> Result<DeviceSummary, ValidationError> {
        let device = self.core.resolve()?;
        self.core.adopt(&device);

        let core = self.core.clone();
        // Tree changes, meters and intent outcomes share one worker
        let subscription = self.core.client.subscribe("", move |update| core.on_update(update));
        *lock(&self.subscription) = Some(subscription);

        self.sync_mute_states(&device);
        self.core.render();
        debug!(device = %device.id, "control enabled");
        Ok(device)
    }

    pub fn disable(&self) {
        lock(&self.subscription).take();
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.subscription).is_some()
    }

    /// With both mixes selected, B follows A's mute state.
    fn sync_mute_states(&self, device: &DeviceSummary) {
        if self.settings().selection != BusSelection::Both {
            return;
        }
        let Some(DeviceView::Source(source)) = self.core.client.view(&device.id) else {
            return;
        };
        if source.is_muted(Mix::A) == source.is_muted(Mix::B) {
            return;
        }
        debug!(device = %device.id, a_muted = source.is_muted(Mix::A), "aligning mix B mute with mix A");
        if let Err(e) = self.core.client.dispatcher().toggle_mute(&device.id, &[Mix::B]) {
            warn!(error = %e, "failed to align mute states");
        }
    }

    /// Dial rotation by `detents` (negative turns down).
    pub fn dial_turn(&self, detents: i32) -> Result<Vec<u64>, ValidationError> {
        let id = self.core.device_id()?;
        let settings = self.settings();
        let view = self
            .core
            .client
            .view(&id)
            .ok_or_else(|| ValidationError::UnknownDevice(id.clone()))?;
        let change = VolumeChange::Delta(detents.saturating_mul(i32::from(settings.volume_step)));
        let dispatcher = self.core.client.dispatcher();

        match view {
            DeviceView::Target(target) => {
                if target.muted {
                    return Ok(vec![]);
                }
                dispatcher.set_volume(&id, None, change)
            }
            DeviceView::Source(source) => {
                let mixes = settings.selection.mixes();
                if mixes.is_empty() {
                    return Err(ValidationError::MixRequired(id));
                }
                if mixes.iter().any(|m| source.is_muted(*m)) {
                    return Ok(vec![]);
                }
                if source.linked {
                    // The dispatcher mirrors to the other mix
                    return dispatcher.set_volume(&id, Some(settings.selection.display_mix()), change);
                }
                let mut ids = Vec::new();
                for mix in mixes {
                    ids.extend(dispatcher.set_volume(&id, Some(mix), change)?);
                }
                Ok(ids)
            }
        }
    }

    /// Toggle mute on the selected mixes.
    pub fn press(&self) -> Result<Vec<u64>, ValidationError> {
        let id = self.core.device_id()?;
        let settings = self.settings();
        let view = self
            .core
            .client
            .view(&id)
            .ok_or_else(|| ValidationError::UnknownDevice(id.clone()))?;
        let dispatcher = self.core.client.dispatcher();

        let DeviceView::Source(source) = view else {
            return dispatcher.toggle_mute(&id, &[]);
        };

        let mixes = settings.selection.mixes();
        let muting = !mixes.iter().any(|m| source.is_muted(*m));
        let mut ids = Vec::new();
        if muting && !settings.mute_targets.is_empty() {
            // Route the mute to the configured targets still present
            let root = self.core.client.get("").unwrap_or_default();
            let live = live_target_ids(&root, settings.mute_targets.iter());
            if live.is_empty() {
                // Routing to nothing would mean routing to everything
                debug!(device = %id, "configured mute targets are all gone, keeping current routing");
            } else {
                if live.len() < settings.mute_targets.len() {
                    debug!(device = %id, "skipping mute targets that no longer exist");
                }
                for mix in &mixes {
                    ids.extend(dispatcher.set_mute_targets(&id, mix.mute_target(), &live)?);
                }
            }
        }
        ids.extend(dispatcher.toggle_mute(&id, &mixes)?);
        Ok(ids)
    }

    /// Smart bus cycle.
    pub fn long_press(&self) -> Result<BusSelection, ValidationError> {
        self.select(BusPress::Cycle)
    }

    pub fn select(&self, press: BusPress) -> Result<BusSelection, ValidationError> {
        let id = self.core.device_id()?;
        let current = self.settings().selection;
        let next = self.core.client.dispatcher().select_bus(&id, current, press)?;
        lock(&self.core.settings).selection = next;
        debug!(device = %id, from = ?current, to = ?next, "bus selection changed");
        self.core.render();
        Ok(next)
    }

    pub fn toggle_link(&self) -> Result<Vec<u64>, ValidationError> {
        let id = self.core.device_id()?;
        self.core.client.dispatcher().toggle_link(&id)
    }

    pub fn render_state(&self) -> Option<RenderState> {
        self.core.render_state()
    }
}

impl Drop for Control {
    fn drop(&mut self) {
        self.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weaverproto::status::SOURCES_PATH;

    fn source(linked: bool, muted: &[&str]) -> DeviceView {
        let device = DeviceSummary {
            id: "src1".into(),
            name: "Music".into(),
            kind: DeviceKind::Source,
            path: format!("{SOURCES_PATH}/0"),
            physical: false,
        };
        let root = json!({"audio": {"profile": {"devices": {"sources": {"virtual_devices": [{
            "description": {"id": "src1", "name": "Music"},
            "volumes": {"volume": {"A": 30, "B": 60}, "volumes_linked": if linked { json!(1.0) } else { json!(null) }},
            "mute_states": {"mute_state": muted, "mute_targets": {"TargetA": [], "TargetB": []}}
        }]}}}}});
        DeviceView::read(&root, &device)
    }

    #[test]
    fn display_follows_b_when_selected() {
        let view = source(false, &[]);
        assert_eq!(render_state(&view, BusSelection::A, 0).display_value, 30);
        assert_eq!(render_state(&view, BusSelection::B, 0).display_value, 60);
        assert_eq!(render_state(&view, BusSelection::Both, 0).display_value, 60);
    }

    #[test]
    fn muted_means_any_selected_mix() {
        let view = source(false, &["TargetB"]);
        assert!(!render_state(&view, BusSelection::A, 0).muted);
        assert!(render_state(&view, BusSelection::B, 0).muted);
        assert!(render_state(&view, BusSelection::Both, 0).muted);

        let linked = source(true, &["TargetA"]);
        let state = render_state(&linked, BusSelection::Both, 7);
        assert!(!state.muted);
        assert!(state.linked);
        assert_eq!(state.level, 7);
    }

    #[test]
    fn settings_from_config() {
        let config = ControlConfig {
            device_id: Some("src1".into()),
            mixes: vec!["A".into(), "B".into()],
            volume_step: 50,
            mute_targets: vec!["hp".into()],
            ..ControlConfig::default()
        };
        let settings = ControlSettings::from_config(&config);
        assert_eq!(settings.selection, BusSelection::Both);
        assert_eq!(settings.volume_step, 20);
        assert!(settings.mute_targets.contains("hp"));
    }
}
