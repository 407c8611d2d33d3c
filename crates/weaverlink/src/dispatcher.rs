//! Intent dispatch with optimistic rendering.
//!
//! An intent is validated against the mirrored tree, turned into one or
//! more daemon commands, and recorded as a [`PendingIntent`]. Until the
//! daemon's own patch stream resolves it, the intent's desired value
//! shadows the tree in [`Dispatcher::view`].
//!
//! Resolution:
//!
//! - a patch touching the intent's path with the desired value: `Confirmed`
//! - a patch with another value once every command was acknowledged, a
//!   newer intent on the same value, or the device disappearing:
//!   `Superseded`
//! - an `Err` reply: `Rejected`
//! - nothing before the deadline: `TimedOut`, delivered once, never retried
//!
//! Across a reconnect, intents that the fresh snapshot already satisfies
//! are confirmed; the rest are re-sent once with their original deadline.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use weaverproto::{
    find_device, mute_target_candidates, normalize_volume, AppliedPaths, DaemonCommand,
    DeviceKind, DeviceSummary, DeviceView, Document, Mix, MuteState, MuteTarget, Reply,
    RequestEnvelope, PATCH_ID,
};

use crate::bus::{apply_press, BusPress, BusSelection};
use crate::error::{IntentOutcome, ValidationError};
use crate::fanout::{Fanout, IntentEvent};
use crate::session::Session;
use crate::util::{lock, read};

/// Where outbound frames go. Implemented by [`Session`]; tests record.
pub trait Outbox: Send + Sync {
    /// Queue one frame. False if it can never be delivered.
    fn send(&self, frame: String) -> bool;
}

impl Outbox for Session {
    fn send(&self, frame: String) -> bool {
        Session::send(self, frame)
    }
}

/// Request id allocator shared by commands and snapshot requests.
#[derive(Debug, Default)]
pub struct RequestIds(AtomicU64);

impl RequestIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        loop {
            let id = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 && id != PATCH_ID {
                return id;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeChange {
    /// Relative step, may be negative.
    Delta(i32),
    Absolute(u8),
}

impl VolumeChange {
    /// New volume, clamped to 0..=100.
    pub fn apply(self, current: u8) -> u8 {
        match self {
            VolumeChange::Delta(delta) => i32::from(current).saturating_add(delta).clamp(0, 100) as u8,
            VolumeChange::Absolute(value) => value.min(100),
        }
    }
}

/// Which value of a device an intent changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IntentField {
    /// `None` for targets.
    Volume(Option<Mix>),
    MuteState,
    MuteTargets(MuteTarget),
    Linked,
}

impl IntentField {
    /// Current pointer of this field. Device pointers carry an array index,
    /// so this is re-derived whenever the tree changes shape.
    pub fn path(self, device: &DeviceSummary) -> String {
        match self {
            IntentField::Volume(mix) => device.volume_path(mix),
            IntentField::MuteState => device.mute_state_path(),
            IntentField::MuteTargets(mute_target) => device.mute_targets_path(mute_target),
            IntentField::Linked => device.linked_path(),
        }
    }

    fn matches(self, desired: &Value, actual: Option<&Value>) -> bool {
        match self {
            IntentField::Volume(_) => match (actual.and_then(normalize_volume), normalize_volume(desired)) {
                (Some(have), Some(want)) => have == want,
                _ => false,
            },
            // Only null-ness matters; the daemon stores a ratio
            IntentField::Linked => actual.map_or(true, Value::is_null) == desired.is_null(),
            IntentField::MuteState | IntentField::MuteTargets(_) => match (as_set(desired), actual.and_then(as_set)) {
                (Some(want), Some(have)) => want == have,
                (Some(want), None) => want.is_empty() && actual.map_or(true, Value::is_null),
                (None, _) => actual == Some(desired),
            },
        }
    }
}

fn as_set(value: &Value) -> Option<BTreeSet<String>> {
    value.as_array().map(|items| {
        items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect()
    })
}

fn string_array<'a, I>(items: I) -> Value
where
    I: IntoIterator<Item = &'a str>,
{
    Value::Array(items.into_iter().map(Value::from).collect())
}

/// One dispatched, unresolved intent.
#[derive(Debug, Clone)]
pub struct PendingIntent {
    pub id: u64,
    pub device_id: String,
    pub field: IntentField,
    /// Pointer as of the last reconcile.
    pub path: String,
    pub desired: Value,
    pub dispatched_at: Instant,
    pub deadline: Instant,
    /// Every command was acknowledged on the current connection.
    pub confirmed: bool,
    pub commands: Vec<DaemonCommand>,
    awaiting: BTreeSet<u64>,
    /// A different value landed on the path while commands were in flight.
    contested: bool,
    resent: bool,
}

impl PendingIntent {
    pub fn was_resent(&self) -> bool {
        self.resent
    }

    fn into_event(self, outcome: IntentOutcome) -> IntentEvent {
        IntentEvent {
            intent_id: self.id,
            device_id: self.device_id,
            path: self.path,
            outcome,
        }
    }
}

struct Draft {
    field: IntentField,
    desired: Value,
    commands: Vec<DaemonCommand>,
}

#[derive(Default)]
struct Ledger {
    intents: BTreeMap<u64, PendingIntent>,
    /// request id -> intent id
    requests: HashMap<u64, u64>,
    next_intent: u64,
}

impl Ledger {
    fn remove(&mut self, id: u64) -> Option<PendingIntent> {
        let intent = self.intents.remove(&id)?;
        for request_id in &intent.awaiting {
            self.requests.remove(request_id);
        }
        Some(intent)
    }

    fn finish(&mut self, id: u64, outcome: IntentOutcome, events: &mut Vec<IntentEvent>) {
        if let Some(intent) = self.remove(id) {
            events.push(intent.into_event(outcome));
        }
    }
}

/// Device reads through the optimistic overlay.
fn overlay_view(device: &DeviceSummary, root: &Value, ledger: &Ledger) -> DeviceView {
    let shadows: HashMap<String, &Value> = ledger
        .intents
        .values()
        .filter(|intent| intent.device_id == device.id)
        .map(|intent| (intent.field.path(device), &intent.desired))
        .collect();

    DeviceView::read_with(device, |path| {
        shadows
            .get(path)
            .map(|value| (*value).clone())
            .or_else(|| root.pointer(path).cloned())
    })
}

fn require_source(device: &DeviceSummary) -> Result<(), ValidationError> {
    if device.kind == DeviceKind::Source {
        Ok(())
    } else {
        Err(ValidationError::WrongKind {
            device: device.id.clone(),
            expected: DeviceKind::Source,
        })
    }
}

pub struct Dispatcher {
    document: Arc<RwLock<Document>>,
    outbox: Arc<dyn Outbox>,
    fanout: Fanout,
    request_ids: Arc<RequestIds>,
    command_timeout: Duration,
    ledger: Mutex<Ledger>,
    has_baseline: AtomicBool,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        document: Arc<RwLock<Document>>,
        outbox: Arc<dyn Outbox>,
        fanout: Fanout,
        request_ids: Arc<RequestIds>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            document,
            outbox,
            fanout,
            request_ids,
            command_timeout,
            ledger: Mutex::new(Ledger::default()),
            has_baseline: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// The first snapshot landed; intents may be validated from now on.
    pub fn mark_baseline(&self) {
        self.has_baseline.store(true, Ordering::Release);
    }

    pub fn has_baseline(&self) -> bool {
        self.has_baseline.load(Ordering::Acquire)
    }

    /// Refuse every later intent and forget pending ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut ledger = lock(&self.ledger);
        ledger.intents.clear();
        ledger.requests.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> Vec<PendingIntent> {
        lock(&self.ledger).intents.values().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.ledger).intents.len()
    }

    /// Device state with pending intents applied.
    pub fn view(&self, device_id: &str) -> Option<DeviceView> {
        let doc = read(&self.document);
        let device = find_device(doc.root(), device_id)?;
        let ledger = lock(&self.ledger);
        Some(overlay_view(&device, doc.root(), &ledger))
    }

    /// Device state as last confirmed by the daemon.
    pub fn confirmed_view(&self, device_id: &str) -> Option<DeviceView> {
        let doc = read(&self.document);
        let device = find_device(doc.root(), device_id)?;
        Some(DeviceView::read(doc.root(), &device))
    }

    fn guard(&self) -> Result<(), ValidationError> {
        if self.is_closed() {
            return Err(ValidationError::Closed);
        }
        if !self.has_baseline() {
            return Err(ValidationError::NoBaseline);
        }
        Ok(())
    }

    /// Validate, then build drafts from the overlay view.
    fn prepare<F>(&self, device_id: &str, build: F) -> Result<Vec<u64>, ValidationError>
    where
        F: FnOnce(&DeviceSummary, &Value, DeviceView) -> Result<Vec<Draft>, ValidationError>,
    {
        self.guard()?;
        let (device, drafts) = {
            let doc = read(&self.document);
            let device = find_device(doc.root(), device_id)
                .ok_or_else(|| ValidationError::UnknownDevice(device_id.to_string()))?;
            let view = {
                let ledger = lock(&self.ledger);
                overlay_view(&device, doc.root(), &ledger)
            };
            let drafts = build(&device, doc.root(), view)?;
            (device, drafts)
        };
        Ok(self.dispatch(&device, drafts))
    }

    pub fn set_volume(
        &self,
        device_id: &str,
        mix: Option<Mix>,
        change: VolumeChange,
    ) -> Result<Vec<u64>, ValidationError> {
        self.prepare(device_id, |device, _root, view| match view {
            DeviceView::Target(target) => {
                let volume = change.apply(target.volume);
                if volume == target.volume {
                    return Ok(vec![]);
                }
                Ok(vec![Draft {
                    field: IntentField::Volume(None),
                    desired: Value::from(volume),
                    commands: vec![DaemonCommand::SetTargetVolume(device.id.clone(), volume)],
                }])
            }
            DeviceView::Source(source) => {
                let mix = mix.ok_or_else(|| ValidationError::MixRequired(device.id.clone()))?;
                let volume = change.apply(source.volume(mix));
                // Linked mixes move together
                let mixes = if source.linked {
                    vec![mix, mix.other()]
                } else {
                    vec![mix]
                };
                Ok(mixes
                    .into_iter()
                    .filter(|m| source.volume(*m) != volume)
                    .map(|m| Draft {
                        field: IntentField::Volume(Some(m)),
                        desired: Value::from(volume),
                        commands: vec![DaemonCommand::SetSourceVolume(device.id.clone(), m, volume)],
                    })
                    .collect())
            }
        })
    }

    /// Targets flip. Sources unmute the selected mixes that are muted, or
    /// mute them all when none is.
    pub fn toggle_mute(&self, device_id: &str, mixes: &[Mix]) -> Result<Vec<u64>, ValidationError> {
        self.prepare(device_id, |device, _root, view| match view {
            DeviceView::Target(target) => {
                let next = MuteState::from_muted(!target.muted);
                Ok(vec![Draft {
                    field: IntentField::MuteState,
                    desired: Value::from(next.as_str()),
                    commands: vec![DaemonCommand::SetTargetMuteState(device.id.clone(), next)],
                }])
            }
            DeviceView::Source(source) => {
                let selected: BTreeSet<Mix> = mixes.iter().copied().collect();
                if selected.is_empty() {
                    return Err(ValidationError::MixRequired(device.id.clone()));
                }

                let muted: Vec<Mix> = selected
                    .iter()
                    .copied()
                    .filter(|m| source.is_muted(*m))
                    .collect();
                let mut next = source.muted.clone();
                let commands = if muted.is_empty() {
                    selected
                        .iter()
                        .map(|m| {
                            next.insert(m.mute_target());
                            DaemonCommand::AddSourceMuteTarget(device.id.clone(), m.mute_target())
                        })
                        .collect()
                } else {
                    muted
                        .iter()
                        .map(|m| {
                            next.remove(&m.mute_target());
                            DaemonCommand::DelSourceMuteTarget(device.id.clone(), m.mute_target())
                        })
                        .collect()
                };

                Ok(vec![Draft {
                    field: IntentField::MuteState,
                    desired: string_array(next.iter().map(|t| t.as_str())),
                    commands,
                }])
            }
        })
    }

    /// Route a source's mute channel to exactly `targets`.
    pub fn set_mute_targets(
        &self,
        device_id: &str,
        mute_target: MuteTarget,
        targets: &BTreeSet<String>,
    ) -> Result<Vec<u64>, ValidationError> {
        self.prepare(device_id, |device, root, view| {
            require_source(device)?;
            let DeviceView::Source(source) = view else {
                return Ok(vec![]);
            };

            let known: BTreeSet<String> = mute_target_candidates(root)
                .into_iter()
                .map(|d| d.id)
                .collect();
            if let Some(unknown) = targets.iter().find(|t| !known.contains(*t)) {
                return Err(ValidationError::UnknownTarget(unknown.clone()));
            }

            // Removals include ids whose device is gone
            let current = source.mute_targets(mute_target);
            let commands: Vec<DaemonCommand> = targets
                .difference(current)
                .map(|t| DaemonCommand::AddMuteTargetNode(device.id.clone(), mute_target, t.clone()))
                .chain(
                    current
                        .difference(targets)
                        .map(|t| DaemonCommand::DelMuteTargetNode(device.id.clone(), mute_target, t.clone())),
                )
                .collect();
            if commands.is_empty() {
                return Ok(vec![]);
            }

            Ok(vec![Draft {
                field: IntentField::MuteTargets(mute_target),
                desired: string_array(targets.iter().map(String::as_str)),
                commands,
            }])
        })
    }

    pub fn set_volume_linked(&self, device_id: &str, linked: bool) -> Result<Vec<u64>, ValidationError> {
        self.link(device_id, Some(linked))
    }

    pub fn toggle_link(&self, device_id: &str) -> Result<Vec<u64>, ValidationError> {
        self.link(device_id, None)
    }

    fn link(&self, device_id: &str, want: Option<bool>) -> Result<Vec<u64>, ValidationError> {
        self.prepare(device_id, |device, _root, view| {
            require_source(device)?;
            let DeviceView::Source(source) = view else {
                return Ok(vec![]);
            };

            let linked = want.unwrap_or(!source.linked);
            if linked == source.linked {
                return Ok(vec![]);
            }
            Ok(vec![Draft {
                field: IntentField::Linked,
                desired: if linked { Value::Bool(true) } else { Value::Null },
                commands: vec![DaemonCommand::SetSourceVolumeLinked(device.id.clone(), linked)],
            }])
        })
    }

    /// Next bus selection for a source. Uses the confirmed link state and
    /// sends nothing.
    pub fn select_bus(
        &self,
        device_id: &str,
        current: BusSelection,
        press: BusPress,
    ) -> Result<BusSelection, ValidationError> {
        self.guard()?;
        let doc = read(&self.document);
        let device = find_device(doc.root(), device_id)
            .ok_or_else(|| ValidationError::UnknownDevice(device_id.to_string()))?;
        require_source(&device)?;

        let linked = DeviceView::read(doc.root(), &device)
            .as_source()
            .is_some_and(|s| s.linked);
        Ok(apply_press(current, linked, press))
    }

    fn dispatch(&self, device: &DeviceSummary, drafts: Vec<Draft>) -> Vec<u64> {
        if drafts.is_empty() {
            return vec![];
        }

        let now = Instant::now();
        let mut events = Vec::new();
        let mut changed = AppliedPaths::new();
        let mut ids = Vec::with_capacity(drafts.len());

        {
            let mut guard = lock(&self.ledger);
            let ledger: &mut Ledger = &mut guard;

            for draft in drafts {
                let stale: Vec<u64> = ledger
                    .intents
                    .values()
                    .filter(|p| p.device_id == device.id && p.field == draft.field)
                    .map(|p| p.id)
                    .collect();
                for id in stale {
                    ledger.finish(id, IntentOutcome::Superseded, &mut events);
                }

                ledger.next_intent += 1;
                let path = draft.field.path(device);
                let mut intent = PendingIntent {
                    id: ledger.next_intent,
                    device_id: device.id.clone(),
                    field: draft.field,
                    path: path.clone(),
                    desired: draft.desired,
                    dispatched_at: now,
                    deadline: now + self.command_timeout,
                    confirmed: false,
                    commands: draft.commands,
                    awaiting: BTreeSet::new(),
                    contested: false,
                    resent: false,
                };
                self.transmit(&mut ledger.requests, &mut intent);

                debug!(
                    intent = intent.id,
                    device = %intent.device_id,
                    field = ?intent.field,
                    desired = %intent.desired,
                    commands = intent.commands.len(),
                    "intent dispatched"
                );
                ids.push(intent.id);
                ledger.intents.insert(intent.id, intent);
                changed.insert(path);
            }
        }

        self.emit(events);
        // Optimistic render
        self.fanout.notify(&changed);
        ids
    }

    /// Send every command of `intent` under fresh request ids.
    fn transmit(&self, requests: &mut HashMap<u64, u64>, intent: &mut PendingIntent) {
        for request_id in std::mem::take(&mut intent.awaiting) {
            requests.remove(&request_id);
        }
        intent.confirmed = false;

        for command in &intent.commands {
            let request_id = self.request_ids.next();
            let frame = match RequestEnvelope::command(request_id, command.clone()).to_text() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, command = command.name(), "failed to encode command");
                    continue;
                }
            };
            if !self.outbox.send(frame) {
                warn!(command = command.name(), "outbox closed, command not sent");
            }
            trace!(request_id, intent = intent.id, command = command.name(), "command queued");
            intent.awaiting.insert(request_id);
            requests.insert(request_id, intent.id);
        }
    }

    fn emit(&self, events: Vec<IntentEvent>) {
        for event in events {
            match &event.outcome {
                IntentOutcome::Confirmed => trace!(intent = event.intent_id, "intent confirmed"),
                IntentOutcome::Superseded => debug!(intent = event.intent_id, path = %event.path, "intent superseded"),
                IntentOutcome::Rejected(reason) => {
                    warn!(intent = event.intent_id, device = %event.device_id, %reason, "daemon rejected command")
                }
                IntentOutcome::TimedOut => {
                    warn!(intent = event.intent_id, device = %event.device_id, path = %event.path, "intent timed out")
                }
            }
            self.fanout.notify_outcome(event);
        }
    }

    /// Resolve intents against a committed patch batch.
    pub fn reconcile(&self, applied: &AppliedPaths) {
        if applied.is_empty() {
            return;
        }

        let mut events = Vec::new();
        {
            let doc = read(&self.document);
            let mut ledger = lock(&self.ledger);
            let ids: Vec<u64> = ledger.intents.keys().copied().collect();

            for id in ids {
                let outcome = {
                    let Some(intent) = ledger.intents.get_mut(&id) else {
                        continue;
                    };
                    match find_device(doc.root(), &intent.device_id) {
                        None => Some(IntentOutcome::Superseded),
                        Some(device) => {
                            intent.path = intent.field.path(&device);
                            if !applied.intersects(&intent.path) {
                                None
                            } else if intent.field.matches(&intent.desired, doc.get(&intent.path)) {
                                Some(IntentOutcome::Confirmed)
                            } else if intent.awaiting.is_empty() {
                                Some(IntentOutcome::Superseded)
                            } else {
                                // Decided when the last ack arrives. Multi-command
                                // intents pass through partial states on their own.
                                if intent.commands.len() == 1 {
                                    intent.contested = true;
                                }
                                None
                            }
                        }
                    }
                };
                if let Some(outcome) = outcome {
                    ledger.finish(id, outcome, &mut events);
                }
            }
        }
        self.emit(events);
    }

    /// Handle a reply. Returns false if no intent is waiting for `request_id`.
    pub fn on_reply(&self, request_id: u64, reply: &Reply) -> bool {
        let mut events = Vec::new();
        {
            let doc = read(&self.document);
            let mut ledger = lock(&self.ledger);
            let Some(intent_id) = ledger.requests.remove(&request_id) else {
                return false;
            };

            let outcome = match reply {
                Reply::Err(message) => Some(IntentOutcome::Rejected(message.clone())),
                Reply::Ok | Reply::Other(_) => {
                    if let Reply::Other(value) = reply {
                        trace!(request_id, %value, "treating reply as acknowledgement");
                    }
                    ledger.intents.get_mut(&intent_id).and_then(|intent| {
                        intent.awaiting.remove(&request_id);
                        if !intent.awaiting.is_empty() {
                            return None;
                        }
                        intent.confirmed = true;
                        if intent.field.matches(&intent.desired, doc.get(&intent.path)) {
                            Some(IntentOutcome::Confirmed)
                        } else if intent.contested {
                            Some(IntentOutcome::Superseded)
                        } else {
                            None
                        }
                    })
                }
            };
            if let Some(outcome) = outcome {
                ledger.finish(intent_id, outcome, &mut events);
            }
        }
        self.emit(events);
        true
    }

    /// Drop intents past their deadline. Returns how many timed out.
    pub fn expire(&self, now: Instant) -> usize {
        let mut events = Vec::new();
        {
            let mut ledger = lock(&self.ledger);
            let overdue: Vec<u64> = ledger
                .intents
                .values()
                .filter(|intent| intent.deadline <= now)
                .map(|intent| intent.id)
                .collect();
            for id in overdue {
                ledger.finish(id, IntentOutcome::TimedOut, &mut events);
            }
        }
        let expired = events.len();
        self.emit(events);
        expired
    }

    /// The connection dropped: nothing in flight will be acknowledged.
    pub fn connection_lost(&self) {
        let mut guard = lock(&self.ledger);
        let ledger: &mut Ledger = &mut guard;
        ledger.requests.clear();
        for intent in ledger.intents.values_mut() {
            intent.confirmed = false;
            intent.contested = false;
            intent.awaiting.clear();
        }
        if !ledger.intents.is_empty() {
            info!(pending = ledger.intents.len(), "connection lost with intents in flight");
        }
    }

    /// A fresh snapshot replaced the tree.
    pub fn reconcile_after_resync(&self) {
        let mut events = Vec::new();
        {
            let doc = read(&self.document);
            let mut guard = lock(&self.ledger);
            let ledger: &mut Ledger = &mut guard;
            let ids: Vec<u64> = ledger.intents.keys().copied().collect();

            for id in ids {
                let outcome = {
                    let Some(intent) = ledger.intents.get_mut(&id) else {
                        continue;
                    };
                    match find_device(doc.root(), &intent.device_id) {
                        None => Some(IntentOutcome::Superseded),
                        Some(device) => {
                            intent.path = intent.field.path(&device);
                            if intent.field.matches(&intent.desired, doc.get(&intent.path)) {
                                Some(IntentOutcome::Confirmed)
                            } else {
                                if !intent.confirmed && !intent.resent {
                                    debug!(intent = intent.id, "re-sending intent after resync");
                                    intent.resent = true;
                                    self.transmit(&mut ledger.requests, intent);
                                }
                                None
                            }
                        }
                    }
                };
                if let Some(outcome) = outcome {
                    ledger.finish(id, outcome, &mut events);
                }
            }
        }
        self.emit(events);
    }
}
