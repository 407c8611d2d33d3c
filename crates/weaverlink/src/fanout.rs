//! Path-prefix subscriptions with per-subscriber delivery tasks.
//!
//! Each subscriber gets its own task and a coalescing mailbox, so a slow
//! subscriber only delays itself:
//!
//! - structural changes accumulate as a set of paths
//! - meter levels keep only the latest value per device
//! - intent outcomes queue in order
//!
//! A subscriber's callback never runs concurrently with itself. Once
//! `unsubscribe` returns, no new delivery starts; one already running is
//! left to finish.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};
use weaverproto::patch::{is_ancestor_or_self, join_pointer};
use weaverproto::AppliedPaths;

use crate::error::IntentOutcome;
use crate::util::lock;

pub type SubscriberId = u64;

/// Virtual tree root for meter levels.
pub const METERS_PREFIX: &str = "/meters";

/// `/meters/<device_id>`
pub fn meter_path(device_id: &str) -> String {
    join_pointer(METERS_PREFIX, device_id)
}

/// How one pending intent ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentEvent {
    pub intent_id: u64,
    pub device_id: String,
    pub path: String,
    pub outcome: IntentOutcome,
}

/// Everything that piled up for one subscriber since its last delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    pub paths: Vec<String>,
    pub meters: Vec<(String, u8)>,
    pub intents: Vec<IntentEvent>,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.meters.is_empty() && self.intents.is_empty()
    }
}

#[derive(Default)]
struct Mailbox {
    paths: BTreeSet<String>,
    meters: BTreeMap<String, u8>,
    intents: Vec<IntentEvent>,
}

impl Mailbox {
    fn take(&mut self) -> Update {
        Update {
            paths: std::mem::take(&mut self.paths).into_iter().collect(),
            meters: std::mem::take(&mut self.meters).into_iter().collect(),
            intents: std::mem::take(&mut self.intents),
        }
    }
}

struct Slot {
    prefix: String,
    mailbox: Mutex<Mailbox>,
    wake: Notify,
    active: AtomicBool,
}

impl Slot {
    fn overlaps(&self, path: &str) -> bool {
        is_ancestor_or_self(&self.prefix, path) || is_ancestor_or_self(path, &self.prefix)
    }

    fn close(&self) {
        self.active.store(false, Ordering::Release);
        self.wake.notify_one();
    }
}

#[derive(Default)]
struct Registry {
    slots: DashMap<SubscriberId, Arc<Slot>>,
    next_id: AtomicU64,
}

impl Registry {
    fn remove(&self, id: SubscriberId) -> bool {
        match self.slots.remove(&id) {
            Some((_, slot)) => {
                slot.close();
                true
            }
            None => false,
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for entry in self.slots.iter() {
            entry.value().close();
        }
    }
}

/// Subscriber registry. Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct Fanout {
    registry: Arc<Registry>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `callback` whenever something under `prefix` changes. Must be
    /// called inside a tokio runtime. Dropping the returned guard
    /// unsubscribes.
    pub fn subscribe<F>(&self, prefix: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(Update) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let slot = Arc::new(Slot {
            prefix: prefix.into(),
            mailbox: Mutex::new(Mailbox::default()),
            wake: Notify::new(),
            active: AtomicBool::new(true),
        });

        debug!(id, prefix = %slot.prefix, "subscriber added");
        self.registry.slots.insert(id, slot.clone());
        tokio::spawn(deliver(id, slot, callback));

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.registry.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.slots.len()
    }

    /// Schedule every subscriber whose prefix overlaps a changed path.
    pub fn notify(&self, applied: &AppliedPaths) {
        for entry in self.registry.slots.iter() {
            let slot = entry.value();
            let matching: Vec<&str> = applied.matching(&slot.prefix).collect();
            if matching.is_empty() {
                continue;
            }
            {
                let mut mailbox = lock(&slot.mailbox);
                mailbox.paths.extend(matching.into_iter().map(str::to_string));
            }
            slot.wake.notify_one();
        }
    }

    /// Latest-wins meter delivery under `/meters/<device_id>`.
    pub fn notify_meter(&self, device_id: &str, level: u8) {
        let path = meter_path(device_id);
        for entry in self.registry.slots.iter() {
            let slot = entry.value();
            if !slot.overlaps(&path) {
                continue;
            }
            lock(&slot.mailbox).meters.insert(device_id.to_string(), level);
            slot.wake.notify_one();
        }
    }

    /// Queue an intent outcome for subscribers of the intent's path.
    pub fn notify_outcome(&self, event: IntentEvent) {
        for entry in self.registry.slots.iter() {
            let slot = entry.value();
            if !slot.overlaps(&event.path) {
                continue;
            }
            lock(&slot.mailbox).intents.push(event.clone());
            slot.wake.notify_one();
        }
    }
}

/// Unsubscribes on drop.
pub struct Subscription {
    id: SubscriberId,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

async fn deliver<F>(id: SubscriberId, slot: Arc<Slot>, callback: F)
where
    F: Fn(Update) + Send + Sync + 'static,
{
    loop {
        slot.wake.notified().await;
        if !slot.active.load(Ordering::Acquire) {
            break;
        }

        let update = lock(&slot.mailbox).take();
        if update.is_empty() {
            continue;
        }

        trace!(
            id,
            paths = update.paths.len(),
            meters = update.meters.len(),
            intents = update.intents.len(),
            "delivering update"
        );
        if catch_unwind(AssertUnwindSafe(|| callback(update))).is_err() {
            warn!(id, "subscriber callback panicked");
        }
    }
    debug!(id, "subscriber worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn applied(paths: &[&str]) -> AppliedPaths {
        paths.iter().map(|p| p.to_string()).collect()
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Update>) -> Update {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("update not delivered")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn only_overlapping_prefixes_are_notified() {
        let fanout = Fanout::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let _a = fanout.subscribe("/devices/src1", move |u| {
            let _ = tx_a.send(u);
        });
        let _b = fanout.subscribe("/devices/src2", move |u| {
            let _ = tx_b.send(u);
        });

        fanout.notify(&applied(&["/devices/src1/volumes/A"]));

        let update = next(&mut rx_a).await;
        assert_eq!(update.paths, vec!["/devices/src1/volumes/A".to_string()]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn root_change_reaches_everyone() {
        let fanout = Fanout::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _s = fanout.subscribe("/devices/src1", move |u| {
            let _ = tx.send(u);
        });

        fanout.notify(&AppliedPaths::root());
        assert_eq!(next(&mut rx).await.paths, vec![String::new()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn meters_coalesce_latest_wins() {
        let fanout = Fanout::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = Arc::new(std::sync::Barrier::new(2));
        let worker_gate = gate.clone();
        let first = Arc::new(AtomicBool::new(true));

        let _s = fanout.subscribe(meter_path("src1"), move |u| {
            // Hold the first delivery so later levels pile up
            if first.swap(false, Ordering::SeqCst) {
                worker_gate.wait();
            }
            let _ = tx.send(u);
        });

        fanout.notify_meter("src1", 10);
        tokio::time::sleep(Duration::from_millis(20)).await;
        for level in [20, 30, 40] {
            fanout.notify_meter("src1", level);
        }
        fanout.notify_meter("other", 99);
        tokio::task::spawn_blocking(move || gate.wait()).await.unwrap();

        assert_eq!(next(&mut rx).await.meters, vec![("src1".to_string(), 10)]);
        assert_eq!(next(&mut rx).await.meters, vec![("src1".to_string(), 40)]);
    }

    #[tokio::test]
    async fn outcomes_queue_in_order() {
        let fanout = Fanout::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _s = fanout.subscribe("/devices", move |u| {
            let _ = tx.send(u);
        });

        for (intent_id, outcome) in [(1, IntentOutcome::Confirmed), (2, IntentOutcome::TimedOut)] {
            fanout.notify_outcome(IntentEvent {
                intent_id,
                device_id: "src1".into(),
                path: "/devices/src1/volume".into(),
                outcome,
            });
        }

        let mut seen = Vec::new();
        while seen.len() < 2 {
            seen.extend(next(&mut rx).await.intents.into_iter().map(|e| e.intent_id));
        }
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let fanout = Fanout::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = fanout.subscribe("/a", move |u| {
            let _ = tx.send(u);
        });
        assert_eq!(fanout.subscriber_count(), 1);

        drop(sub);
        assert_eq!(fanout.subscriber_count(), 0);
        fanout.notify(&applied(&["/a"]));

        // Worker exits and drops the sender
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(matches!(closed, Ok(None)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unsubscribe_during_callback_lets_it_finish() {
        let fanout = Fanout::new();
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let calls = Arc::new(AtomicU64::new(0));
        let worker_calls = calls.clone();

        let sub = fanout.subscribe("/a", move |_| {
            worker_calls.fetch_add(1, Ordering::SeqCst);
            let _ = started_tx.send(());
            let _ = lock(&release_rx).recv();
        });

        fanout.notify(&applied(&["/a"]));
        tokio::task::spawn_blocking(move || started_rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(fanout.unsubscribe(sub.id()));
        fanout.notify(&applied(&["/a"]));
        release_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_callback_keeps_worker_alive() {
        let fanout = Fanout::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _s = fanout.subscribe("/a", move |u: Update| {
            if u.paths.iter().any(|p| p == "/a/boom") {
                panic!("boom");
            }
            let _ = tx.send(u);
        });

        fanout.notify(&applied(&["/a/boom"]));
        tokio::time::sleep(Duration::from_millis(20)).await;
        fanout.notify(&applied(&["/a/ok"]));
        assert_eq!(next(&mut rx).await.paths, vec!["/a/ok".to_string()]);
    }
}
