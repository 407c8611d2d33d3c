//! The client facade.
//!
//! Architecture: one pipeline task owns the [`Decoder`] and is the only
//! writer of the document. It consumes session events, applies frames,
//! resolves intents, and hands changed paths to the fan-out. A sweep tick
//! on the same task expires intents and re-asks for an overdue snapshot.
//!
//! ```text
//! socket -> Session -> events -> pipeline -> Document (RwLock)
//!                                    |-> Dispatcher (pending intents)
//!                                    '-> Fanout -> subscriber tasks
//! ```

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use weaverconf::InfraConfig;
use weaverproto::{
    find_device_by_name, list_devices, DeviceSummary, DeviceView, Document, RequestEnvelope,
};

use crate::decoder::{Decoded, Decoder};
use crate::dispatcher::{Dispatcher, RequestIds};
use crate::fanout::{Fanout, Subscription, Update};
use crate::meter::MeterFeed;
use crate::session::{HealthSnapshot, Session, SessionEvent, SessionSettings, SessionState};
use crate::transport::{Connector, WsConnector};
use crate::util::{lock, read};

/// How often pending intents are checked against their deadlines.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

const EVENT_BUFFER: usize = 256;

/// Everything the client needs besides its connectors.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub session: SessionSettings,
    pub meter: SessionSettings,
    pub command_timeout: Duration,
    pub snapshot_timeout: Duration,
}

impl ClientSettings {
    pub fn from_config(infra: &InfraConfig) -> Self {
        Self {
            session: SessionSettings::from_config("daemon", &infra.session),
            meter: SessionSettings::from_config("meter", &infra.session),
            command_timeout: infra.session.command_timeout(),
            snapshot_timeout: infra.session.snapshot_timeout(),
        }
    }
}

pub struct WeaverClient {
    document: Arc<RwLock<Document>>,
    session: Arc<Session>,
    meter: Option<MeterFeed>,
    dispatcher: Arc<Dispatcher>,
    fanout: Fanout,
    baseline: watch::Sender<bool>,
    cancel: CancellationToken,
    pipeline: Mutex<Option<Pipeline>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WeaverClient {
    /// Client for the daemon named in `infra`, with the meter stream.
    pub fn new(infra: &InfraConfig) -> Self {
        let main = Arc::new(WsConnector::new(infra.daemon.api_url()));
        let meter = Arc::new(WsConnector::new(infra.daemon.meter_url()));
        Self::with_connectors(main, Some(meter), ClientSettings::from_config(infra))
    }

    pub fn with_connectors(
        main: Arc<dyn Connector>,
        meter: Option<Arc<dyn Connector>>,
        settings: ClientSettings,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let document = Arc::new(RwLock::new(Document::new()));
        let session = Arc::new(Session::new(main, settings.session.clone(), events_tx));
        let fanout = Fanout::new();
        let request_ids = Arc::new(RequestIds::new());
        let dispatcher = Arc::new(Dispatcher::new(
            document.clone(),
            session.clone(),
            fanout.clone(),
            request_ids.clone(),
            settings.command_timeout,
        ));
        let meter = meter.map(|connector| MeterFeed::new(connector, settings.meter.clone(), fanout.clone()));
        let (baseline, _) = watch::channel(false);
        let cancel = CancellationToken::new();

        let pipeline = Pipeline {
            events: events_rx,
            decoder: Decoder::new(),
            document: document.clone(),
            session: session.clone(),
            dispatcher: dispatcher.clone(),
            fanout: fanout.clone(),
            request_ids,
            baseline: baseline.clone(),
            snapshot_timeout: settings.snapshot_timeout,
            snapshot_deadline: None,
            cancel: cancel.clone(),
        };

        Self {
            document,
            session,
            meter,
            dispatcher,
            fanout,
            baseline,
            cancel,
            pipeline: Mutex::new(Some(pipeline)),
            task: Mutex::new(None),
        }
    }

    /// Connect and keep connected. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let Some(pipeline) = lock(&self.pipeline).take() else {
            debug!("client already started");
            return;
        };
        *lock(&self.task) = Some(tokio::spawn(pipeline.run()));
        self.session.start();
        if let Some(meter) = &self.meter {
            meter.start();
        }
    }

    /// Refuse new intents, close both sockets and stop the pipeline.
    pub async fn shutdown(&self) {
        self.dispatcher.close();
        self.cancel.cancel();
        self.session.shutdown().await;
        if let Some(meter) = &self.meter {
            meter.shutdown().await;
        }
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("pipeline task ended abnormally: {}", e);
            }
        }
        info!("client shut down");
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.session.watch_state()
    }

    pub fn health(&self) -> HealthSnapshot {
        self.session.health()
    }

    pub fn meter_health(&self) -> Option<HealthSnapshot> {
        self.meter.as_ref().map(MeterFeed::health)
    }

    /// Has a snapshot ever landed?
    pub fn has_baseline(&self) -> bool {
        *self.baseline.borrow()
    }

    /// Wait until the first snapshot lands. False on timeout.
    pub async fn wait_for_baseline(&self, timeout: Duration) -> bool {
        let mut rx = self.baseline.subscribe();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        ready
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn devices(&self) -> Vec<DeviceSummary> {
        list_devices(read(&self.document).root())
    }

    pub fn find_device_by_name(&self, name: &str) -> Option<DeviceSummary> {
        find_device_by_name(read(&self.document).root(), name)
    }

    /// Device state including pending intents.
    pub fn view(&self, device_id: &str) -> Option<DeviceView> {
        self.dispatcher.view(device_id)
    }

    /// Copy of the value at a pointer in the confirmed tree.
    pub fn get(&self, path: &str) -> Option<Value> {
        read(&self.document).get(path).cloned()
    }

    pub fn revision(&self) -> u64 {
        read(&self.document).revision()
    }

    pub fn meter_level(&self, device_id: &str) -> Option<u8> {
        self.meter.as_ref().and_then(|m| m.level(device_id))
    }

    /// See [`Fanout::subscribe`].
    pub fn subscribe<F>(&self, prefix: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(Update) + Send + Sync + 'static,
    {
        self.fanout.subscribe(prefix, callback)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.fanout.unsubscribe(id)
    }
}

struct Pipeline {
    events: mpsc::Receiver<SessionEvent>,
    decoder: Decoder,
    document: Arc<RwLock<Document>>,
    session: Arc<Session>,
    dispatcher: Arc<Dispatcher>,
    fanout: Fanout,
    request_ids: Arc<RequestIds>,
    baseline: watch::Sender<bool>,
    snapshot_timeout: Duration,
    snapshot_deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Pipeline {
    async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!("pipeline started");
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },

                _ = sweep.tick() => self.sweep(Instant::now()),
            }
        }
        debug!("pipeline exiting");
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Resynced => self.request_snapshot(),
            SessionEvent::Frame(text) => self.handle_frame(&text),
            SessionEvent::Disconnected(e) => {
                debug!(error = %e, "dropping baseline until reconnect");
                self.decoder.connection_lost();
                self.dispatcher.connection_lost();
                self.snapshot_deadline = None;
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        match self.decoder.decode(text, &self.document) {
            Decoded::Changed(applied) => {
                self.dispatcher.reconcile(&applied);
                self.fanout.notify(&applied);
            }
            Decoded::Resynced(applied) => {
                self.snapshot_deadline = None;
                self.dispatcher.mark_baseline();
                self.dispatcher.reconcile_after_resync();
                self.fanout.notify(&applied);
                self.baseline.send_replace(true);
                info!(
                    devices = list_devices(read(&self.document).root()).len(),
                    "status snapshot installed"
                );
            }
            Decoded::Buffered => trace!("patch held until snapshot"),
            Decoded::Ignored => {}
            Decoded::Reply { id, reply } => {
                if !self.dispatcher.on_reply(id, &reply) {
                    trace!(id, ?reply, "reply for no pending intent");
                }
            }
            Decoded::Desync(e) => {
                warn!(error = %e, "patch did not apply, resyncing");
                self.request_snapshot();
            }
            Decoded::Malformed(e) => warn!(error = %e, "dropping malformed frame"),
        }
    }

    fn request_snapshot(&mut self) {
        let id = self.request_ids.next();
        let frame = match RequestEnvelope::get_status(id).to_text() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode status request");
                return;
            }
        };
        self.decoder.begin_resync(id);
        self.session.send(frame);
        self.snapshot_deadline = Some(Instant::now() + self.snapshot_timeout);
        debug!(request_id = id, "status snapshot requested");
    }

    fn sweep(&mut self, now: Instant) {
        self.dispatcher.expire(now);

        if let Some(deadline) = self.snapshot_deadline {
            if now >= deadline && self.decoder.is_awaiting_snapshot() {
                warn!("status snapshot overdue, asking again");
                self.request_snapshot();
            }
        }
    }
}
