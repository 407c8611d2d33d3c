//! Level meters from the daemon's second socket.
//!
//! Same reconnect loop as the main session, but there is no snapshot: each
//! frame is a standalone `{id, percent}` reading. Levels are transient and
//! are dropped when the socket goes away.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use weaverproto::parse_meter;

use crate::fanout::Fanout;
use crate::session::{HealthSnapshot, Session, SessionEvent, SessionSettings, SessionState};
use crate::transport::Connector;
use crate::util::lock;

/// Meter frames arrive at a high rate; keep the consumer well ahead.
const METER_EVENT_BUFFER: usize = 1024;

pub struct MeterFeed {
    session: Session,
    levels: Arc<DashMap<String, u8>>,
    fanout: Fanout,
    events: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl MeterFeed {
    pub fn new(connector: Arc<dyn Connector>, settings: SessionSettings, fanout: Fanout) -> Self {
        let (tx, rx) = mpsc::channel(METER_EVENT_BUFFER);
        Self {
            session: Session::new(connector, settings, tx),
            levels: Arc::new(DashMap::new()),
            fanout,
            events: Mutex::new(Some(rx)),
            consumer: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let Some(events) = lock(&self.events).take() else {
            return;
        };
        let consumer = tokio::spawn(consume(events, self.levels.clone(), self.fanout.clone()));
        *lock(&self.consumer) = Some(consumer);
        self.session.start();
    }

    /// Latest level for a device, if one arrived on the current connection.
    pub fn level(&self, device_id: &str) -> Option<u8> {
        self.levels.get(device_id).map(|entry| *entry.value())
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

    pub async fn shutdown(&self) {
        self.session.shutdown().await;
        // The session dropped its event sender, so the consumer drains and ends
        let consumer = lock(&self.consumer).take();
        if let Some(consumer) = consumer {
            let _ = consumer.await;
        }
        self.levels.clear();
    }
}

async fn consume(
    mut events: mpsc::Receiver<SessionEvent>,
    levels: Arc<DashMap<String, u8>>,
    fanout: Fanout,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Frame(text) => match parse_meter(&text) {
                Ok(reading) => {
                    trace!(device = %reading.id, level = reading.percent, "meter");
                    levels.insert(reading.id.clone(), reading.percent);
                    fanout.notify_meter(&reading.id, reading.percent);
                }
                Err(e) => debug!(error = %e, "dropping malformed meter frame"),
            },
            SessionEvent::Resynced => debug!("meter stream connected"),
            SessionEvent::Disconnected(e) => {
                debug!(error = %e, "meter stream lost, clearing levels");
                let stale: Vec<String> = levels.iter().map(|entry| entry.key().clone()).collect();
                levels.clear();
                for device_id in stale {
                    fanout.notify_meter(&device_id, 0);
                }
            }
        }
    }
    debug!("meter consumer exiting");
}
