//! Connection lifecycle for one daemon socket.
//!
//! Architecture: a run task owns the connect/read/backoff loop and a single
//! writer task owns the outbound half of the current connection. Callers
//! never touch the socket; they enqueue text frames with [`Session::send`]
//! and read inbound frames as [`SessionEvent`]s.
//!
//! State machine:
//!
//! ```text
//! Disconnected --start()--> Connecting --ok--> Connected
//!      ^                        |                  |
//!      +------ backoff ---------+<-- read error ---+
//! any --shutdown()--> Closed
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use weaverconf::SessionConfig;

use crate::error::ConnectionError;
use crate::transport::{Connector, FrameSink, FrameStream};
use crate::util::lock;

/// Connection state, observable through [`Session::watch_state`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    /// Terminal, after `shutdown()`.
    Closed = 3,
}

impl SessionState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Closed,
            _ => SessionState::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
        }
    }
}

/// What the session reports to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A connection was (re)established. Nothing received earlier can be
    /// trusted until a fresh snapshot arrives.
    Resynced,
    /// One inbound text frame.
    Frame(String),
    /// The connection dropped; a reconnect is scheduled.
    Disconnected(ConnectionError),
}

/// Point-in-time health of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub state: SessionState,
    pub consecutive_failures: u32,
    /// Successful connections after the first one.
    pub reconnects: u64,
    pub last_frame_age: Option<Duration>,
}

/// Health tracking based on connection attempts and inbound traffic.
#[derive(Debug)]
pub struct HealthTracker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    connections: AtomicU64,
    last_frame: Mutex<Option<Instant>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Disconnected as u8),
            consecutive_failures: AtomicU32::new(0),
            connections: AtomicU64::new(0),
            last_frame: Mutex::new(None),
        }
    }

    pub fn get_state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.get_state() == SessionState::Connected
    }

    fn record_connected(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_frame(&self) {
        *lock(&self.last_frame) = Some(Instant::now());
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            state: self.get_state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            reconnects: self.connections.load(Ordering::Relaxed).saturating_sub(1),
            last_frame_age: lock(&self.last_frame).map(|t| t.elapsed()),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential reconnect backoff with multiplicative jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    /// Fraction of the delay to randomize by, e.g. 0.2 for ±20%
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Un-jittered delay for a given attempt number.
    ///
    /// attempt 1: base
    /// attempt n: min(base * 2^(n-1), max)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base.saturating_mul(multiplier);
        std::cmp::min(delay, self.max)
    }

    /// Advance to the next attempt and return its jittered delay.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.delay_for_attempt(self.attempt);
        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Timing knobs for a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Name for logs ("daemon", "meter")
    pub name: String,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub jitter: f64,
    pub connect_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(name: &str, config: &SessionConfig) -> Self {
        Self {
            name: name.to_string(),
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
            jitter: config.jitter,
            connect_timeout: config.connect_timeout(),
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_base, self.backoff_max, self.jitter)
    }
}

/// Messages for the writer task.
enum WriterCommand {
    /// A connection came up; write to this sink until told otherwise.
    Attach {
        sink: FrameSink,
        connection: CancellationToken,
    },
    /// The connection is gone; close and drop the sink.
    Detach,
    Frame(String),
}

/// Pieces that move into the tasks on `start()`.
struct Startup {
    events: mpsc::Sender<SessionEvent>,
    writer_rx: mpsc::UnboundedReceiver<WriterCommand>,
}

/// One persistent, self-healing connection.
pub struct Session {
    settings: SessionSettings,
    connector: Arc<dyn Connector>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    state_tx: watch::Sender<SessionState>,
    health: Arc<HealthTracker>,
    cancel: CancellationToken,
    startup: Mutex<Option<Startup>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Create a session in `Disconnected`. Nothing runs until `start()`.
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: SessionSettings,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Disconnected);

        Self {
            settings,
            connector,
            writer_tx,
            state_tx,
            health: Arc::new(HealthTracker::new()),
            cancel: CancellationToken::new(),
            startup: Mutex::new(Some(Startup { events, writer_rx })),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the connection loop. Calling it again, or after shutdown, does
    /// nothing.
    pub fn start(&self) {
        if self.cancel.is_cancelled() {
            warn!("{}: start() after shutdown ignored", self.settings.name);
            return;
        }
        let Some(Startup { events, writer_rx }) = lock(&self.startup).take() else {
            debug!("{}: already started", self.settings.name);
            return;
        };

        let writer = tokio::spawn(writer_task(
            writer_rx,
            self.cancel.clone(),
            self.settings.name.clone(),
        ));

        let runner = Runner {
            settings: self.settings.clone(),
            connector: self.connector.clone(),
            events,
            writer_tx: self.writer_tx.clone(),
            state_tx: self.state_tx.clone(),
            health: self.health.clone(),
            cancel: self.cancel.clone(),
        };
        let run = tokio::spawn(runner.run());

        lock(&self.tasks).extend([writer, run]);
    }

    /// Queue one outbound text frame. Frames queued while disconnected are
    /// dropped by the writer. Returns false after shutdown.
    pub fn send(&self, frame: String) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.writer_tx.send(WriterCommand::Frame(frame)).is_ok()
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop reading, cancel any backoff timer and wait for both tasks.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("{}: task ended abnormally: {}", self.settings.name, e);
            }
        }

        self.health.set_state(SessionState::Closed);
        self.state_tx.send_replace(SessionState::Closed);
        info!("{}: session closed", self.settings.name);
    }
}

/// How a connected phase ended.
enum ReadEnd {
    Shutdown,
    ConsumerGone,
    Lost(ConnectionError),
}

struct Runner {
    settings: SessionSettings,
    connector: Arc<dyn Connector>,
    events: mpsc::Sender<SessionEvent>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    state_tx: watch::Sender<SessionState>,
    health: Arc<HealthTracker>,
    cancel: CancellationToken,
}

impl Runner {
    fn set_state(&self, state: SessionState) {
        self.health.set_state(state);
        self.state_tx.send_replace(state);
    }

    async fn run(self) {
        let name = self.settings.name.clone();
        let url = self.connector.url().to_string();
        let mut backoff = self.settings.backoff();

        debug!("{}: session loop started for {}", name, url);

        loop {
            self.set_state(SessionState::Connecting);

            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = tokio::time::timeout(self.settings.connect_timeout, self.connector.connect()) => result,
            };

            let connection = match attempt {
                Ok(Ok(connection)) => connection,
                Ok(Err(e)) => {
                    self.connect_failed(&e);
                    if !self.sleep_backoff(&mut backoff).await {
                        break;
                    }
                    continue;
                }
                Err(_) => {
                    self.connect_failed(&ConnectionError::ConnectTimeout { url: url.clone() });
                    if !self.sleep_backoff(&mut backoff).await {
                        break;
                    }
                    continue;
                }
            };

            backoff.reset();
            self.health.record_connected();
            info!("{}: connected to {}", name, url);

            let connection_token = self.cancel.child_token();
            let _ = self.writer_tx.send(WriterCommand::Attach {
                sink: connection.sink,
                connection: connection_token.clone(),
            });
            self.set_state(SessionState::Connected);

            let end = if self.events.send(SessionEvent::Resynced).await.is_err() {
                ReadEnd::ConsumerGone
            } else {
                self.read_loop(connection.stream, &connection_token).await
            };

            let _ = self.writer_tx.send(WriterCommand::Detach);

            match end {
                ReadEnd::Shutdown => break,
                ReadEnd::ConsumerGone => {
                    debug!("{}: event consumer dropped, stopping", name);
                    break;
                }
                ReadEnd::Lost(e) => {
                    warn!(error = %e, "{}: connection lost", name);
                    self.set_state(SessionState::Disconnected);
                    if self.events.send(SessionEvent::Disconnected(e)).await.is_err() {
                        break;
                    }
                    if !self.sleep_backoff(&mut backoff).await {
                        break;
                    }
                }
            }
        }

        self.set_state(SessionState::Closed);
        debug!("{}: session loop exiting", name);
    }

    fn connect_failed(&self, e: &ConnectionError) {
        let failures = self.health.record_failure();
        // First failure is interesting, the rest of a streak is noise
        if failures == 1 {
            warn!(error = %e, "{}: connect failed", self.settings.name);
        } else {
            debug!(error = %e, failures, "{}: connect failed", self.settings.name);
        }
        self.set_state(SessionState::Disconnected);
    }

    /// Returns false when shutdown interrupted the wait.
    async fn sleep_backoff(&self, backoff: &mut Backoff) -> bool {
        let delay = backoff.next_delay();
        debug!(
            attempt = backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "{}: reconnecting after backoff",
            self.settings.name
        );
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn read_loop(&self, mut stream: FrameStream, connection: &CancellationToken) -> ReadEnd {
        loop {
            tokio::select! {
                _ = connection.cancelled() => {
                    return if self.cancel.is_cancelled() {
                        ReadEnd::Shutdown
                    } else {
                        ReadEnd::Lost(ConnectionError::Transport("write failed".to_string()))
                    };
                }
                item = stream.next() => match item {
                    Some(Ok(text)) => {
                        self.health.record_frame();
                        trace!("{}: frame received ({} bytes)", self.settings.name, text.len());
                        if self.events.send(SessionEvent::Frame(text)).await.is_err() {
                            return ReadEnd::ConsumerGone;
                        }
                    }
                    Some(Err(e)) => return ReadEnd::Lost(e),
                    None => return ReadEnd::Lost(ConnectionError::RemoteClosed),
                }
            }
        }
    }
}

/// The only task that ever writes to the socket.
async fn writer_task(
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    cancel: CancellationToken,
    name: String,
) {
    let mut current: Option<(FrameSink, CancellationToken)> = None;

    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = rx.recv() => command,
        };

        match command {
            Some(WriterCommand::Attach { sink, connection }) => {
                current = Some((sink, connection));
            }
            Some(WriterCommand::Detach) => {
                if let Some((mut sink, _)) = current.take() {
                    let _ = sink.close().await;
                }
            }
            Some(WriterCommand::Frame(frame)) => {
                let Some((sink, connection)) = current.as_mut() else {
                    debug!("{}: not connected, dropping outbound frame", name);
                    continue;
                };
                if let Err(e) = sink.send(frame).await {
                    warn!(error = %e, "{}: write failed, dropping connection", name);
                    connection.cancel();
                    current = None;
                }
            }
            None => break,
        }
    }

    if let Some((mut sink, _)) = current.take() {
        let _ = sink.close().await;
    }
    debug!("{}: writer exiting", name);
}
