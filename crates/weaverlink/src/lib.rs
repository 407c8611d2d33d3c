//! weaverlink - state-synchronization client for the PipeWeaver daemon
//!
//! Keeps a local mirror of the daemon's status tree current over a
//! self-healing WebSocket session, turns user intents into daemon commands
//! with optimistic rendering, and fans changes out to subscribers by path.
//!
//! Layers, bottom up:
//!
//! - [`transport`]: one connection attempt, split into text sink and stream
//! - [`session`]: reconnect loop, backoff, single writer task
//! - [`decoder`]: snapshot baseline, patch application, resync on desync
//! - [`dispatcher`]: intent validation, pending intents, the overlay
//! - [`fanout`]: per-subscriber delivery with coalescing
//! - [`meter`]: the level-meter socket
//! - [`client`]: [`WeaverClient`], which wires the above together
//! - [`control`]: one hardware control bound to one device
//!
//! ```no_run
//! use std::time::Duration;
//! use weaverconf::WeaverConfig;
//! use weaverlink::{VolumeChange, WeaverClient};
//! use weaverproto::Mix;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = WeaverConfig::load()?;
//! let client = WeaverClient::new(&config.infra);
//! client.start();
//! client.wait_for_baseline(Duration::from_secs(5)).await;
//!
//! client
//!     .dispatcher()
//!     .set_volume("music", Some(Mix::A), VolumeChange::Delta(5))?;
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod client;
pub mod control;
pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod meter;
pub mod session;
pub mod transport;

mod util;

pub use bus::{apply_press, next_bus, BusPress, BusSelection};
pub use client::{ClientSettings, WeaverClient};
pub use control::{render_state, Control, ControlSettings, RenderState};
pub use decoder::{Baseline, Decoded, Decoder};
pub use dispatcher::{Dispatcher, IntentField, Outbox, PendingIntent, RequestIds, VolumeChange};
pub use error::{ConnectionError, IntentOutcome, ValidationError};
pub use fanout::{meter_path, Fanout, IntentEvent, Subscription, SubscriberId, Update};
pub use meter::MeterFeed;
pub use session::{
    Backoff, HealthSnapshot, HealthTracker, Session, SessionEvent, SessionSettings, SessionState,
};
pub use transport::{
    memory_transport, Connection, Connector, MemoryConnector, MemoryListener, MemoryPeer,
    WsConnector,
};
