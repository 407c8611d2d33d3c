//! Error and outcome types for the client core.

use thiserror::Error;
use weaverproto::DeviceKind;

/// Transport failures. Always retried by the session, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("connecting to {url} timed out")]
    ConnectTimeout { url: String },

    /// Socket-level read or write failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Binary frame, invalid UTF-8, or a broken WebSocket framing.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("connection closed by remote")]
    RemoteClosed,
}

/// Why an intent was refused before anything was sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no device with id {0:?}")]
    UnknownDevice(String),

    #[error("device {device:?} is not a {expected:?}")]
    WrongKind { device: String, expected: DeviceKind },

    #[error("source device {0:?} needs a mix (A or B)")]
    MixRequired(String),

    #[error("no mute target with id {0:?}")]
    UnknownTarget(String),

    #[error("no status received from the daemon yet")]
    NoBaseline,

    #[error("client is shut down")]
    Closed,
}

/// How a pending intent ended. Delivered to subscribers of the intent's path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentOutcome {
    /// The daemon reached the desired value.
    Confirmed,
    /// Another value landed first (another client, or a newer local intent).
    Superseded,
    /// The daemon answered with an error.
    Rejected(String),
    /// Nothing confirmed the intent before its deadline. Not retried.
    TimedOut,
}
