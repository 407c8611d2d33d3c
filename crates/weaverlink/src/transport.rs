//! Text-frame transports.
//!
//! A [`Connector`] opens one connection and hands back a split pair: a sink
//! for outbound text frames and a stream of inbound ones. The session owns
//! the retry loop; connectors only ever make a single attempt.
//!
//! [`WsConnector`] talks to the daemon. [`memory_transport`] gives tests and
//! demos an in-process daemon end.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::trace;

use crate::error::ConnectionError;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = ConnectionError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ConnectionError>> + Send>>;

/// An open connection, already split for one reader and one writer.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Where this connector points, for logs.
    fn url(&self) -> &str;

    /// Make one connection attempt.
    async fn connect(&self) -> Result<Connection, ConnectionError>;
}

/// WebSocket connector for `ws://host:port/path` URLs.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<Connection, ConnectionError> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ConnectionError::Connect {
                url: self.url.clone(),
                message: e.to_string(),
            })?;

        let (sink, stream) = ws.split();

        let sink = sink
            .with(|text: String| future::ready(Ok::<_, tungstenite::Error>(Message::Text(text))))
            .sink_map_err(map_ws_error);

        let stream = stream.filter_map(|item| future::ready(classify_incoming(item)));

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Text frames pass through, control frames are skipped, anything else ends
/// the connection.
fn classify_incoming(
    item: Result<Message, tungstenite::Error>,
) -> Option<Result<String, ConnectionError>> {
    match item {
        Ok(Message::Text(text)) => Some(Ok(text)),
        Ok(Message::Binary(bytes)) => Some(Err(ConnectionError::Protocol(format!(
            "unexpected binary frame ({} bytes)",
            bytes.len()
        )))),
        Ok(Message::Close(frame)) => {
            trace!(?frame, "close frame received");
            Some(Err(ConnectionError::RemoteClosed))
        }
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => None,
        Err(e) => Some(Err(map_ws_error(e))),
    }
}

fn map_ws_error(e: tungstenite::Error) -> ConnectionError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ConnectionError::RemoteClosed
        }
        tungstenite::Error::Utf8 => ConnectionError::Protocol("invalid UTF-8 in text frame".into()),
        tungstenite::Error::Protocol(p) => ConnectionError::Protocol(p.to_string()),
        other => ConnectionError::Transport(other.to_string()),
    }
}

/// Create an in-process connector and the listener that accepts its
/// connections.
pub fn memory_transport() -> (MemoryConnector, MemoryListener) {
    let (peers_tx, peers_rx) = mpsc::unbounded_channel();
    let refusing = Arc::new(AtomicBool::new(false));
    let attempts = Arc::new(AtomicU32::new(0));

    (
        MemoryConnector {
            url: "memory://daemon".to_string(),
            peers: peers_tx,
            refusing: refusing.clone(),
            attempts: attempts.clone(),
        },
        MemoryListener {
            peers: peers_rx,
            refusing,
            attempts,
        },
    )
}

pub struct MemoryConnector {
    url: String,
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refusing: Arc<AtomicBool>,
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl Connector for MemoryConnector {
    fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<Connection, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        if self.refusing.load(Ordering::Relaxed) {
            return Err(ConnectionError::Connect {
                url: self.url.clone(),
                message: "connection refused".to_string(),
            });
        }

        let (to_client, client_rx) = fmpsc::unbounded();
        let (client_tx, from_client) = fmpsc::unbounded();

        self.peers
            .send(MemoryPeer {
                to_client,
                from_client,
            })
            .map_err(|_| ConnectionError::Connect {
                url: self.url.clone(),
                message: "listener dropped".to_string(),
            })?;

        let sink = client_tx.sink_map_err(|e| ConnectionError::Transport(e.to_string()));
        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(client_rx),
        })
    }
}

/// Daemon side of [`memory_transport`].
pub struct MemoryListener {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
    refusing: Arc<AtomicBool>,
    attempts: Arc<AtomicU32>,
}

impl MemoryListener {
    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    /// Make every following connection attempt fail.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::Relaxed);
    }

    /// Connection attempts so far, refused ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }
}

/// One accepted in-process connection. Dropping it closes the connection.
pub struct MemoryPeer {
    to_client: fmpsc::UnboundedSender<Result<String, ConnectionError>>,
    from_client: fmpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Deliver a text frame to the client.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.to_client.unbounded_send(Ok(text.into())).is_ok()
    }

    /// Break the connection with a transport error.
    pub fn fail(&self, error: ConnectionError) -> bool {
        self.to_client.unbounded_send(Err(error)).is_ok()
    }

    /// Next frame the client wrote, `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.next().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_frames_are_protocol_violations() {
        let out = classify_incoming(Ok(Message::Binary(vec![1, 2, 3])));
        assert!(matches!(out, Some(Err(ConnectionError::Protocol(_)))));
    }

    #[test]
    fn control_frames_are_skipped() {
        assert!(classify_incoming(Ok(Message::Ping(vec![]))).is_none());
        assert!(classify_incoming(Ok(Message::Pong(vec![]))).is_none());
        assert_eq!(
            classify_incoming(Ok(Message::Text("hi".into()))),
            Some(Ok("hi".to_string()))
        );
    }

    #[test]
    fn utf8_errors_are_protocol_violations() {
        assert!(matches!(
            map_ws_error(tungstenite::Error::Utf8),
            ConnectionError::Protocol(_)
        ));
        assert_eq!(
            map_ws_error(tungstenite::Error::ConnectionClosed),
            ConnectionError::RemoteClosed
        );
    }

    #[tokio::test]
    async fn memory_round_trip() {
        let (connector, mut listener) = memory_transport();
        let mut conn = connector.connect().await.unwrap();
        let mut peer = listener.accept().await.unwrap();

        conn.sink.send("to daemon".to_string()).await.unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("to daemon"));

        assert!(peer.send("to client"));
        assert_eq!(conn.stream.next().await, Some(Ok("to client".to_string())));

        drop(peer);
        assert_eq!(conn.stream.next().await, None);
    }

    #[tokio::test]
    async fn refusing_listener() {
        let (connector, listener) = memory_transport();
        listener.set_refusing(true);
        assert!(connector.connect().await.is_err());
        assert_eq!(listener.attempts(), 1);
    }
}
