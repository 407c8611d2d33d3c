//! Session lifecycle over the in-memory transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, session_settings};
use tokio::sync::mpsc;
use weaverlink::{memory_transport, ConnectionError, Session, SessionEvent, SessionState};

async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no session event")
        .expect("session dropped its sender")
}

#[tokio::test]
async fn test_retries_until_daemon_appears() {
    let (connector, mut listener) = memory_transport();
    listener.set_refusing(true);

    let (tx, mut rx) = mpsc::channel(16);
    let session = Session::new(Arc::new(connector), session_settings("test"), tx);
    assert_eq!(session.state(), SessionState::Disconnected);
    session.start();

    assert!(eventually(|| listener.attempts() >= 3).await);
    assert!(session.health().consecutive_failures >= 2);
    assert_ne!(session.state(), SessionState::Connected);

    listener.set_refusing(false);
    let _peer = listener.accept().await.unwrap();
    assert_eq!(next_event(&mut rx).await, SessionEvent::Resynced);
    assert!(eventually(|| session.state() == SessionState::Connected).await);
    assert_eq!(session.health().consecutive_failures, 0);

    session.shutdown().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_reconnects_after_remote_close() {
    let (connector, mut listener) = memory_transport();
    let (tx, mut rx) = mpsc::channel(16);
    let session = Session::new(Arc::new(connector), session_settings("test"), tx);
    session.start();

    let mut peer = listener.accept().await.unwrap();
    assert_eq!(next_event(&mut rx).await, SessionEvent::Resynced);

    assert!(session.send("hello".to_string()));
    assert_eq!(peer.recv().await.as_deref(), Some("hello"));
    peer.send("frame one");
    assert_eq!(
        next_event(&mut rx).await,
        SessionEvent::Frame("frame one".to_string())
    );

    drop(peer);
    assert_eq!(
        next_event(&mut rx).await,
        SessionEvent::Disconnected(ConnectionError::RemoteClosed)
    );

    let _peer = listener.accept().await.unwrap();
    assert_eq!(next_event(&mut rx).await, SessionEvent::Resynced);
    assert_eq!(session.health().reconnects, 1);

    session.shutdown().await;
}

#[tokio::test]
async fn test_protocol_error_tears_down_connection() {
    let (connector, mut listener) = memory_transport();
    let (tx, mut rx) = mpsc::channel(16);
    let session = Session::new(Arc::new(connector), session_settings("test"), tx);
    session.start();

    let peer = listener.accept().await.unwrap();
    assert_eq!(next_event(&mut rx).await, SessionEvent::Resynced);

    let error = ConnectionError::Protocol("unexpected binary frame".to_string());
    peer.fail(error.clone());
    assert_eq!(next_event(&mut rx).await, SessionEvent::Disconnected(error));

    session.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_retrying() {
    let (connector, listener) = memory_transport();
    listener.set_refusing(true);
    let (tx, _rx) = mpsc::channel(16);
    let session = Session::new(Arc::new(connector), session_settings("test"), tx);
    session.start();

    assert!(eventually(|| listener.attempts() >= 1).await);
    session.shutdown().await;
    assert!(session.is_closed());
    assert!(!session.send("late".to_string()));

    let attempts = listener.attempts();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(listener.attempts(), attempts);

    // start() after shutdown does nothing
    session.start();
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_frames_sent_while_disconnected_are_dropped() {
    let (connector, mut listener) = memory_transport();
    listener.set_refusing(true);
    let (tx, mut rx) = mpsc::channel(16);
    let session = Session::new(Arc::new(connector), session_settings("test"), tx);
    session.start();

    assert!(session.send("lost".to_string()));
    assert!(eventually(|| listener.attempts() >= 1).await);

    listener.set_refusing(false);
    let mut peer = listener.accept().await.unwrap();
    assert_eq!(next_event(&mut rx).await, SessionEvent::Resynced);

    session.send("kept".to_string());
    assert_eq!(peer.recv().await.as_deref(), Some("kept"));

    session.shutdown().await;
}
