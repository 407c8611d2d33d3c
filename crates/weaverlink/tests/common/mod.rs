//! Shared helpers: a scripted in-process daemon and status trees.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use weaverlink::{
    memory_transport, ClientSettings, MemoryListener, MemoryPeer, SessionSettings, Update,
    WeaverClient,
};

pub const SRC: &str = "/audio/profile/devices/sources/virtual_devices/0";
pub const STREAM: &str = "/audio/profile/devices/targets/virtual_devices/0";

pub fn session_settings(name: &str) -> SessionSettings {
    SessionSettings {
        name: name.to_string(),
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(100),
        jitter: 0.0,
        connect_timeout: Duration::from_secs(1),
    }
}

pub fn client_settings() -> ClientSettings {
    ClientSettings {
        session: session_settings("daemon"),
        meter: session_settings("meter"),
        command_timeout: Duration::from_secs(5),
        snapshot_timeout: Duration::from_secs(10),
    }
}

/// One source `src1` ("Music", A=50 B=50), one virtual target `stream`,
/// one physical target `hp`.
pub fn status_tree(linked: bool) -> Value {
    json!({"audio": {"profile": {"devices": {
        "sources": {"virtual_devices": [{
            "description": {"id": "src1", "name": "Music"},
            "volumes": {
                "volume": {"A": 50, "B": 50},
                "volumes_linked": if linked { json!(1.0) } else { Value::Null }
            },
            "mute_states": {"mute_state": [], "mute_targets": {"TargetA": [], "TargetB": []}}
        }]},
        "targets": {
            "virtual_devices": [
                {"description": {"id": "stream", "name": "Stream"}, "volume": 80, "mute_state": "Unmuted"}
            ],
            "physical_devices": [
                {"description": {"id": "hp", "name": "Headphones"}, "volume": 100, "mute_state": "Unmuted"}
            ]
        }
    }}}})
}

pub fn patch_frame(ops: Value) -> String {
    json!({"id": u64::MAX, "data": {"Patch": ops}}).to_string()
}

pub fn reply_ok(id: u64) -> String {
    json!({"id": id, "data": {"Pipewire": "Ok"}}).to_string()
}

/// Next frame the client wrote, parsed.
pub async fn expect_request(peer: &mut MemoryPeer) -> Value {
    let text = tokio::time::timeout(Duration::from_secs(2), peer.recv())
        .await
        .expect("client sent nothing")
        .expect("client hung up");
    serde_json::from_str(&text).expect("client frame is JSON")
}

/// Answer the client's `GetStatus` with `tree`.
pub async fn serve_snapshot(peer: &mut MemoryPeer, tree: &Value) -> u64 {
    let request = expect_request(peer).await;
    assert_eq!(request["data"], json!("GetStatus"), "expected a status request");
    let id = request["id"].as_u64().expect("request id");
    peer.send(json!({"id": id, "data": {"Status": tree}}).to_string());
    id
}

/// A started client over the in-memory transport, without meters.
pub fn memory_client() -> (Arc<WeaverClient>, MemoryListener) {
    let (connector, listener) = memory_transport();
    let client = Arc::new(WeaverClient::with_connectors(
        Arc::new(connector),
        None,
        client_settings(),
    ));
    client.start();
    (client, listener)
}

/// Accept the first connection and hand it a snapshot.
pub async fn connect_with_snapshot(
    client: &WeaverClient,
    listener: &mut MemoryListener,
    tree: &Value,
) -> MemoryPeer {
    let mut peer = listener.accept().await.expect("client never connected");
    serve_snapshot(&mut peer, tree).await;
    assert!(client.wait_for_baseline(Duration::from_secs(2)).await);
    peer
}

pub fn collect_updates(client: &WeaverClient, prefix: &str) -> (weaverlink::Subscription, mpsc::UnboundedReceiver<Update>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = client.subscribe(prefix, move |update| {
        let _ = tx.send(update);
    });
    (subscription, rx)
}

pub async fn next_update(rx: &mut mpsc::UnboundedReceiver<Update>) -> Update {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no update delivered")
        .expect("subscription closed")
}

/// Poll until `check` holds or two seconds pass.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
