//! Wire frames exchanged with the daemon.
//!
//! Every frame is a JSON object `{"id": n, "data": ...}`. Requests carry a
//! client-chosen id, replies echo it. Patch broadcasts use [`PATCH_ID`].

use crate::command::DaemonCommand;
use crate::error::MalformedFrameError;
use crate::patch::PatchOp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request id the daemon uses for unsolicited patch frames.
pub const PATCH_ID: u64 = u64::MAX;

/// Request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonRequest {
    /// Ask for the full status tree.
    GetStatus,
    Pipewire(DaemonCommand),
}

/// Outbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub data: DaemonRequest,
}

impl RequestEnvelope {
    pub fn new(id: u64, data: DaemonRequest) -> Self {
        Self { id, data }
    }

    pub fn get_status(id: u64) -> Self {
        Self::new(id, DaemonRequest::GetStatus)
    }

    pub fn command(id: u64, command: DaemonCommand) -> Self {
        Self::new(id, DaemonRequest::Pipewire(command))
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// The daemon's answer to one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Err(String),
    /// Anything else; treated as an acknowledgement.
    Other(Value),
}

impl Reply {
    pub fn is_err(&self) -> bool {
        matches!(self, Reply::Err(_))
    }
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Full status tree, the answer to `GetStatus`.
    Snapshot {
        request_id: u64,
        seq: Option<u64>,
        status: Value,
    },
    /// Incremental change batch, applied atomically.
    Patch { seq: Option<u64>, ops: Vec<PatchOp> },
    Reply { id: u64, reply: Reply },
}

/// Parse one text frame from the main socket.
pub fn parse_inbound(text: &str) -> Result<Inbound, MalformedFrameError> {
    let frame: Value =
        serde_json::from_str(text).map_err(|e| MalformedFrameError::Json(e.to_string()))?;
    let object = frame
        .as_object()
        .ok_or_else(|| MalformedFrameError::Json("frame is not an object".to_string()))?;

    let id = object
        .get("id")
        .and_then(Value::as_u64)
        .ok_or(MalformedFrameError::MissingField("id"))?;
    let data = object
        .get("data")
        .ok_or(MalformedFrameError::MissingField("data"))?;
    let seq = object.get("seq").and_then(Value::as_u64);

    if let Some(patch) = data.get("Patch") {
        let ops: Vec<PatchOp> = serde_json::from_value(patch.clone())
            .map_err(|e| MalformedFrameError::BadPatch(e.to_string()))?;
        return Ok(Inbound::Patch { seq, ops });
    }
    if id == PATCH_ID {
        return Err(MalformedFrameError::MissingField("Patch"));
    }

    if let Some(status) = data.get("Status") {
        return Ok(Inbound::Snapshot {
            request_id: id,
            seq,
            status: status.clone(),
        });
    }

    Ok(Inbound::Reply {
        id,
        reply: classify_reply(data),
    })
}

fn classify_reply(data: &Value) -> Reply {
    match data {
        Value::String(s) if s == "Ok" => Reply::Ok,
        Value::Object(map) => {
            if let Some(err) = map.get("Err") {
                return Reply::Err(error_text(err));
            }
            match map.get("Pipewire") {
                Some(Value::String(s)) if s == "Ok" => Reply::Ok,
                Some(Value::Object(inner)) if inner.contains_key("Ok") => Reply::Ok,
                Some(Value::Object(inner)) if inner.contains_key("Err") => {
                    Reply::Err(inner.get("Err").map(error_text).unwrap_or_default())
                }
                _ => Reply::Other(data.clone()),
            }
        }
        other => Reply::Other(other.clone()),
    }
}

fn error_text(err: &Value) -> String {
    match err {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One level reading from the meter socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterReading {
    pub id: String,
    /// 0..=100
    pub percent: u8,
}

/// Parse one text frame from the meter socket: `{"id": ..., "percent": ...}`.
pub fn parse_meter(text: &str) -> Result<MeterReading, MalformedFrameError> {
    let frame: Value =
        serde_json::from_str(text).map_err(|e| MalformedFrameError::Json(e.to_string()))?;

    let id = match frame.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => return Err(MalformedFrameError::BadMeter(format!("id {other}"))),
        None => return Err(MalformedFrameError::MissingField("id")),
    };
    let percent = frame
        .get("percent")
        .ok_or(MalformedFrameError::MissingField("percent"))?
        .as_f64()
        .ok_or_else(|| MalformedFrameError::BadMeter("percent is not a number".to_string()))?;

    Ok(MeterReading {
        id,
        percent: percent.round().clamp(0.0, 100.0) as u8,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Mix;
    use serde_json::json;

    #[test]
    fn outbound_shapes() {
        let text = RequestEnvelope::get_status(1).to_text().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&text).unwrap(),
            json!({"id": 1, "data": "GetStatus"})
        );

        let env = RequestEnvelope::command(
            7,
            DaemonCommand::SetSourceVolume("src1".into(), Mix::A, 70),
        );
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({"id": 7, "data": {"Pipewire": {"SetSourceVolume": ["src1", "A", 70]}}})
        );
    }

    #[test]
    fn patch_frame() {
        let text = json!({
            "id": u64::MAX,
            "data": {"Patch": [{"op": "replace", "path": "/a", "value": 2}]}
        })
        .to_string();

        match parse_inbound(&text).unwrap() {
            Inbound::Patch { seq, ops } => {
                assert_eq!(seq, None);
                assert_eq!(ops, vec![PatchOp::replace("/a", json!(2))]);
            }
            other => panic!("expected patch, got {other:?}"),
        }
    }

    #[test]
    fn patch_frame_with_seq() {
        let text = r#"{"id": 3, "seq": 42, "data": {"Patch": []}}"#;
        assert_eq!(
            parse_inbound(text).unwrap(),
            Inbound::Patch {
                seq: Some(42),
                ops: vec![]
            }
        );
    }

    #[test]
    fn snapshot_frame() {
        let text = r#"{"id": 5, "data": {"Status": {"audio": {}}}}"#;
        assert_eq!(
            parse_inbound(text).unwrap(),
            Inbound::Snapshot {
                request_id: 5,
                seq: None,
                status: json!({"audio": {}})
            }
        );
    }

    #[test]
    fn reply_variants() {
        let cases = [
            (json!("Ok"), Reply::Ok),
            (json!({"Pipewire": "Ok"}), Reply::Ok),
            (json!({"Pipewire": {"Ok": null}}), Reply::Ok),
            (json!({"Err": "no such device"}), Reply::Err("no such device".into())),
            (json!({"Pipewire": {"Err": "busy"}}), Reply::Err("busy".into())),
            (json!({"Something": 1}), Reply::Other(json!({"Something": 1}))),
        ];
        for (data, expected) in cases {
            let text = json!({"id": 9, "data": data}).to_string();
            assert_eq!(
                parse_inbound(&text).unwrap(),
                Inbound::Reply { id: 9, reply: expected }
            );
        }
    }

    #[test]
    fn malformed_frames() {
        assert!(matches!(parse_inbound("{nope"), Err(MalformedFrameError::Json(_))));
        assert_eq!(
            parse_inbound(r#"{"data": "Ok"}"#).unwrap_err(),
            MalformedFrameError::MissingField("id")
        );
        assert_eq!(
            parse_inbound(r#"{"id": 1}"#).unwrap_err(),
            MalformedFrameError::MissingField("data")
        );
        assert!(matches!(
            parse_inbound(r#"{"id": 1, "data": {"Patch": [{"op": "copy"}]}}"#),
            Err(MalformedFrameError::BadPatch(_))
        ));
        let text = json!({"id": u64::MAX, "data": "Ok"}).to_string();
        assert_eq!(
            parse_inbound(&text).unwrap_err(),
            MalformedFrameError::MissingField("Patch")
        );
    }

    #[test]
    fn meter_frames() {
        assert_eq!(
            parse_meter(r#"{"id": "src1", "percent": 42}"#).unwrap(),
            MeterReading {
                id: "src1".into(),
                percent: 42
            }
        );
        assert_eq!(parse_meter(r#"{"id": 77, "percent": 130.2}"#).unwrap().percent, 100);
        assert_eq!(parse_meter(r#"{"id": 77, "percent": 12}"#).unwrap().id, "77");
        assert_eq!(
            parse_meter(r#"{"id": "x"}"#).unwrap_err(),
            MalformedFrameError::MissingField("percent")
        );
    }
}
