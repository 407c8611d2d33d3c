//! Document model behaviour over realistic frame sequences.

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use weaverproto::{parse_inbound, Document, Inbound, PatchOp};

fn src1_snapshot(linked: bool) -> Value {
    json!({
        "devices": {
            "src1": {
                "kind": "Source",
                "volumes": {"A": 50, "B": 50},
                "muted": false,
                "link": linked
            }
        }
    })
}

#[test]
fn replace_on_one_mix_leaves_the_other() {
    let mut doc = Document::new();
    doc.reset(src1_snapshot(false));

    doc.apply(&[PatchOp::replace("/devices/src1/volumes/A", json!(70))])
        .unwrap();

    assert_eq!(doc.get("/devices/src1/volumes/A"), Some(&json!(70)));
    assert_eq!(doc.get("/devices/src1/volumes/B"), Some(&json!(50)));
}

#[test]
fn last_write_wins_within_a_batch() {
    let mut doc = Document::new();
    doc.reset(src1_snapshot(false));

    let ops = vec![
        PatchOp::replace("/devices/src1/volumes/A", json!(10)),
        PatchOp::replace("/devices/src1/volumes/B", json!(20)),
        PatchOp::replace("/devices/src1/volumes/A", json!(30)),
        PatchOp::remove("/devices/src1/muted"),
        PatchOp::add("/devices/src1/muted", json!(true)),
    ];
    doc.apply(&ops).unwrap();

    assert_eq!(doc.get("/devices/src1/volumes/A"), Some(&json!(30)));
    assert_eq!(doc.get("/devices/src1/volumes/B"), Some(&json!(20)));
    assert_eq!(doc.get("/devices/src1/muted"), Some(&json!(true)));
}

#[test]
fn last_write_wins_across_batches() {
    let mut doc = Document::new();
    doc.reset(src1_snapshot(false));

    for value in [55, 60, 65, 12] {
        doc.apply(&[PatchOp::replace("/devices/src1/volumes/B", json!(value))])
            .unwrap();
    }

    assert_eq!(doc.get("/devices/src1/volumes/B"), Some(&json!(12)));
    assert_eq!(doc.revision(), 5);
}

#[test]
fn failing_op_anywhere_keeps_tree_identical() {
    let mut doc = Document::new();
    doc.reset(src1_snapshot(true));
    let before = serde_json::to_string(doc.root()).unwrap();

    for bad_at in 0..3 {
        let mut ops = vec![
            PatchOp::replace("/devices/src1/volumes/A", json!(1)),
            PatchOp::add("/devices/src2", json!({})),
            PatchOp::replace("/devices/src1/link", json!(false)),
        ];
        ops[bad_at] = PatchOp::remove("/devices/nowhere/volume");

        assert!(doc.apply(&ops).is_err());
        assert_eq!(serde_json::to_string(doc.root()).unwrap(), before);
    }
    assert_eq!(doc.revision(), 1);
}

#[test]
fn frames_decode_and_apply() {
    let mut doc = Document::new();

    let snapshot = json!({"id": 1, "data": {"Status": src1_snapshot(false)}}).to_string();
    let Inbound::Snapshot { status, .. } = parse_inbound(&snapshot).unwrap() else {
        panic!("expected snapshot");
    };
    doc.reset(status);

    let patch = json!({
        "id": u64::MAX,
        "data": {"Patch": [{"op": "replace", "path": "/devices/src1/volumes/A", "value": 70}]}
    })
    .to_string();
    let Inbound::Patch { ops, .. } = parse_inbound(&patch).unwrap() else {
        panic!("expected patch");
    };
    let applied = doc.apply(&ops).unwrap();

    assert!(applied.intersects("/devices/src1"));
    assert!(!applied.intersects("/devices/src1/volumes/B"));
    assert_eq!(doc.get("/devices/src1/volumes/A"), Some(&json!(70)));
}
