//! Turns inbound text frames into document changes.
//!
//! Patches are only trusted on top of a snapshot fetched over the current
//! connection. Until that snapshot lands they are buffered; when it lands,
//! only buffered batches with a sequence number newer than the snapshot's
//! are replayed. PipeWeaver sends no sequence numbers, so in practice the
//! buffer is discarded.
//!
//! A batch that does not apply (a desync) drops the baseline. The stale
//! tree stays readable, later patches are held back, and the caller asks
//! for a fresh snapshot that replaces the tree in one step.

use std::collections::{BTreeSet, VecDeque};
use std::sync::RwLock;

use tracing::{debug, trace, warn};
use weaverproto::{
    parse_inbound, AppliedPaths, DesyncError, Document, Inbound, MalformedFrameError, PatchOp,
    Reply,
};

use crate::util::write;

/// Pre-baseline batches kept at most. Older ones are dropped first.
pub const DEFAULT_BUFFER_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Baseline {
    /// No snapshot yet on this client.
    Missing,
    /// Patches apply directly.
    Established,
    /// Disconnected or desynced; waiting for a fresh snapshot.
    Lost,
}

/// What one frame did.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A patch batch committed.
    Changed(AppliedPaths),
    /// A snapshot replaced the tree.
    Resynced(AppliedPaths),
    /// A patch arrived before the baseline and was held back.
    Buffered,
    /// A snapshot nobody is waiting for.
    Ignored,
    Reply { id: u64, reply: Reply },
    /// The batch did not apply; a fresh snapshot is needed.
    Desync(DesyncError),
    /// The frame was dropped.
    Malformed(MalformedFrameError),
}

#[derive(Debug)]
pub struct Decoder {
    baseline: Baseline,
    awaiting: BTreeSet<u64>,
    buffered: VecDeque<(Option<u64>, Vec<PatchOp>)>,
    buffer_limit: usize,
    last_seq: Option<u64>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_buffer_limit(DEFAULT_BUFFER_LIMIT)
    }

    pub fn with_buffer_limit(buffer_limit: usize) -> Self {
        Self {
            baseline: Baseline::Missing,
            awaiting: BTreeSet::new(),
            buffered: VecDeque::new(),
            buffer_limit,
            last_seq: None,
        }
    }

    pub fn baseline(&self) -> Baseline {
        self.baseline
    }

    pub fn is_awaiting_snapshot(&self) -> bool {
        !self.awaiting.is_empty()
    }

    /// Sequence number of the last committed batch or snapshot, if the
    /// daemon sends them.
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// A `GetStatus` with `request_id` went out. Any outstanding request's
    /// answer is accepted.
    pub fn begin_resync(&mut self, request_id: u64) {
        if self.baseline == Baseline::Established {
            self.baseline = Baseline::Lost;
        }
        self.awaiting.insert(request_id);
    }

    /// The connection dropped. Nothing outstanding will be answered.
    pub fn connection_lost(&mut self) {
        if self.baseline == Baseline::Established {
            self.baseline = Baseline::Lost;
        }
        self.awaiting.clear();
        self.buffered.clear();
    }

    pub fn decode(&mut self, text: &str, document: &RwLock<Document>) -> Decoded {
        let inbound = match parse_inbound(text) {
            Ok(inbound) => inbound,
            Err(e) => return Decoded::Malformed(e),
        };

        match inbound {
            Inbound::Reply { id, reply } => Decoded::Reply { id, reply },
            Inbound::Patch { seq, ops } => self.on_patch(seq, ops, document),
            Inbound::Snapshot {
                request_id,
                seq,
                status,
            } => self.on_snapshot(request_id, seq, status, document),
        }
    }

    fn on_patch(&mut self, seq: Option<u64>, ops: Vec<PatchOp>, document: &RwLock<Document>) -> Decoded {
        if self.baseline != Baseline::Established {
            if self.buffered.len() >= self.buffer_limit {
                self.buffered.pop_front();
                debug!(limit = self.buffer_limit, "pre-baseline buffer full, dropping oldest batch");
            }
            trace!(ops = ops.len(), ?seq, "buffering patch until snapshot");
            self.buffered.push_back((seq, ops));
            return Decoded::Buffered;
        }

        match write(document).apply(&ops) {
            Ok(applied) => {
                if seq.is_some() {
                    self.last_seq = seq;
                }
                Decoded::Changed(applied)
            }
            Err(e) => {
                self.baseline = Baseline::Lost;
                self.buffered.clear();
                Decoded::Desync(e)
            }
        }
    }

    fn on_snapshot(
        &mut self,
        request_id: u64,
        seq: Option<u64>,
        status: serde_json::Value,
        document: &RwLock<Document>,
    ) -> Decoded {
        if !self.awaiting.remove(&request_id) {
            debug!(request_id, "ignoring unrequested snapshot");
            return Decoded::Ignored;
        }
        self.awaiting.clear();

        let buffered = std::mem::take(&mut self.buffered);
        let mut doc = write(document);
        let mut applied = doc.reset(status);
        let mut replayed = 0usize;
        let mut discarded = 0usize;

        for (batch_seq, ops) in buffered {
            let newer = matches!((batch_seq, seq), (Some(b), Some(s)) if b > s);
            if !newer {
                discarded += 1;
                continue;
            }
            match doc.apply(&ops) {
                Ok(paths) => {
                    applied.extend(paths);
                    replayed += 1;
                    self.last_seq = batch_seq;
                }
                Err(e) => {
                    warn!(error = %e, "buffered patch does not apply to snapshot, stopping replay");
                    break;
                }
            }
        }
        drop(doc);

        if replayed == 0 {
            self.last_seq = seq;
        }
        self.baseline = Baseline::Established;
        debug!(request_id, replayed, discarded, "snapshot installed");
        Decoded::Resynced(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::read;
    use serde_json::json;

    fn snapshot(id: u64, volume: u64) -> String {
        json!({"id": id, "data": {"Status": {"volume": volume}}}).to_string()
    }

    fn patch(volume: u64) -> String {
        json!({
            "id": u64::MAX,
            "data": {"Patch": [{"op": "replace", "path": "/volume", "value": volume}]}
        })
        .to_string()
    }

    fn volume(doc: &RwLock<Document>) -> Option<u64> {
        read(doc).get("/volume").and_then(|v| v.as_u64())
    }

    #[test]
    fn patches_wait_for_the_snapshot() {
        let doc = RwLock::new(Document::new());
        let mut decoder = Decoder::new();
        decoder.begin_resync(1);

        assert_eq!(decoder.decode(&patch(10), &doc), Decoded::Buffered);
        assert_eq!(volume(&doc), None);

        let decoded = decoder.decode(&snapshot(1, 50), &doc);
        assert_eq!(decoded, Decoded::Resynced(AppliedPaths::root()));
        assert_eq!(decoder.baseline(), Baseline::Established);
        // Buffered batch had no sequence number, so it was discarded
        assert_eq!(volume(&doc), Some(50));

        assert!(matches!(decoder.decode(&patch(60), &doc), Decoded::Changed(_)));
        assert_eq!(volume(&doc), Some(60));
    }

    #[test]
    fn newer_buffered_batches_replay() {
        let doc = RwLock::new(Document::new());
        let mut decoder = Decoder::new();
        decoder.begin_resync(7);

        let old = json!({"id": u64::MAX, "seq": 4, "data": {"Patch": [
            {"op": "replace", "path": "/volume", "value": 1}
        ]}});
        let new = json!({"id": u64::MAX, "seq": 6, "data": {"Patch": [
            {"op": "replace", "path": "/volume", "value": 2}
        ]}});
        decoder.decode(&old.to_string(), &doc);
        decoder.decode(&new.to_string(), &doc);

        let snap = json!({"id": 7, "seq": 5, "data": {"Status": {"volume": 0}}});
        decoder.decode(&snap.to_string(), &doc);

        assert_eq!(volume(&doc), Some(2));
        assert_eq!(decoder.last_seq(), Some(6));
    }

    #[test]
    fn desync_holds_patches_until_fresh_snapshot() {
        let doc = RwLock::new(Document::new());
        let mut decoder = Decoder::new();
        decoder.begin_resync(1);
        decoder.decode(&snapshot(1, 50), &doc);

        let bad = json!({"id": u64::MAX, "data": {"Patch": [
            {"op": "replace", "path": "/missing/deep", "value": 1}
        ]}});
        assert!(matches!(decoder.decode(&bad.to_string(), &doc), Decoded::Desync(_)));
        assert_eq!(decoder.baseline(), Baseline::Lost);

        // Stale tree stays readable, new patches are held back
        assert_eq!(decoder.decode(&patch(70), &doc), Decoded::Buffered);
        assert_eq!(volume(&doc), Some(50));

        decoder.begin_resync(2);
        decoder.decode(&snapshot(2, 80), &doc);
        assert_eq!(volume(&doc), Some(80));
        assert_eq!(decoder.baseline(), Baseline::Established);
    }

    #[test]
    fn unrequested_snapshots_are_ignored() {
        let doc = RwLock::new(Document::new());
        let mut decoder = Decoder::new();
        decoder.begin_resync(3);

        assert_eq!(decoder.decode(&snapshot(99, 1), &doc), Decoded::Ignored);
        assert_eq!(volume(&doc), None);
        assert!(decoder.is_awaiting_snapshot());
    }

    #[test]
    fn any_outstanding_request_is_accepted() {
        let doc = RwLock::new(Document::new());
        let mut decoder = Decoder::new();
        decoder.begin_resync(1);
        decoder.begin_resync(2);

        assert!(matches!(decoder.decode(&snapshot(1, 5), &doc), Decoded::Resynced(_)));
        assert!(!decoder.is_awaiting_snapshot());
        // The answer to the second request is now stale
        assert_eq!(decoder.decode(&snapshot(2, 9), &doc), Decoded::Ignored);
        assert_eq!(volume(&doc), Some(5));
    }

    #[test]
    fn connection_loss_forgets_requests_and_buffer() {
        let doc = RwLock::new(Document::new());
        let mut decoder = Decoder::new();
        decoder.begin_resync(1);
        decoder.decode(&snapshot(1, 5), &doc);

        decoder.connection_lost();
        assert_eq!(decoder.baseline(), Baseline::Lost);
        assert_eq!(decoder.decode(&patch(6), &doc), Decoded::Buffered);
        assert_eq!(decoder.decode(&snapshot(1, 7), &doc), Decoded::Ignored);
    }

    #[test]
    fn buffer_is_bounded() {
        let doc = RwLock::new(Document::new());
        let mut decoder = Decoder::with_buffer_limit(2);
        for v in 0..5 {
            decoder.decode(&patch(v), &doc);
        }
        assert_eq!(decoder.buffered.len(), 2);
    }

    #[test]
    fn replies_and_garbage() {
        let doc = RwLock::new(Document::new());
        let mut decoder = Decoder::new();

        let reply = json!({"id": 4, "data": {"Pipewire": "Ok"}}).to_string();
        assert_eq!(
            decoder.decode(&reply, &doc),
            Decoded::Reply { id: 4, reply: Reply::Ok }
        );
        assert!(matches!(decoder.decode("not json", &doc), Decoded::Malformed(_)));
    }
}
