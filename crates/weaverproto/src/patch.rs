//! Patch operations and the set of paths a batch touched.
//!
//! Patches follow the RFC 6902 subset the daemon emits: `add`, `replace` and
//! `remove`, each addressed by an RFC 6901 JSON pointer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// One operation of a patch batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
}

impl PatchOp {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        PatchOp::Add {
            path: path.into(),
            value,
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        PatchOp::Replace {
            path: path.into(),
            value,
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        PatchOp::Remove { path: path.into() }
    }

    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Replace { path, .. } | PatchOp::Remove { path } => {
                path
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PatchOp::Add { .. } => "add",
            PatchOp::Replace { .. } => "replace",
            PatchOp::Remove { .. } => "remove",
        }
    }
}

/// Escape one pointer token (`~` → `~0`, `/` → `~1`).
pub fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Undo [`escape_token`].
pub fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Append an escaped token to a pointer.
pub fn join_pointer(base: &str, token: &str) -> String {
    format!("{}/{}", base, escape_token(token))
}

/// True when `ancestor` is `path` itself or one of its ancestors, respecting
/// segment boundaries (`/a/b` is not an ancestor of `/a/bc`).
pub fn is_ancestor_or_self(ancestor: &str, path: &str) -> bool {
    if ancestor.is_empty() || ancestor == path {
        return true;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Paths whose subtrees changed in one committed batch.
///
/// Array inserts and removals report the array itself since every later
/// index shifts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedPaths {
    paths: BTreeSet<String>,
}

impl AppliedPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// The whole document changed (snapshot).
    pub fn root() -> Self {
        let mut applied = Self::new();
        applied.insert(String::new());
        applied
    }

    pub fn insert(&mut self, path: String) {
        self.paths.insert(path);
    }

    pub fn extend(&mut self, other: AppliedPaths) {
        self.paths.extend(other.paths);
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    /// Does any changed subtree overlap the subtree at `prefix`?
    pub fn intersects(&self, prefix: &str) -> bool {
        self.paths
            .iter()
            .any(|p| is_ancestor_or_self(prefix, p) || is_ancestor_or_self(p, prefix))
    }

    /// Changed paths that overlap `prefix`.
    pub fn matching<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.iter()
            .filter(move |p| is_ancestor_or_self(prefix, p) || is_ancestor_or_self(p, prefix))
    }
}

impl FromIterator<String> for AppliedPaths {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            paths: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_ops_use_rfc6902_shape() {
        let ops: Vec<PatchOp> = serde_json::from_value(json!([
            {"op": "replace", "path": "/a", "value": 1},
            {"op": "add", "path": "/b/-", "value": {"x": true}},
            {"op": "remove", "path": "/c"}
        ]))
        .unwrap();

        assert_eq!(ops[0], PatchOp::replace("/a", json!(1)));
        assert_eq!(ops[1].name(), "add");
        assert_eq!(ops[2], PatchOp::remove("/c"));
    }

    #[test]
    fn unknown_op_is_rejected() {
        let parsed: Result<PatchOp, _> =
            serde_json::from_value(json!({"op": "move", "from": "/a", "path": "/b"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn escaping() {
        assert_eq!(escape_token("a/b~c"), "a~1b~0c");
        assert_eq!(unescape_token("a~1b~0c"), "a/b~c");
        assert_eq!(join_pointer("/devices", "x/y"), "/devices/x~1y");
    }

    #[test]
    fn ancestry_respects_segments() {
        assert!(is_ancestor_or_self("", "/a"));
        assert!(is_ancestor_or_self("/a", "/a"));
        assert!(is_ancestor_or_self("/a", "/a/b"));
        assert!(!is_ancestor_or_self("/a/b", "/a/bc"));
        assert!(!is_ancestor_or_self("/a/b", "/a"));
    }

    #[test]
    fn intersects_both_directions() {
        let applied: AppliedPaths = ["/devices/src1/volumes/A".to_string()].into_iter().collect();

        assert!(applied.intersects("/devices/src1"));
        assert!(applied.intersects("/devices/src1/volumes/A"));
        assert!(!applied.intersects("/devices/src1/volumes/B"));
        assert!(!applied.intersects("/devices/src10"));

        let root = AppliedPaths::root();
        assert!(root.intersects("/anything/at/all"));
    }
}
