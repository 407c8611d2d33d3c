//! The local mirror of the daemon's status tree.
//!
//! Only one writer ever mutates a `Document`. A batch is applied to a shadow
//! copy and committed in one assignment, so readers never observe half of a
//! batch.

use crate::error::{DesyncError, DesyncReason};
use crate::patch::{AppliedPaths, PatchOp};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    root: Value,
    revision: u64,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// An empty document (root is an empty object, revision 0).
    pub fn new() -> Self {
        Self {
            root: Value::Object(Map::new()),
            revision: 0,
        }
    }

    pub fn with_root(root: Value) -> Self {
        Self { root, revision: 0 }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Number of commits (batches and resets) so far.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Read the value at a JSON pointer. `""` is the whole tree.
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.root.pointer(path)
    }

    /// Replace the whole tree.
    pub fn reset(&mut self, snapshot: Value) -> AppliedPaths {
        self.root = snapshot;
        self.revision += 1;
        AppliedPaths::root()
    }

    /// Apply a batch atomically. On error nothing changes.
    pub fn apply(&mut self, ops: &[PatchOp]) -> Result<AppliedPaths, DesyncError> {
        let mut shadow = self.root.clone();
        let mut applied = AppliedPaths::new();

        for (op_index, op) in ops.iter().enumerate() {
            let touched = apply_one(&mut shadow, op).map_err(|reason| DesyncError {
                op_index,
                op: op.name(),
                path: op.path().to_string(),
                reason,
            })?;
            applied.insert(touched);
        }

        self.root = shadow;
        self.revision += 1;
        Ok(applied)
    }
}

/// Split a pointer into (parent pointer, last unescaped token).
/// `None` for the root pointer.
fn split_last(path: &str) -> Result<Option<(&str, String)>, DesyncReason> {
    if path.is_empty() {
        return Ok(None);
    }
    if !path.starts_with('/') {
        return Err(DesyncReason::InvalidPointer);
    }
    // rfind always succeeds: the path starts with '/'
    let cut = path.rfind('/').unwrap_or(0);
    Ok(Some((&path[..cut], crate::patch::unescape_token(&path[cut + 1..]))))
}

/// Array index rules from RFC 6901: decimal, no leading zeros.
fn parse_index(token: &str, len: usize, allow_end: bool) -> Result<usize, DesyncReason> {
    let bad = || DesyncReason::BadIndex(token.to_string());

    if token.is_empty() || (token.len() > 1 && token.starts_with('0')) {
        return Err(bad());
    }
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let index: usize = token.parse().map_err(|_| bad())?;
    let in_range = if allow_end { index <= len } else { index < len };
    if !in_range {
        return Err(bad());
    }
    Ok(index)
}

/// Apply one op in place and return the path whose subtree changed.
fn apply_one(doc: &mut Value, op: &PatchOp) -> Result<String, DesyncReason> {
    match op {
        PatchOp::Add { path, value } => {
            let Some((parent_path, key)) = split_last(path)? else {
                *doc = value.clone();
                return Ok(String::new());
            };
            let parent = doc
                .pointer_mut(parent_path)
                .ok_or(DesyncReason::MissingParent)?;

            match parent {
                Value::Object(map) => {
                    map.insert(key, value.clone());
                    Ok(path.clone())
                }
                Value::Array(items) => {
                    if key == "-" {
                        items.push(value.clone());
                    } else {
                        let index = parse_index(&key, items.len(), true)?;
                        items.insert(index, value.clone());
                    }
                    Ok(parent_path.to_string())
                }
                _ => Err(DesyncReason::NotAContainer),
            }
        }
        PatchOp::Replace { path, value } => {
            let Some((parent_path, key)) = split_last(path)? else {
                *doc = value.clone();
                return Ok(String::new());
            };
            let parent = doc
                .pointer_mut(parent_path)
                .ok_or(DesyncReason::MissingParent)?;

            match parent {
                Value::Object(map) => {
                    let slot = map.get_mut(&key).ok_or(DesyncReason::MissingTarget)?;
                    *slot = value.clone();
                    Ok(path.clone())
                }
                Value::Array(items) => {
                    let index = parse_index(&key, items.len(), false)?;
                    items[index] = value.clone();
                    Ok(path.clone())
                }
                _ => Err(DesyncReason::NotAContainer),
            }
        }
        PatchOp::Remove { path } => {
            let Some((parent_path, key)) = split_last(path)? else {
                return Err(DesyncReason::RemoveRoot);
            };
            let parent = doc
                .pointer_mut(parent_path)
                .ok_or(DesyncReason::MissingParent)?;

            match parent {
                Value::Object(map) => {
                    map.remove(&key).ok_or(DesyncReason::MissingTarget)?;
                    Ok(path.clone())
                }
                Value::Array(items) => {
                    let index = parse_index(&key, items.len(), false)?;
                    items.remove(index);
                    Ok(parent_path.to_string())
                }
                _ => Err(DesyncReason::NotAContainer),
            }
        }
    }
}
