//! Protocol-level errors.

use thiserror::Error;

/// Why a patch operation could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DesyncReason {
    #[error("path is not a JSON pointer")]
    InvalidPointer,

    #[error("parent container does not exist")]
    MissingParent,

    #[error("no value at path")]
    MissingTarget,

    #[error("array index {0:?} is not valid here")]
    BadIndex(String),

    #[error("parent is a scalar, not a container")]
    NotAContainer,

    #[error("the document root cannot be removed")]
    RemoveRoot,
}

/// The local mirror and the daemon disagree: a patch batch did not fit the
/// local tree. The batch was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("patch op {op_index} ({op}) at {path:?} failed: {reason}")]
pub struct DesyncError {
    /// Position of the failing op inside its batch
    pub op_index: usize,
    /// "add", "replace" or "remove"
    pub op: &'static str,
    pub path: String,
    pub reason: DesyncReason,
}

/// An inbound frame that could not be understood. The frame is dropped, the
/// connection is kept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedFrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(String),

    #[error("frame is missing `{0}`")]
    MissingField(&'static str),

    #[error("patch payload is invalid: {0}")]
    BadPatch(String),

    #[error("meter payload is invalid: {0}")]
    BadMeter(String),
}

/// Any protocol-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error(transparent)]
    Desync(#[from] DesyncError),

    #[error(transparent)]
    Malformed(#[from] MalformedFrameError),
}
