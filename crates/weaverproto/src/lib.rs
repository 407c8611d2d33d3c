//! weaverproto - wire types and the local state mirror for PipeWeaver
//!
//! The daemon exposes its whole state as one JSON tree. A client fetches it
//! once with `GetStatus`, then keeps it current by applying the RFC 6902
//! patch batches the daemon broadcasts after every change.
//!
//! This crate is synchronous and transport-free:
//!
//! - [`frame`] parses inbound frames and builds outbound requests
//! - [`document`] holds the mirrored tree and applies patch batches atomically
//! - [`patch`] defines patch operations and the set of paths a batch touched
//! - [`command`] lists the mutations the daemon accepts
//! - [`status`] reads typed device views out of the tree
//!
//! The async client lives in `weaverlink`.

pub mod command;
pub mod document;
pub mod error;
pub mod frame;
pub mod patch;
pub mod status;

pub use command::{DaemonCommand, Mix, MuteState, MuteTarget};
pub use document::Document;
pub use error::{DesyncError, DesyncReason, MalformedFrameError, ProtoError};
pub use frame::{
    parse_inbound, parse_meter, DaemonRequest, Inbound, MeterReading, Reply, RequestEnvelope,
    PATCH_ID,
};
pub use patch::{is_ancestor_or_self, AppliedPaths, PatchOp};
pub use status::{
    find_device, find_device_by_name, list_devices, mute_target_candidates, normalize_volume,
    DeviceKind, DeviceSummary, DeviceView, SourceView, TargetView,
};

/// Port the daemon listens on by default.
pub const DEFAULT_PORT: u16 = 14565;
