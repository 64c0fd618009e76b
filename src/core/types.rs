//! Identifier and request types shared by the write path
//!
//! Small `Copy` newtypes, passed through queues, logs and metrics labels
//! without allocation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a vnode (a shard hosted on this node)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct VnodeId(pub u32);

impl fmt::Display for VnodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vnode{}", self.0)
    }
}

impl From<u32> for VnodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Wire message type of an inbound write request.
///
/// Open-ended: a type with no registered handler surfaces as an
/// unsupported-message status, not a decode failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MsgType(pub u16);

impl MsgType {
    /// Submit a batch of rows
    pub const SUBMIT: MsgType = MsgType(3);
    /// Create a table on the vnode
    pub const CREATE_TABLE: MsgType = MsgType(5);
    /// Drop a table from the vnode
    pub const DROP_TABLE: MsgType = MsgType(7);

    /// Human readable name for known types
    pub fn name(&self) -> &'static str {
        match *self {
            Self::SUBMIT => "submit",
            Self::CREATE_TABLE => "create-table",
            Self::DROP_TABLE => "drop-table",
            _ => "unknown",
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Opaque handle the transport uses to route a response back to its caller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RequestHandle(pub u64);

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// An inbound write request as delivered by the transport.
///
/// `body` is the raw multi-vnode envelope. Sub-messages hold zero-copy slices
/// of it, so the buffer is released when the last sub-message is dropped.
#[derive(Clone, Debug)]
pub struct WriteRequest {
    /// Response routing handle
    pub handle: RequestHandle,
    /// Message type shared by every sub-message of the request
    pub msg_type: MsgType,
    /// Envelope bytes
    pub body: Bytes,
}

impl WriteRequest {
    /// Create a new request
    pub fn new(handle: RequestHandle, msg_type: MsgType, body: impl Into<Bytes>) -> Self {
        Self {
            handle,
            msg_type,
            body: body.into(),
        }
    }
}
