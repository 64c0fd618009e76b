//! Per-vnode write sub-message

use crate::core::types::{MsgType, RequestHandle, VnodeId};
use crate::dispatch::fanout::FanoutContext;
use crate::vnode::{VnodeHandle, VnodePin};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// One vnode's share of an inbound write request.
///
/// Ownership moves dispatcher → shard queue → worker → response merger and is
/// never shared. Dropping it releases the vnode pin and this slice of the
/// request body.
pub struct WriteMessage {
    pin: VnodePin,
    request: RequestHandle,
    msg_type: MsgType,
    payload: Bytes,
    fanout: Option<Arc<FanoutContext>>,
}

impl WriteMessage {
    pub(crate) fn new(
        pin: VnodePin,
        request: RequestHandle,
        msg_type: MsgType,
        payload: Bytes,
        fanout: Option<Arc<FanoutContext>>,
    ) -> Self {
        Self {
            pin,
            request,
            msg_type,
            payload,
            fanout,
        }
    }

    /// Target vnode id
    pub fn vnode_id(&self) -> VnodeId {
        self.pin.id()
    }

    /// Target vnode
    pub fn vnode(&self) -> &VnodeHandle {
        self.pin.vnode()
    }

    /// Originating request
    pub fn request(&self) -> RequestHandle {
        self.request
    }

    /// Message type
    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    /// Payload bytes for this vnode
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Fan-out context shared with sibling vnodes, if the request spans several
    pub fn fanout(&self) -> Option<&Arc<FanoutContext>> {
        self.fanout.as_ref()
    }
}

impl fmt::Debug for WriteMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteMessage")
            .field("vnode", &self.vnode_id())
            .field("request", &self.request)
            .field("msg_type", &self.msg_type)
            .field("len", &self.payload.len())
            .field("fanout", &self.fanout.is_some())
            .finish()
    }
}
