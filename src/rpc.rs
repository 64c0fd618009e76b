//! Outbound response surface
//!
//! The transport owns connections; the write path only hands it one
//! [`WriteResponse`] per inbound request through a [`Responder`].

use crate::core::error::{status_code, WriteStatus};
use crate::core::types::RequestHandle;
use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::warn;

/// Merged outcome of one inbound write request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteResponse {
    /// Request being answered
    pub handle: RequestHandle,
    /// Success, or the first failure seen across its vnodes
    pub status: WriteStatus,
}

impl WriteResponse {
    /// Wire status code
    pub fn code(&self) -> i32 {
        status_code(&self.status)
    }
}

/// Sink for write responses
pub trait Responder: Send + Sync + 'static {
    /// Deliver the response for one request. Called exactly once per request.
    fn send_response(&self, response: WriteResponse);
}

/// Responder that forwards responses onto a channel
#[derive(Clone)]
pub struct ChannelResponder {
    tx: Sender<WriteResponse>,
}

impl ChannelResponder {
    /// Create a responder and the receiving end of its channel
    pub fn new() -> (Self, Receiver<WriteResponse>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl Responder for ChannelResponder {
    fn send_response(&self, response: WriteResponse) {
        if let Err(e) = self.tx.send(response) {
            warn!(request = %e.0.handle, "response receiver dropped");
        }
    }
}
