//! Fan-in of per-vnode outcomes into one response
//!
//! A request touching a single vnode answers straight from that vnode's
//! status. A request touching several shares one [`FanoutContext`]; the
//! completion that brings the count to `expected` sends the merged response.

use crate::core::error::{WriteError, WriteStatus};
use crate::core::types::RequestHandle;
use crate::dispatch::message::WriteMessage;
use crate::rpc::{Responder, WriteResponse};
use crate::system::metrics::Metrics;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, error};

/// Shared completion record of a multi-vnode request
pub struct FanoutContext {
    expected: usize,
    completed: AtomicUsize,
    first_error: OnceLock<WriteError>,
}

impl FanoutContext {
    /// Context for a request split across `expected` vnodes
    pub fn new(expected: usize) -> Arc<Self> {
        Arc::new(Self {
            expected,
            completed: AtomicUsize::new(0),
            first_error: OnceLock::new(),
        })
    }

    /// Number of vnodes the request was split across
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Completions recorded so far
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    /// Record one vnode's outcome.
    ///
    /// Returns the merged status when this call is the final completion, and
    /// `None` for every other call. The first failure recorded wins.
    pub fn record(&self, status: &WriteStatus) -> Option<WriteStatus> {
        if let Err(e) = status {
            // Set-if-none; a later failure leaves the first one in place.
            let _ = self.first_error.set(e.clone());
        }
        let done = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        if done < self.expected {
            return None;
        }
        if done > self.expected {
            error!(done, expected = self.expected, "fan-out completed more times than expected");
            return None;
        }
        Some(match self.first_error.get() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        })
    }
}

impl fmt::Debug for FanoutContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutContext")
            .field("expected", &self.expected)
            .field("completed", &self.completed())
            .field("first_error", &self.first_error.get())
            .finish()
    }
}

/// Decides when a request's response goes out
#[derive(Clone)]
pub struct ResponseMerger {
    responder: Arc<dyn Responder>,
}

impl ResponseMerger {
    /// Merger that answers through `responder`
    pub fn new(responder: Arc<dyn Responder>) -> Self {
        Self { responder }
    }

    /// Finish a processed sub-message. Consumes it, which unpins its vnode.
    ///
    /// Returns true if this completion sent the request's response.
    pub fn complete(&self, msg: WriteMessage, status: WriteStatus) -> bool {
        let sent = self.finish(msg.request(), msg.fanout(), status);
        drop(msg);
        sent
    }

    /// Record an outcome for a sub-message that never reached a queue
    pub fn finish(
        &self,
        request: RequestHandle,
        fanout: Option<&Arc<FanoutContext>>,
        status: WriteStatus,
    ) -> bool {
        let merged = match fanout {
            None => Some(status),
            Some(ctx) => ctx.record(&status),
        };
        match merged {
            Some(status) => {
                debug!(request = %request, ok = status.is_ok(), "sending write response");
                self.responder.send_response(WriteResponse { handle: request, status });
                Metrics::global().ingress.responses_sent.inc();
                true
            }
            None => false,
        }
    }
}
