//! Inbound write dispatch
//!
//! Splits a request into per-vnode sub-messages and routes each to the queue
//! of its vnode, assigning a queue (and so a worker) on a vnode's first write.

use crate::core::error::{EnvelopeError, WriteError};
use crate::core::types::{VnodeId, WriteRequest};
use crate::dispatch::envelope::split_envelope;
use crate::dispatch::fanout::{FanoutContext, ResponseMerger};
use crate::dispatch::message::WriteMessage;
use crate::system::metrics::Metrics;
use crate::vnode::{VnodePin, VnodeRegistry};
use crate::worker::{PoolStats, ShardQueue, WorkerPool};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Statistics about the dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherStats {
    /// Vnodes with an assigned write queue
    pub vnode_queues: usize,
    /// Worker pool snapshot
    pub pool: PoolStats,
}

/// Routes write requests onto vnode queues
pub struct WriteDispatcher {
    registry: Arc<dyn VnodeRegistry>,
    merger: ResponseMerger,
    queues: DashMap<VnodeId, ShardQueue>,
    pool: WorkerPool,
}

impl WriteDispatcher {
    /// Dispatcher over `pool`. `merger` answers requests that fail before
    /// reaching a queue and must share the pool's responder.
    pub fn new(registry: Arc<dyn VnodeRegistry>, merger: ResponseMerger, pool: WorkerPool) -> Self {
        Self {
            registry,
            merger,
            queues: DashMap::new(),
            pool,
        }
    }

    /// Split `request` and queue each vnode's share.
    ///
    /// Returns the number of sub-messages the request was split into. A
    /// malformed envelope is rejected before anything is queued, and no
    /// response is sent for it; the caller owns that failure. Otherwise
    /// exactly one response is eventually sent for the request.
    pub fn dispatch_write(&self, request: WriteRequest) -> Result<usize, EnvelopeError> {
        let metrics = &Metrics::global().ingress;
        let records = split_envelope(&request.body).map_err(|e| {
            warn!(request = %request.handle, error = %e, "rejecting malformed write envelope");
            metrics.requests_rejected.inc();
            e
        })?;
        metrics.requests_dispatched.inc();

        let count = records.len();
        let fanout = (count > 1).then(|| FanoutContext::new(count));
        debug!(request = %request.handle, msg_type = %request.msg_type, vnodes = count, "dispatching write");

        for record in records {
            let Some(pin) = VnodePin::acquire(&self.registry, record.vnode) else {
                warn!(request = %request.handle, vnode = %record.vnode, "vnode not hosted, failing its share");
                metrics.vnode_not_found.inc();
                self.merger.finish(
                    request.handle,
                    fanout.as_ref(),
                    Err(WriteError::VnodeNotFound(record.vnode)),
                );
                continue;
            };

            let msg = WriteMessage::new(
                pin,
                request.handle,
                request.msg_type,
                record.payload,
                fanout.clone(),
            );
            match self.enqueue(msg) {
                Ok(()) => metrics.sub_messages_enqueued.inc(),
                Err(msg) => {
                    let vnode = msg.vnode_id();
                    warn!(request = %request.handle, vnode = %vnode, "vnode queue closed, failing its share");
                    self.merger.complete(msg, Err(WriteError::QueueClosed(vnode)));
                }
            }
        }
        Ok(count)
    }

    fn enqueue(&self, msg: WriteMessage) -> Result<(), WriteMessage> {
        let vnode = msg.vnode_id();
        if let Some(queue) = self.queues.get(&vnode) {
            return queue.push(msg);
        }

        match self.queues.entry(vnode) {
            Entry::Occupied(entry) => entry.get().push(msg),
            Entry::Vacant(entry) => {
                // A vnode closed after it was pinned must not get a fresh queue.
                if self.registry.lookup(vnode).is_none() {
                    return Err(msg);
                }
                match self.pool.assign_queue(vnode) {
                    Ok(queue) => entry.insert(queue).push(msg),
                    Err(e) => {
                        error!(vnode = %vnode, error = %e, "failed to assign vnode queue");
                        Err(msg)
                    }
                }
            }
        }
    }

    /// Release the write queue of a vnode that stopped being hosted here.
    ///
    /// Writes already queued are still logged, applied and answered.
    pub fn release_vnode(&self, vnode: VnodeId) -> bool {
        // Released under the entry lock so a racing write cannot assign a
        // fresh queue before the pool knows where the old one lived.
        match self.queues.entry(vnode) {
            Entry::Occupied(entry) => {
                self.pool.release_queue(entry.get());
                entry.remove();
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Worker slot serving `vnode`, if it has a queue
    pub fn slot_of(&self, vnode: VnodeId) -> Option<usize> {
        self.queues.get(&vnode).map(|queue| queue.slot())
    }

    /// The worker pool
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Snapshot of dispatcher state
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            vnode_queues: self.queues.len(),
            pool: self.pool.stats(),
        }
    }

    /// Finish queued work and stop the workers
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
