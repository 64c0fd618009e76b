//! Write node wiring
//!
//! Builds the worker pool, response merger and dispatcher from configuration
//! around the collaborators the host process supplies.

use crate::core::config::{Config, DispatchConfig};
use crate::core::error::{EnvelopeError, Result};
use crate::core::types::{VnodeId, WriteRequest};
use crate::dispatch::{DispatcherStats, ResponseMerger, WriteDispatcher};
use crate::handlers::HandlerRegistry;
use crate::rpc::Responder;
use crate::storage::{create_wal, WriteAheadLog};
use crate::vnode::VnodeRegistry;
use crate::worker::WorkerPool;
use std::sync::Arc;
use tracing::info;

/// The write path of one storage node
pub struct WriteNode {
    dispatcher: WriteDispatcher,
}

impl WriteNode {
    /// Build a node with the log backend chosen in `config`
    pub fn new(
        config: &Config,
        registry: Arc<dyn VnodeRegistry>,
        handlers: Arc<HandlerRegistry>,
        responder: Arc<dyn Responder>,
    ) -> Result<Self> {
        let wal = create_wal(&config.storage)?;
        Ok(Self::with_wal(&config.dispatch, registry, wal, handlers, responder))
    }

    /// Build a node around an existing log
    pub fn with_wal(
        config: &DispatchConfig,
        registry: Arc<dyn VnodeRegistry>,
        wal: Arc<dyn WriteAheadLog>,
        handlers: Arc<HandlerRegistry>,
        responder: Arc<dyn Responder>,
    ) -> Self {
        let merger = ResponseMerger::new(responder);
        let pool = WorkerPool::new(config, wal, Arc::clone(&handlers), merger.clone());
        info!(workers = pool.capacity(), handlers = ?handlers, "write node ready");
        Self {
            dispatcher: WriteDispatcher::new(registry, merger, pool),
        }
    }

    /// Dispatch one inbound write request
    pub fn dispatch_write(&self, request: WriteRequest) -> std::result::Result<usize, EnvelopeError> {
        self.dispatcher.dispatch_write(request)
    }

    /// Forget a vnode's write queue after the vnode was closed
    pub fn release_vnode(&self, vnode: VnodeId) -> bool {
        self.dispatcher.release_vnode(vnode)
    }

    /// The dispatcher
    pub fn dispatcher(&self) -> &WriteDispatcher {
        &self.dispatcher
    }

    /// Snapshot of dispatch state
    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    /// Drain queued writes and stop every worker
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}
