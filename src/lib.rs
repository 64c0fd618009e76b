//! Massive Ingest - write dispatch for multi-vnode storage nodes
//!
//! Inbound write requests may address several vnodes at once. Each vnode's
//! share is queued on that vnode's ordered queue, logged before it is
//! applied by a pooled write worker, and the per-vnode outcomes are merged
//! back into exactly one response per request.
#![warn(missing_docs)]

// Core foundational modules
pub mod core;

// Main functional modules
pub mod dispatch;
pub mod handlers;
pub mod node;
pub mod rpc;
pub mod storage;
pub mod system;
pub mod vnode;
pub mod worker;

// Re-export commonly used items for convenience
pub use crate::core::{Config, Error, MsgType, RequestHandle, Result, VnodeId, WriteError, WriteRequest};
pub use dispatch::{WriteDispatcher, WriteMessage};
pub use handlers::{HandlerRegistry, WriteHandler};
pub use node::WriteNode;
pub use rpc::{Responder, WriteResponse};
pub use vnode::{VnodeHandle, VnodeRegistry, VnodeTable};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies.
pub fn init_logging(default_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_level))
        .map_err(|e| Error::config(format!("invalid log filter: {}", e)))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| Error::internal(format!("logging already initialised: {}", e)))?;

    tracing::info!("Initializing {} v{}", NAME, VERSION);
    Ok(())
}
