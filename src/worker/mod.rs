//! Write workers
//!
//! Vnode queues, the groups that multiplex them onto worker threads, and the
//! elastic pool that owns those threads.

pub mod queue;
pub mod pool;
mod write_worker;

pub use pool::{PoolStats, SlotStats, WorkerPool};
pub use queue::{Drain, QueueGroup, ShardQueue};
