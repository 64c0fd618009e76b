//! Durability layer
//!
//! The write path only needs an append/flush log per vnode; concrete backends
//! are chosen from configuration.

pub mod wal;

pub use wal::{FileWal, MemoryWal, WalEvent, WriteAheadLog};

use crate::core::config::{StorageConfig, WalKind};
use crate::core::Result;
use std::sync::Arc;

/// Build the write-ahead log described by `config`
pub fn create_wal(config: &StorageConfig) -> Result<Arc<dyn WriteAheadLog>> {
    let wal: Arc<dyn WriteAheadLog> = match config.wal {
        WalKind::Memory => Arc::new(MemoryWal::new()),
        WalKind::File => Arc::new(FileWal::open(config.data_dir.join("wal"), config.fsync)?),
    };
    Ok(wal)
}
