//! Error types and handling for the write path
//!
//! Two families live here: the crate-level [`Error`] used for setup, I/O and
//! configuration, and [`WriteError`], the per-sub-message status that flows
//! from workers into the response merger and finally onto the wire as a code.

use crate::core::types::{MsgType, VnodeId};
use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Status codes carried on the wire in write responses
pub mod codes {
    /// Write accepted on every vnode
    pub const SUCCESS: i32 = 0;
    /// No handler is registered for the message type
    pub const MSG_NOT_PROCESSED: i32 = 0x0003;
    /// Target vnode is not hosted on this node
    pub const INVALID_VNODE_ID: i32 = 0x0011;
    /// The vnode's write queue was closed before the message was queued
    pub const VNODE_CLOSED: i32 = 0x0012;
    /// Appending to or syncing the write-ahead log failed
    pub const WAL_IO: i32 = 0x0021;
    /// The handler panicked while applying the write
    pub const HANDLER_PANICKED: i32 = 0x0031;
}

/// Main error type for the ingest node
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed inbound envelope
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file decode errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal system errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Envelope parse failures. Any of these rejects the whole request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Fewer bytes remain than a record header needs
    #[error("truncated record header at offset {offset}: {remaining} bytes left")]
    TruncatedHeader {
        /// Byte offset of the record
        offset: usize,
        /// Bytes remaining in the buffer
        remaining: usize,
    },

    /// Declared payload length runs past the end of the buffer
    #[error("record at offset {offset} declares {declared} payload bytes but only {remaining} remain")]
    LengthOverrun {
        /// Byte offset of the record
        offset: usize,
        /// Declared payload length
        declared: usize,
        /// Bytes remaining after the header
        remaining: usize,
    },

    /// The envelope carried no records at all
    #[error("envelope contains no vnode records")]
    Empty,
}

/// Outcome of processing one sub-message on its vnode.
///
/// Cloned into the fan-out context when it is the first failure of a request,
/// so it only carries owned, cheap data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// The vnode could not be resolved on this node
    #[error("{0} is not hosted on this node")]
    VnodeNotFound(VnodeId),

    /// The vnode's queue was released before the message reached it
    #[error("write queue of {0} is closed")]
    QueueClosed(VnodeId),

    /// The write-ahead log append or sync failed
    #[error("durability write failed on {vnode}: {reason}")]
    Durability {
        /// Vnode whose log failed
        vnode: VnodeId,
        /// Underlying failure
        reason: String,
    },

    /// No handler registered for the message type
    #[error("message type {0} not processed")]
    Unsupported(MsgType),

    /// A handler rejected the write with its own status code
    #[error("handler rejected write with code {code:#06x}")]
    Handler {
        /// Handler-defined, non-zero status code
        code: i32,
    },
}

impl WriteError {
    /// Create a durability error from an I/O failure
    pub fn durability(vnode: VnodeId, err: impl std::fmt::Display) -> Self {
        Self::Durability {
            vnode,
            reason: err.to_string(),
        }
    }

    /// Wire status code for this error. Never [`codes::SUCCESS`].
    pub fn code(&self) -> i32 {
        match self {
            Self::VnodeNotFound(_) => codes::INVALID_VNODE_ID,
            Self::QueueClosed(_) => codes::VNODE_CLOSED,
            Self::Durability { .. } => codes::WAL_IO,
            Self::Unsupported(_) => codes::MSG_NOT_PROCESSED,
            // A handler returning 0 through the error path is still a failure.
            Self::Handler { code } if *code == codes::SUCCESS => codes::MSG_NOT_PROCESSED,
            Self::Handler { code } => *code,
        }
    }
}

/// Per-item write status
pub type WriteStatus = std::result::Result<(), WriteError>;

/// Convert an item status to its wire code
pub fn status_code(status: &WriteStatus) -> i32 {
    match status {
        Ok(()) => codes::SUCCESS,
        Err(e) => e.code(),
    }
}
