//! Core types and foundations
//!
//! Identifiers, error handling and configuration shared by every other module.

pub mod types;
pub mod error;
pub mod config;

// Re-export commonly used items
pub use types::{MsgType, RequestHandle, VnodeId, WriteRequest};
pub use error::{codes, EnvelopeError, Error, Result, WriteError, WriteStatus};
pub use config::{load_config_or_default, Config};
