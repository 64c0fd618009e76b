//! Write dispatch
//!
//! Envelope splitting, per-vnode sub-messages, and the fan-in of their
//! outcomes back into a single response.

pub mod envelope;
pub mod fanout;
pub mod message;
pub mod dispatcher;

pub use dispatcher::{DispatcherStats, WriteDispatcher};
pub use envelope::{encode_envelope, split_envelope, SubPayload};
pub use fanout::{FanoutContext, ResponseMerger};
pub use message::WriteMessage;
