//! Handler registry
//!
//! Maps a [`MsgType`] to the business logic that applies it on a vnode. Built
//! once at startup and shared read-only with every write worker.

use crate::core::error::{WriteError, WriteStatus};
use crate::core::types::MsgType;
use crate::dispatch::WriteMessage;
use crate::vnode::VnodeHandle;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Applies one logged write to its vnode.
///
/// Handlers run synchronously on a write worker and must not block on other
/// vnodes; the worker serves every vnode assigned to its slot.
pub trait WriteHandler: Send + Sync + 'static {
    /// Apply `msg` to `vnode`
    fn apply(&self, vnode: &VnodeHandle, msg: &WriteMessage) -> WriteStatus;
}

impl<F> WriteHandler for F
where
    F: Fn(&VnodeHandle, &WriteMessage) -> WriteStatus + Send + Sync + 'static,
{
    fn apply(&self, vnode: &VnodeHandle, msg: &WriteMessage) -> WriteStatus {
        self(vnode, msg)
    }
}

/// Immutable message-type to handler table
pub struct HandlerRegistry {
    handlers: HashMap<MsgType, Box<dyn WriteHandler>>,
}

impl HandlerRegistry {
    /// Start building a registry
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Whether a handler exists for `msg_type`
    pub fn supports(&self, msg_type: MsgType) -> bool {
        self.handlers.contains_key(&msg_type)
    }

    /// Apply `msg` with the handler registered for its type
    pub fn apply(&self, vnode: &VnodeHandle, msg: &WriteMessage) -> WriteStatus {
        match self.handlers.get(&msg.msg_type()) {
            Some(handler) => handler.apply(vnode, msg),
            None => Err(WriteError::Unsupported(msg.msg_type())),
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort();
        f.debug_struct("HandlerRegistry").field("types", &types).finish()
    }
}

/// Builder for [`HandlerRegistry`]
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<MsgType, Box<dyn WriteHandler>>,
}

impl HandlerRegistryBuilder {
    /// Register `handler` for `msg_type`, replacing any previous one
    pub fn register(mut self, msg_type: MsgType, handler: impl WriteHandler) -> Self {
        self.handlers.insert(msg_type, Box::new(handler));
        self
    }

    /// Register a closure for `msg_type`
    pub fn register_fn<F>(self, msg_type: MsgType, f: F) -> Self
    where
        F: Fn(&VnodeHandle, &WriteMessage) -> WriteStatus + Send + Sync + 'static,
    {
        self.register(msg_type, f)
    }

    /// Freeze the table
    pub fn build(self) -> Arc<HandlerRegistry> {
        Arc::new(HandlerRegistry {
            handlers: self.handlers,
        })
    }
}
