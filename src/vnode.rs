//! Vnode lookup and pinning
//!
//! The write path never owns vnodes. It resolves a [`VnodeId`] through a
//! [`VnodeRegistry`] and holds a [`VnodePin`] for as long as a sub-message is
//! in flight, so the registry can defer teardown of a vnode that still has
//! queued writes.

use crate::core::types::VnodeId;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A vnode as seen by the write path
pub trait Vnode: Send + Sync + 'static {
    /// Identifier of this vnode
    fn id(&self) -> VnodeId;
}

/// Shared handle to a live vnode
pub type VnodeHandle = Arc<dyn Vnode>;

/// Registry mapping vnode ids to live vnodes
pub trait VnodeRegistry: Send + Sync + 'static {
    /// Resolve `id` to a live vnode, or `None` if it is not hosted here
    fn lookup(&self, id: VnodeId) -> Option<VnodeHandle>;

    /// Take a reference that keeps the vnode from being torn down
    fn pin(&self, vnode: &VnodeHandle);

    /// Drop a reference taken by [`VnodeRegistry::pin`]
    fn release(&self, vnode: &VnodeHandle);
}

/// A pinned vnode. Releasing the pin happens on drop, so every exit path of
/// a sub-message (success, durability failure, unsupported type) unpins once.
pub struct VnodePin {
    vnode: VnodeHandle,
    registry: Arc<dyn VnodeRegistry>,
}

impl VnodePin {
    /// Look up and pin a vnode
    pub fn acquire(registry: &Arc<dyn VnodeRegistry>, id: VnodeId) -> Option<Self> {
        let vnode = registry.lookup(id)?;
        registry.pin(&vnode);
        Some(Self {
            vnode,
            registry: Arc::clone(registry),
        })
    }

    /// The pinned vnode
    pub fn vnode(&self) -> &VnodeHandle {
        &self.vnode
    }

    /// Identifier of the pinned vnode
    pub fn id(&self) -> VnodeId {
        self.vnode.id()
    }
}

impl Drop for VnodePin {
    fn drop(&mut self) {
        self.registry.release(&self.vnode);
    }
}

impl fmt::Debug for VnodePin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VnodePin").field("vnode", &self.id()).finish()
    }
}

/// Vnode kept by [`VnodeTable`]
#[derive(Debug)]
pub struct LocalVnode {
    id: VnodeId,
}

impl Vnode for LocalVnode {
    fn id(&self) -> VnodeId {
        self.id
    }
}

/// In-memory vnode registry with pin accounting.
///
/// Stands in for the node's vnode manager in the binary and in tests.
#[derive(Default)]
pub struct VnodeTable {
    vnodes: DashMap<VnodeId, Arc<LocalVnode>>,
    pins: DashMap<VnodeId, AtomicU64>,
}

impl VnodeTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Host a vnode on this node. Returns false if it was already open.
    pub fn open(&self, id: VnodeId) -> bool {
        let mut opened = false;
        self.vnodes.entry(id).or_insert_with(|| {
            opened = true;
            Arc::new(LocalVnode { id })
        });
        if opened {
            debug!(vnode = %id, "vnode opened");
        }
        opened
    }

    /// Stop hosting a vnode. Pinned in-flight writes keep their handle.
    pub fn close(&self, id: VnodeId) -> bool {
        let closed = self.vnodes.remove(&id).is_some();
        if closed {
            debug!(vnode = %id, pins = self.pin_count(id), "vnode closed");
        }
        closed
    }

    /// Whether `id` is currently hosted
    pub fn contains(&self, id: VnodeId) -> bool {
        self.vnodes.contains_key(&id)
    }

    /// Outstanding pins on `id`
    pub fn pin_count(&self, id: VnodeId) -> u64 {
        self.pins
            .get(&id)
            .map(|count| count.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Sum of outstanding pins across all vnodes
    pub fn total_pins(&self) -> u64 {
        self.pins
            .iter()
            .map(|entry| entry.value().load(Ordering::Acquire))
            .sum()
    }
}

impl VnodeRegistry for VnodeTable {
    fn lookup(&self, id: VnodeId) -> Option<VnodeHandle> {
        self.vnodes
            .get(&id)
            .map(|entry| Arc::clone(entry.value()) as VnodeHandle)
    }

    fn pin(&self, vnode: &VnodeHandle) {
        self.pins
            .entry(vnode.id())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self, vnode: &VnodeHandle) {
        if let Some(count) = self.pins.get(&vnode.id()) {
            // Saturate rather than wrap on an unbalanced release.
            let _ = count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }
}
