//! Elastic write worker pool
//!
//! A fixed number of slots, each either empty or running one worker thread
//! that owns a [`QueueGroup`]. New vnodes are assigned to slots round-robin;
//! the assignment is made once per vnode queue, which is what keeps writes to
//! one vnode on one thread.
//!
//! A released vnode remembers the group its queue lived in. Until that group
//! retires, a re-created queue for the vnode joins the same group, so writes
//! still in its backlog run before newer ones.
//!
//! A worker whose group has lost every member asks the pool to retire it.
//! The pool re-checks emptiness under the same lock `assign_queue` takes, so
//! a retiring worker can never strand a freshly assigned queue.

use crate::core::config::DispatchConfig;
use crate::core::error::{Error, Result};
use crate::core::types::VnodeId;
use crate::dispatch::fanout::ResponseMerger;
use crate::handlers::HandlerRegistry;
use crate::storage::WriteAheadLog;
use crate::worker::queue::{QueueGroup, ShardQueue};
use crate::worker::write_worker::{self, WorkerContext};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Collaborators every worker needs
pub(crate) struct PoolShared {
    pub(crate) wal: Arc<dyn WriteAheadLog>,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) merger: ResponseMerger,
    pub(crate) idle_backoff: Duration,
    pub(crate) max_batch_items: usize,
    slots: Mutex<PoolState>,
}

#[derive(Default)]
struct Slot {
    group: Option<Arc<QueueGroup>>,
    handle: Option<JoinHandle<()>>,
}

struct PoolState {
    slots: Vec<Slot>,
    /// Next slot to assign, cycles 0..capacity
    cursor: usize,
    /// Group each released vnode queue belonged to, while that group lives
    released: HashMap<VnodeId, Arc<QueueGroup>>,
    shut_down: bool,
}

/// Per-slot snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStats {
    /// Slot index
    pub slot: usize,
    /// Whether a worker currently owns the slot
    pub live: bool,
    /// Vnode queues assigned to the slot
    pub queues: usize,
    /// Items waiting in the slot's group
    pub pending: usize,
}

/// Statistics about the worker pool
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Slot capacity
    pub capacity: usize,
    /// Slots with a running worker
    pub live_workers: usize,
    /// Per-slot detail
    pub slots: Vec<SlotStats>,
}

/// Bounded pool of write workers
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Create a pool. No thread starts until the first queue is assigned.
    pub fn new(
        config: &DispatchConfig,
        wal: Arc<dyn WriteAheadLog>,
        handlers: Arc<HandlerRegistry>,
        merger: ResponseMerger,
    ) -> Self {
        let capacity = config.worker_slots();
        info!(capacity, "write worker pool created");
        let shared = PoolShared {
            wal,
            handlers,
            merger,
            idle_backoff: config.idle_backoff(),
            max_batch_items: config.max_batch_items,
            slots: Mutex::new(PoolState {
                slots: (0..capacity).map(|_| Slot::default()).collect(),
                cursor: 0,
                released: HashMap::new(),
                shut_down: false,
            }),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.shared.slots.lock().slots.len()
    }

    /// Create a queue for `vnode` on the next slot, starting that slot's
    /// worker if it is not running. A vnode released from a still-live
    /// worker goes back to that worker.
    pub fn assign_queue(&self, vnode: VnodeId) -> Result<ShardQueue> {
        let mut state = self.shared.slots.lock();
        if state.shut_down {
            return Err(Error::internal("worker pool is shut down"));
        }
        if let Some(previous) = state.released.remove(&vnode) {
            let index = previous.slot();
            let alive = state.slots[index]
                .group
                .as_ref()
                .map(|g| Arc::ptr_eq(g, &previous))
                .unwrap_or(false);
            if alive {
                let queue = previous.add_queue(vnode);
                debug!(vnode = %vnode, worker = index, "vnode queue re-created on its previous worker");
                return Ok(queue);
            }
        }

        let capacity = state.slots.len();
        let index = state.cursor;

        let group = match state.slots[index].group.clone() {
            Some(group) => group,
            None => {
                // The previous worker already retired; reap its thread.
                if let Some(old) = state.slots[index].handle.take() {
                    join_worker(index, old);
                }
                let group = QueueGroup::new(index);
                let handle = self.spawn_worker(index, Arc::clone(&group))?;
                let slot = &mut state.slots[index];
                slot.group = Some(Arc::clone(&group));
                slot.handle = Some(handle);
                group
            }
        };

        let queue = group.add_queue(vnode);
        state.cursor = (index + 1) % capacity;
        debug!(vnode = %vnode, worker = index, "vnode queue assigned");
        Ok(queue)
    }

    /// Detach a vnode queue from its worker. Items it still holds are
    /// processed; the worker retires once it owns no queues.
    pub fn release_queue(&self, queue: &ShardQueue) {
        let vnode = queue.vnode();
        let mut state = self.shared.slots.lock();
        if queue.close() {
            state.released.insert(vnode, Arc::clone(queue.group()));
            debug!(vnode = %vnode, worker = queue.slot(), "vnode queue released");
        }
    }

    /// Stop every worker after it has finished its pending items, and join
    /// their threads. New assignments fail afterwards.
    pub fn shutdown(&self) {
        let handles: Vec<(usize, JoinHandle<()>)> = {
            let mut state = self.shared.slots.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.released.clear();
            state
                .slots
                .iter_mut()
                .enumerate()
                .filter_map(|(index, slot)| {
                    if let Some(group) = slot.group.take() {
                        group.stop();
                    }
                    slot.handle.take().map(|handle| (index, handle))
                })
                .collect()
        };
        // Joined outside the lock: a worker may be waiting on it to retire.
        for (index, handle) in handles {
            join_worker(index, handle);
        }
        info!("write worker pool shut down");
    }

    /// Snapshot of the pool
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.slots.lock();
        let slots: Vec<SlotStats> = state
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| match &slot.group {
                Some(group) => SlotStats {
                    slot: index,
                    live: true,
                    queues: group.member_count(),
                    pending: group.pending(),
                },
                None => SlotStats {
                    slot: index,
                    live: false,
                    queues: 0,
                    pending: 0,
                },
            })
            .collect();
        PoolStats {
            capacity: slots.len(),
            live_workers: slots.iter().filter(|s| s.live).count(),
            slots,
        }
    }

    fn spawn_worker(&self, index: usize, group: Arc<QueueGroup>) -> Result<JoinHandle<()>> {
        let ctx = WorkerContext {
            slot: index,
            group,
            shared: Arc::clone(&self.shared),
        };
        let handle = thread::Builder::new()
            .name(format!("write-worker-{}", index))
            .spawn(move || write_worker::run(ctx))
            .map_err(|e| Error::internal(format!("failed to spawn write worker {index}: {e}")))?;
        info!(worker = index, "write worker started");
        Ok(handle)
    }
}

impl PoolShared {
    /// Called by a worker whose group reported no members. Returns true if
    /// the worker should exit.
    pub(crate) fn try_retire(&self, index: usize, group: &Arc<QueueGroup>) -> bool {
        let mut state = self.slots.lock();
        let slot = &mut state.slots[index];
        let current = slot
            .group
            .as_ref()
            .map(|g| Arc::ptr_eq(g, group))
            .unwrap_or(false);
        if !current {
            // Shut down or already replaced; nothing can reach this group.
            return true;
        }
        if !group.retire_if_empty() {
            return false;
        }
        // The thread handle stays until the next assignment or shutdown joins it.
        slot.group = None;
        state.released.retain(|_, g| !Arc::ptr_eq(g, group));
        info!(worker = index, "write worker retiring, no vnode queues left");
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join_worker(index: usize, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        warn!(worker = index, "write worker panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{MsgType, RequestHandle};
    use crate::dispatch::WriteMessage;
    use crate::rpc::{ChannelResponder, WriteResponse};
    use crate::storage::MemoryWal;
    use crate::vnode::{VnodeHandle, VnodePin, VnodeRegistry, VnodeTable};
    use bytes::Bytes;
    use crossbeam::channel::Receiver;
    use std::sync::Barrier;
    use std::time::Instant;

    fn pool(workers: usize) -> WorkerPool {
        let config = DispatchConfig {
            worker_threads: workers,
            idle_backoff_us: 50,
            max_batch_items: 0,
        };
        let (responder, _rx) = ChannelResponder::new();
        WorkerPool::new(
            &config,
            Arc::new(MemoryWal::new()),
            HandlerRegistry::builder().build(),
            ResponseMerger::new(Arc::new(responder)),
        )
    }

    fn answering_pool(workers: usize) -> (WorkerPool, Receiver<WriteResponse>) {
        let config = DispatchConfig {
            worker_threads: workers,
            idle_backoff_us: 50,
            max_batch_items: 0,
        };
        let (responder, responses) = ChannelResponder::new();
        let handlers = HandlerRegistry::builder()
            .register_fn(MsgType::SUBMIT, |_: &VnodeHandle, _: &WriteMessage| Ok(()))
            .build();
        let pool = WorkerPool::new(
            &config,
            Arc::new(MemoryWal::new()),
            handlers,
            ResponseMerger::new(Arc::new(responder)),
        );
        (pool, responses)
    }

    fn registry(ids: &[u32]) -> Arc<dyn VnodeRegistry> {
        let table = VnodeTable::new();
        for id in ids {
            table.open(VnodeId(*id));
        }
        Arc::new(table)
    }

    fn message(registry: &Arc<dyn VnodeRegistry>, vnode: u32, request: u64) -> WriteMessage {
        WriteMessage::new(
            VnodePin::acquire(registry, VnodeId(vnode)).unwrap(),
            RequestHandle(request),
            MsgType::SUBMIT,
            Bytes::from_static(b"row"),
            None,
        )
    }

    fn wait_until(what: &str, mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn assignment_is_round_robin() {
        let pool = pool(3);
        let slots: Vec<usize> = (0..7)
            .map(|v| pool.assign_queue(VnodeId(v)).unwrap().slot())
            .collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(pool.stats().live_workers, 3);
    }

    #[test]
    fn worker_retires_and_is_recreated() {
        let pool = pool(1);
        let queue = pool.assign_queue(VnodeId(1)).unwrap();
        assert!(pool.stats().slots[0].live);

        pool.release_queue(&queue);
        wait_until("worker retirement", || !pool.stats().slots[0].live);

        let queue = pool.assign_queue(VnodeId(2)).unwrap();
        let stats = pool.stats();
        assert!(stats.slots[0].live);
        assert_eq!(stats.slots[0].queues, 1);
        assert_eq!(queue.slot(), 0);
    }

    #[test]
    fn worker_keeps_running_while_it_owns_queues() {
        let pool = pool(1);
        let a = pool.assign_queue(VnodeId(1)).unwrap();
        let _b = pool.assign_queue(VnodeId(2)).unwrap();
        pool.release_queue(&a);
        thread::sleep(Duration::from_millis(50));
        let stats = pool.stats();
        assert!(stats.slots[0].live);
        assert_eq!(stats.slots[0].queues, 1);
    }

    #[test]
    fn shutdown_refuses_new_assignments() {
        let pool = pool(2);
        let _queue = pool.assign_queue(VnodeId(1)).unwrap();
        pool.shutdown();
        assert_eq!(pool.stats().live_workers, 0);
        assert!(pool.assign_queue(VnodeId(2)).is_err());
        // Second shutdown is a no-op.
        pool.shutdown();
    }

    #[test]
    fn recreated_queue_returns_to_its_live_worker() {
        let pool = pool(2);
        let first = pool.assign_queue(VnodeId(1)).unwrap();
        let _second = pool.assign_queue(VnodeId(2)).unwrap();
        let _third = pool.assign_queue(VnodeId(3)).unwrap();
        assert_eq!(first.slot(), 0);

        // Slot 0 stays live through vnode 3; the cursor now points at slot 1.
        pool.release_queue(&first);
        let again = pool.assign_queue(VnodeId(1)).unwrap();
        assert_eq!(again.slot(), 0);
        assert_eq!(pool.assign_queue(VnodeId(4)).unwrap().slot(), 1);
    }

    #[test]
    fn retired_worker_forgets_released_vnodes() {
        let pool = pool(2);
        let queue = pool.assign_queue(VnodeId(1)).unwrap();
        pool.release_queue(&queue);
        wait_until("worker retirement", || !pool.stats().slots[0].live);
        assert!(pool.shared.slots.lock().released.is_empty());
    }

    #[test]
    fn release_racing_assignment_loses_no_writes() {
        const ROUNDS: u64 = 200;
        let (pool, responses) = answering_pool(1);
        let pool = Arc::new(pool);
        let registry = registry(&[1, 2]);

        for round in 0..ROUNDS {
            let last = pool.assign_queue(VnodeId(1)).unwrap();
            last.push(message(&registry, 1, round)).unwrap();

            let start = Arc::new(Barrier::new(2));
            let releaser = {
                let pool = Arc::clone(&pool);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    pool.release_queue(&last);
                })
            };
            start.wait();
            let next = pool.assign_queue(VnodeId(2)).unwrap();
            next.push(message(&registry, 2, ROUNDS + round)).unwrap();
            releaser.join().unwrap();
            pool.release_queue(&next);
        }

        let mut answered: Vec<u64> = (0..2 * ROUNDS)
            .map(|_| {
                responses
                    .recv_timeout(Duration::from_secs(5))
                    .expect("every pushed write is answered")
                    .handle
                    .0
            })
            .collect();
        answered.sort_unstable();
        assert_eq!(answered, (0..2 * ROUNDS).collect::<Vec<_>>());
    }
}
