//! Per-vnode write queues multiplexed onto one worker
//!
//! A [`QueueGroup`] owns the pending items of every [`ShardQueue`] assigned to
//! one worker slot. Producers push through their vnode's `ShardQueue`; the
//! slot's worker drains everything pending across all members in one call.
//!
//! Ordering: each member is a FIFO and a drain only ever takes a prefix of
//! each member, so writes to one vnode leave the group in arrival order.

use crate::core::types::VnodeId;
use crate::dispatch::WriteMessage;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Longest a drain blocks before reporting an idle group
pub const DRAIN_WAIT: Duration = Duration::from_millis(100);

/// Result of one drain of a [`QueueGroup`]
#[derive(Debug)]
pub enum Drain {
    /// Items pending across the members, per-vnode FIFO
    Batch(Vec<WriteMessage>),
    /// Members exist but nothing arrived within the wait
    Idle,
    /// The group has no members and nothing pending
    Orphaned,
    /// The group was stopped and everything pending has been handed out
    Stopped,
}

struct Member {
    id: u64,
    vnode: VnodeId,
    items: VecDeque<WriteMessage>,
}

#[derive(Default)]
struct GroupState {
    members: Vec<Member>,
    /// Undrained items of members released before their worker got to them
    backlog: VecDeque<WriteMessage>,
    pending: usize,
    next_id: u64,
    /// Member index the next bounded drain starts from
    cursor: usize,
    stopping: bool,
}

/// Set of vnode queues served by one worker
pub struct QueueGroup {
    slot: usize,
    state: Mutex<GroupState>,
    ready: Condvar,
}

impl QueueGroup {
    /// Empty group for pool slot `slot`
    pub fn new(slot: usize) -> Arc<Self> {
        Arc::new(Self {
            slot,
            state: Mutex::new(GroupState::default()),
            ready: Condvar::new(),
        })
    }

    /// Pool slot this group belongs to
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Number of member queues
    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    /// Items waiting to be drained
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    /// Add a new queue for `vnode`
    pub fn add_queue(self: &Arc<Self>, vnode: VnodeId) -> ShardQueue {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.members.push(Member {
            id,
            vnode,
            items: VecDeque::new(),
        });
        ShardQueue {
            id,
            vnode,
            group: Arc::clone(self),
        }
    }

    fn push(&self, id: u64, msg: WriteMessage) -> Result<(), WriteMessage> {
        let mut state = self.state.lock();
        if state.stopping {
            return Err(msg);
        }
        match state.members.iter_mut().find(|m| m.id == id) {
            Some(member) => member.items.push_back(msg),
            None => return Err(msg),
        }
        state.pending += 1;
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    fn remove_queue(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        let Some(index) = state.members.iter().position(|m| m.id == id) else {
            return false;
        };
        let member = state.members.remove(index);
        state.backlog.extend(member.items);
        drop(state);
        // Wake the worker so it can notice the group may now be empty.
        self.ready.notify_all();
        true
    }

    /// Block until items are pending, the group empties, or `wait` elapses.
    ///
    /// `max_items == 0` takes everything pending.
    pub fn drain(&self, max_items: usize, wait: Duration) -> Drain {
        let mut state = self.state.lock();
        if state.pending == 0 && !state.stopping && !state.members.is_empty() {
            let _ = self.ready.wait_for(&mut state, wait);
        }

        if state.pending > 0 {
            return Drain::Batch(take_pending(&mut state, max_items));
        }
        if state.stopping {
            Drain::Stopped
        } else if state.members.is_empty() {
            Drain::Orphaned
        } else {
            Drain::Idle
        }
    }

    /// Mark the group retired if it still has no members and nothing pending.
    ///
    /// Callers hold the pool lock, which also guards member additions, so a
    /// `true` here cannot race with a new assignment.
    pub(crate) fn retire_if_empty(&self) -> bool {
        let mut state = self.state.lock();
        if state.members.is_empty() && state.pending == 0 {
            state.stopping = true;
            true
        } else {
            false
        }
    }

    /// Refuse further pushes and let the worker finish what is pending
    pub fn stop(&self) {
        self.state.lock().stopping = true;
        self.ready.notify_all();
    }
}

fn take_pending(state: &mut GroupState, max_items: usize) -> Vec<WriteMessage> {
    let limit = if max_items == 0 { state.pending } else { max_items.min(state.pending) };
    let mut batch = Vec::with_capacity(limit);

    while batch.len() < limit {
        match state.backlog.pop_front() {
            Some(msg) => batch.push(msg),
            None => break,
        }
    }

    let count = state.members.len();
    if count > 0 {
        let start = state.cursor % count;
        for step in 0..count {
            if batch.len() >= limit {
                break;
            }
            let member = &mut state.members[(start + step) % count];
            let take = (limit - batch.len()).min(member.items.len());
            batch.extend(member.items.drain(..take));
        }
        state.cursor = (start + 1) % count;
    }

    state.pending -= batch.len();
    batch
}

impl fmt::Debug for QueueGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let vnodes: Vec<_> = state.members.iter().map(|m| m.vnode).collect();
        f.debug_struct("QueueGroup")
            .field("slot", &self.slot)
            .field("vnodes", &vnodes)
            .field("pending", &state.pending)
            .field("stopping", &state.stopping)
            .finish()
    }
}

/// Producer-side handle to one vnode's queue inside a [`QueueGroup`]
pub struct ShardQueue {
    id: u64,
    vnode: VnodeId,
    group: Arc<QueueGroup>,
}

impl ShardQueue {
    /// Vnode this queue serves
    pub fn vnode(&self) -> VnodeId {
        self.vnode
    }

    /// Worker slot that owns this queue
    pub fn slot(&self) -> usize {
        self.group.slot()
    }

    /// Append a message. Hands it back if the queue has been released or
    /// its group is shutting down.
    pub fn push(&self, msg: WriteMessage) -> Result<(), WriteMessage> {
        self.group.push(self.id, msg)
    }

    /// Remove this queue from its group. Items not yet drained stay with
    /// the group and are still processed.
    pub(crate) fn close(&self) -> bool {
        self.group.remove_queue(self.id)
    }

    pub(crate) fn group(&self) -> &Arc<QueueGroup> {
        &self.group
    }
}

impl fmt::Debug for ShardQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardQueue")
            .field("vnode", &self.vnode)
            .field("slot", &self.slot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{MsgType, RequestHandle};
    use crate::vnode::{VnodePin, VnodeRegistry, VnodeTable};
    use bytes::Bytes;
    use std::thread;

    fn registry(ids: &[u32]) -> Arc<dyn VnodeRegistry> {
        let table = VnodeTable::new();
        for id in ids {
            table.open(VnodeId(*id));
        }
        Arc::new(table)
    }

    fn msg(registry: &Arc<dyn VnodeRegistry>, vnode: u32, seq: u64) -> WriteMessage {
        let pin = VnodePin::acquire(registry, VnodeId(vnode)).unwrap();
        WriteMessage::new(
            pin,
            RequestHandle(seq),
            MsgType::SUBMIT,
            Bytes::from(seq.to_be_bytes().to_vec()),
            None,
        )
    }

    fn batch(drain: Drain) -> Vec<(VnodeId, u64)> {
        match drain {
            Drain::Batch(items) => items.iter().map(|m| (m.vnode_id(), m.request().0)).collect(),
            other => panic!("expected a batch, got {other:?}"),
        }
    }

    #[test]
    fn drains_all_members_in_fifo_order() {
        let reg = registry(&[1, 2]);
        let group = QueueGroup::new(0);
        let q1 = group.add_queue(VnodeId(1));
        let q2 = group.add_queue(VnodeId(2));

        q1.push(msg(&reg, 1, 10)).unwrap();
        q2.push(msg(&reg, 2, 20)).unwrap();
        q1.push(msg(&reg, 1, 11)).unwrap();
        assert_eq!(group.pending(), 3);

        let items = batch(group.drain(0, DRAIN_WAIT));
        assert_eq!(
            items,
            vec![(VnodeId(1), 10), (VnodeId(1), 11), (VnodeId(2), 20)]
        );
        assert_eq!(group.pending(), 0);
    }

    #[test]
    fn bounded_drain_takes_prefixes_and_rotates() {
        let reg = registry(&[1, 2]);
        let group = QueueGroup::new(0);
        let q1 = group.add_queue(VnodeId(1));
        let q2 = group.add_queue(VnodeId(2));
        for seq in 0..3 {
            q1.push(msg(&reg, 1, seq)).unwrap();
            q2.push(msg(&reg, 2, 100 + seq)).unwrap();
        }

        assert_eq!(batch(group.drain(2, DRAIN_WAIT)), vec![(VnodeId(1), 0), (VnodeId(1), 1)]);
        assert_eq!(batch(group.drain(2, DRAIN_WAIT)), vec![(VnodeId(2), 100), (VnodeId(2), 101)]);
        assert_eq!(batch(group.drain(0, DRAIN_WAIT)), vec![(VnodeId(1), 2), (VnodeId(2), 102)]);
    }

    #[test]
    fn empty_group_reports_orphaned_and_idle() {
        let group = QueueGroup::new(3);
        assert!(matches!(group.drain(0, Duration::from_millis(1)), Drain::Orphaned));

        let queue = group.add_queue(VnodeId(1));
        assert!(matches!(group.drain(0, Duration::from_millis(1)), Drain::Idle));

        assert!(queue.close());
        assert!(matches!(group.drain(0, Duration::from_millis(1)), Drain::Orphaned));
    }

    #[test]
    fn released_queue_keeps_undrained_items() {
        let reg = registry(&[4]);
        let group = QueueGroup::new(0);
        let queue = group.add_queue(VnodeId(4));
        queue.push(msg(&reg, 4, 1)).unwrap();
        queue.push(msg(&reg, 4, 2)).unwrap();

        let late = group.add_queue(VnodeId(4));
        assert!(queue.close());
        assert_eq!(group.member_count(), 1);
        assert_eq!(batch(group.drain(0, DRAIN_WAIT)), vec![(VnodeId(4), 1), (VnodeId(4), 2)]);
        drop(late);
    }

    #[test]
    fn push_after_close_or_stop_is_refused() {
        let reg = registry(&[1, 2]);
        let group = QueueGroup::new(0);
        let closed = group.add_queue(VnodeId(1));
        let open = group.add_queue(VnodeId(2));
        let id = closed.id;
        assert!(closed.close());
        assert!(group.push(id, msg(&reg, 1, 1)).is_err());

        group.stop();
        assert!(open.push(msg(&reg, 2, 2)).is_err());
        assert!(matches!(group.drain(0, DRAIN_WAIT), Drain::Stopped));
    }

    #[test]
    fn stopped_group_hands_out_pending_first() {
        let reg = registry(&[1]);
        let group = QueueGroup::new(0);
        let queue = group.add_queue(VnodeId(1));
        queue.push(msg(&reg, 1, 1)).unwrap();
        group.stop();
        assert_eq!(batch(group.drain(0, DRAIN_WAIT)).len(), 1);
        assert!(matches!(group.drain(0, DRAIN_WAIT), Drain::Stopped));
    }

    #[test]
    fn retire_only_when_empty() {
        let group = QueueGroup::new(0);
        let queue = group.add_queue(VnodeId(1));
        assert!(!group.retire_if_empty());
        queue.close();
        assert!(group.retire_if_empty());
    }

    #[test]
    fn push_wakes_a_blocked_drain() {
        let reg = registry(&[1]);
        let group = QueueGroup::new(0);
        let queue = group.add_queue(VnodeId(1));

        let waiter = {
            let group = Arc::clone(&group);
            thread::spawn(move || group.drain(0, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(msg(&reg, 1, 42)).unwrap();

        let items = batch(waiter.join().unwrap());
        assert_eq!(items, vec![(VnodeId(1), 42)]);
    }
}
