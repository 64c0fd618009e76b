//! Write worker main loop
//!
//! Each iteration drains everything pending in the worker's group, appends
//! every item to its vnode's log, flushes each touched vnode once, and only
//! then hands items to their handlers and to the response merger.

use crate::core::error::{codes, WriteError, WriteStatus};
use crate::core::types::VnodeId;
use crate::dispatch::fanout::ResponseMerger;
use crate::dispatch::WriteMessage;
use crate::handlers::HandlerRegistry;
use crate::storage::WriteAheadLog;
use crate::system::metrics::Metrics;
use crate::worker::pool::PoolShared;
use crate::worker::queue::{Drain, QueueGroup, DRAIN_WAIT};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

pub(crate) struct WorkerContext {
    pub(crate) slot: usize,
    pub(crate) group: Arc<QueueGroup>,
    pub(crate) shared: Arc<PoolShared>,
}

pub(crate) fn run(ctx: WorkerContext) {
    let metrics = &Metrics::global().workers;
    metrics.live_workers.inc();

    loop {
        match ctx.group.drain(ctx.shared.max_batch_items, DRAIN_WAIT) {
            Drain::Batch(batch) => {
                process_batch(
                    ctx.shared.wal.as_ref(),
                    &ctx.shared.handlers,
                    &ctx.shared.merger,
                    batch,
                );
            }
            Drain::Idle => {
                thread::sleep(ctx.shared.idle_backoff);
                thread::yield_now();
            }
            Drain::Orphaned => {
                if ctx.shared.try_retire(ctx.slot, &ctx.group) {
                    break;
                }
            }
            Drain::Stopped => break,
        }
    }

    metrics.live_workers.dec();
    info!(worker = ctx.slot, "write worker stopped");
}

/// Log, apply and answer one drained batch.
///
/// Every item is completed exactly once whatever happens to it, and every
/// append and flush of the batch happens before the first handler runs.
pub(crate) fn process_batch(
    wal: &dyn WriteAheadLog,
    handlers: &HandlerRegistry,
    merger: &ResponseMerger,
    batch: Vec<WriteMessage>,
) {
    let metrics = &Metrics::global().workers;
    metrics.batches_drained.inc();
    metrics.batch_size.observe(batch.len() as f64);

    let mut statuses: Vec<WriteStatus> = batch
        .iter()
        .map(|msg| {
            wal.append(msg.vnode(), msg.msg_type(), msg.payload())
                .map_err(|e| WriteError::durability(msg.vnode_id(), e))
        })
        .collect();

    let mut flushed: Vec<VnodeId> = Vec::new();
    for msg in &batch {
        let vnode = msg.vnode_id();
        if flushed.contains(&vnode) {
            continue;
        }
        flushed.push(vnode);
        if let Err(e) = wal.flush(msg.vnode()) {
            warn!(vnode = %vnode, error = %e, "WAL flush failed");
            let failure = WriteError::durability(vnode, e);
            for (item, status) in batch.iter().zip(statuses.iter_mut()) {
                if item.vnode_id() == vnode && status.is_ok() {
                    *status = Err(failure.clone());
                }
            }
        }
    }

    for (msg, status) in batch.into_iter().zip(statuses) {
        // Nothing that failed to reach the log is applied.
        let status = match status {
            Ok(()) => apply_guarded(handlers, &msg),
            Err(e) => {
                warn!(vnode = %msg.vnode_id(), request = %msg.request(), error = %e, "durability write failed");
                metrics.wal_failures.inc();
                Err(e)
            }
        };
        match &status {
            Err(WriteError::Unsupported(msg_type)) => {
                debug!(vnode = %msg.vnode_id(), msg_type = %msg_type, "no handler for message type");
                metrics.unsupported_messages.inc();
            }
            Err(WriteError::Handler { code }) => {
                debug!(vnode = %msg.vnode_id(), code, "handler rejected write");
                metrics.handler_failures.inc();
            }
            _ => {}
        }
        metrics.items_processed.inc();
        merger.complete(msg, status);
    }
}

/// Run the message's handler; a panic fails the item instead of the worker.
fn apply_guarded(handlers: &HandlerRegistry, msg: &WriteMessage) -> WriteStatus {
    panic::catch_unwind(AssertUnwindSafe(|| handlers.apply(msg.vnode(), msg))).unwrap_or_else(|_| {
        error!(vnode = %msg.vnode_id(), request = %msg.request(), "write handler panicked");
        Err(WriteError::Handler {
            code: codes::HANDLER_PANICKED,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{MsgType, RequestHandle};
    use crate::dispatch::fanout::FanoutContext;
    use crate::rpc::{ChannelResponder, WriteResponse};
    use crate::storage::{MemoryWal, WalEvent};
    use crate::vnode::{VnodeHandle, VnodePin, VnodeRegistry, VnodeTable};
    use bytes::Bytes;
    use crossbeam::channel::Receiver;
    use parking_lot::Mutex;

    struct Fixture {
        table: Arc<VnodeTable>,
        registry: Arc<dyn VnodeRegistry>,
        wal: Arc<MemoryWal>,
        merger: ResponseMerger,
        responses: Receiver<WriteResponse>,
    }

    fn fixture(vnodes: &[u32]) -> Fixture {
        let table = Arc::new(VnodeTable::new());
        for id in vnodes {
            table.open(VnodeId(*id));
        }
        let (responder, responses) = ChannelResponder::new();
        Fixture {
            registry: table.clone(),
            table,
            wal: Arc::new(MemoryWal::new()),
            merger: ResponseMerger::new(Arc::new(responder)),
            responses,
        }
    }

    impl Fixture {
        fn msg(
            &self,
            vnode: u32,
            request: u64,
            msg_type: MsgType,
            payload: &'static [u8],
            fanout: Option<&Arc<FanoutContext>>,
        ) -> WriteMessage {
            WriteMessage::new(
                VnodePin::acquire(&self.registry, VnodeId(vnode)).unwrap(),
                RequestHandle(request),
                msg_type,
                Bytes::from_static(payload),
                fanout.cloned(),
            )
        }
    }

    #[test]
    fn every_append_precedes_every_apply() {
        let fx = fixture(&[1, 2]);
        let wal = Arc::clone(&fx.wal);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observed = Arc::clone(&seen);
        let handlers = HandlerRegistry::builder()
            .register_fn(MsgType::SUBMIT, move |_: &VnodeHandle, msg: &WriteMessage| {
                // Both items of the batch must already be logged and flushed.
                let events = wal.events();
                let appends = events.iter().filter(|e| matches!(e, WalEvent::Append { .. })).count();
                let flushes = events.iter().filter(|e| matches!(e, WalEvent::Flush { .. })).count();
                observed.lock().push((msg.vnode_id(), appends, flushes));
                Ok(())
            })
            .build();

        let batch = vec![
            fx.msg(1, 1, MsgType::SUBMIT, b"a", None),
            fx.msg(2, 2, MsgType::SUBMIT, b"b", None),
        ];
        process_batch(fx.wal.as_ref(), &handlers, &fx.merger, batch);

        assert_eq!(
            *seen.lock(),
            vec![(VnodeId(1), 2, 2), (VnodeId(2), 2, 2)]
        );
        assert_eq!(fx.responses.try_iter().count(), 2);
    }

    #[test]
    fn one_flush_per_vnode_per_batch() {
        let fx = fixture(&[1, 2]);
        let handlers = HandlerRegistry::builder()
            .register_fn(MsgType::SUBMIT, |_: &VnodeHandle, _: &WriteMessage| Ok(()))
            .build();
        let batch = vec![
            fx.msg(1, 1, MsgType::SUBMIT, b"a1", None),
            fx.msg(2, 2, MsgType::SUBMIT, b"b1", None),
            fx.msg(1, 3, MsgType::SUBMIT, b"a2", None),
        ];
        process_batch(fx.wal.as_ref(), &handlers, &fx.merger, batch);

        let flushes: Vec<_> = fx
            .wal
            .events()
            .into_iter()
            .filter_map(|e| match e {
                WalEvent::Flush { vnode } => Some(vnode),
                _ => None,
            })
            .collect();
        assert_eq!(flushes, vec![VnodeId(1), VnodeId(2)]);
        assert_eq!(
            fx.wal.payloads(VnodeId(1)),
            vec![Bytes::from_static(b"a1"), Bytes::from_static(b"a2")]
        );
    }

    #[test]
    fn durability_failure_skips_apply_and_is_reported() {
        let fx = fixture(&[1, 2]);
        fx.wal.fail_flushes(VnodeId(1));
        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&applied);
        let handlers = HandlerRegistry::builder()
            .register_fn(MsgType::SUBMIT, move |_: &VnodeHandle, msg: &WriteMessage| {
                sink.lock().push(msg.vnode_id());
                Ok(())
            })
            .build();

        let batch = vec![
            fx.msg(1, 1, MsgType::SUBMIT, b"a", None),
            fx.msg(2, 2, MsgType::SUBMIT, b"b", None),
        ];
        process_batch(fx.wal.as_ref(), &handlers, &fx.merger, batch);

        assert_eq!(*applied.lock(), vec![VnodeId(2)]);
        let responses: Vec<_> = fx.responses.try_iter().collect();
        assert!(matches!(
            responses[0].status,
            Err(WriteError::Durability { vnode: VnodeId(1), .. })
        ));
        assert_eq!(responses[1].status, Ok(()));
    }

    #[test]
    fn unsupported_type_fails_only_its_item() {
        let fx = fixture(&[1]);
        let handlers = HandlerRegistry::builder()
            .register_fn(MsgType::SUBMIT, |_: &VnodeHandle, _: &WriteMessage| Ok(()))
            .build();
        let batch = vec![
            fx.msg(1, 1, MsgType(77), b"?", None),
            fx.msg(1, 2, MsgType::SUBMIT, b"ok", None),
        ];
        process_batch(fx.wal.as_ref(), &handlers, &fx.merger, batch);

        let responses: Vec<_> = fx.responses.try_iter().collect();
        assert_eq!(responses[0].status, Err(WriteError::Unsupported(MsgType(77))));
        assert_eq!(responses[1].status, Ok(()));
    }

    #[test]
    fn panicking_handler_fails_only_its_item() {
        let fx = fixture(&[1]);
        let handlers = HandlerRegistry::builder()
            .register_fn(MsgType::SUBMIT, |_: &VnodeHandle, msg: &WriteMessage| {
                if msg.payload().as_ref() == b"boom" {
                    panic!("handler bug");
                }
                Ok(())
            })
            .build();
        let batch = vec![
            fx.msg(1, 1, MsgType::SUBMIT, b"boom", None),
            fx.msg(1, 2, MsgType::SUBMIT, b"fine", None),
        ];
        process_batch(fx.wal.as_ref(), &handlers, &fx.merger, batch);

        let responses: Vec<_> = fx.responses.try_iter().collect();
        assert_eq!(responses[0].code(), codes::HANDLER_PANICKED);
        assert_eq!(responses[1].status, Ok(()));
        assert_eq!(fx.table.pin_count(VnodeId(1)), 0);
    }

    #[test]
    fn pins_are_released_on_every_path() {
        let fx = fixture(&[1]);
        fx.wal.fail_appends(VnodeId(1));
        let handlers = HandlerRegistry::builder().build();
        let ctx = FanoutContext::new(2);
        let batch = vec![
            fx.msg(1, 9, MsgType::SUBMIT, b"x", Some(&ctx)),
            fx.msg(1, 9, MsgType(200), b"y", Some(&ctx)),
        ];
        assert_eq!(fx.table.pin_count(VnodeId(1)), 2);
        process_batch(fx.wal.as_ref(), &handlers, &fx.merger, batch);

        assert_eq!(fx.table.pin_count(VnodeId(1)), 0);
        let response = fx.responses.try_recv().unwrap();
        assert_eq!(response.handle, RequestHandle(9));
        assert!(response.status.is_err());
        assert!(fx.responses.try_recv().is_err());
        assert_eq!(Arc::strong_count(&ctx), 1);
    }
}
