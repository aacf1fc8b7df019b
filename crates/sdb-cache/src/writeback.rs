//! Writeback: dirty tracking, the flush lock, and the flush protocol.
//!
//! Dirty blocks are tracked in mark order with byte accounting. A flush
//! round is triggered by the repeating timer, by the dirty count
//! reaching the configured threshold, by an explicit sync, or by
//! shutdown. At most one round is in flight at a time.
//!
//! Write transactions hold the flush lock in `Read` for their lifetime;
//! a round takes it in `Write` for the snapshot instant only, so the
//! snapshot never observes a half-committed transaction and new write
//! transactions queue FIFO behind a pending round. During the round's
//! device I/O the lock is already released and transactions proceed;
//! pages they touch diverge copy-on-write while the snapshot keeps the
//! pre-write image.

use crate::{Cache, CoreState, Phase};
use sdb_error::CacheError;
use sdb_runloop::TimerToken;
use sdb_serializer::{PageBuf, Serializer};
use sdb_types::{Access, BlockId};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use tracing::{debug, error, info, trace, warn};

/// Continuation for a completed or failed flush round.
pub(crate) type SyncWaiter = Box<dyn FnOnce(sdb_error::Result<()>)>;

/// Continuation queued on the flush lock (transaction begin or a
/// pending snapshot).
pub(crate) type FlushLockWaiter = Box<dyn FnOnce()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DirtyEntry {
    seq: u64,
    bytes: usize,
}

/// Ordered tracking of dirty blocks with deterministic age semantics.
#[derive(Debug, Default)]
pub(crate) struct DirtyOrder {
    next_seq: u64,
    by_block: HashMap<BlockId, DirtyEntry>,
    by_age: BTreeSet<(u64, BlockId)>,
    dirty_bytes: usize,
}

impl DirtyOrder {
    /// Mark a block dirty, refreshing its position in mark order.
    pub(crate) fn mark(&mut self, block: BlockId, bytes: usize) {
        if let Some(prev) = self.by_block.remove(&block) {
            let _ = self.by_age.remove(&(prev.seq, block));
            self.dirty_bytes = self.dirty_bytes.saturating_sub(prev.bytes);
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.by_block.insert(block, DirtyEntry { seq, bytes });
        self.by_age.insert((seq, block));
        self.dirty_bytes = self.dirty_bytes.saturating_add(bytes);
    }

    pub(crate) fn clear(&mut self, block: BlockId) {
        if let Some(entry) = self.by_block.remove(&block) {
            let _ = self.by_age.remove(&(entry.seq, block));
            self.dirty_bytes = self.dirty_bytes.saturating_sub(entry.bytes);
        }
    }

    pub(crate) fn is_dirty(&self, block: BlockId) -> bool {
        self.by_block.contains_key(&block)
    }

    pub(crate) fn count(&self) -> usize {
        self.by_block.len()
    }

    pub(crate) fn bytes(&self) -> usize {
        self.dirty_bytes
    }

    /// Age of the oldest dirty block in mark-order ticks (logical, not
    /// wall time).
    pub(crate) fn oldest_age_ticks(&self) -> Option<u64> {
        self.by_age
            .iter()
            .next()
            .map(|(oldest_seq, _)| self.next_seq.saturating_sub(*oldest_seq))
    }

    pub(crate) fn oldest_first(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.by_age.iter().map(|(_, block)| *block)
    }

    /// Drain the whole dirty set in oldest-first order.
    pub(crate) fn take_oldest_first(&mut self) -> Vec<BlockId> {
        let order: Vec<BlockId> = self.oldest_first().collect();
        self.by_block.clear();
        self.by_age.clear();
        self.dirty_bytes = 0;
        order
    }
}

/// Per-cache writeback state.
pub(crate) struct WritebackState {
    pub(crate) wait_for_flush: bool,
    pub(crate) flush_threshold_blocks: usize,
    /// Write transactions hold `Read`; a flush round takes `Write` for
    /// the snapshot instant.
    pub(crate) flush_lock: crate::rwi_lock::RwiLock<FlushLockWaiter>,
    pub(crate) dirty: DirtyOrder,
    /// Continuations for the next snapshot; a snapshot takes the whole
    /// vector, so waiters arriving during a round roll over.
    pub(crate) sync_waiters: Vec<SyncWaiter>,
    pub(crate) active_flush: bool,
    /// A snapshot continuation is queued or scheduled but has not run.
    pub(crate) flush_requested: bool,
    /// A trigger fired while a round was active; re-check on completion.
    pub(crate) rerun_after_flush: bool,
    pub(crate) timer: Option<TimerToken>,
    pub(crate) flushes_completed: u64,
}

impl WritebackState {
    pub(crate) fn new(wait_for_flush: bool, flush_threshold_blocks: usize) -> Self {
        Self {
            wait_for_flush,
            flush_threshold_blocks,
            flush_lock: crate::rwi_lock::RwiLock::new(),
            dirty: DirtyOrder::default(),
            sync_waiters: Vec::new(),
            active_flush: false,
            flush_requested: false,
            rerun_after_flush: false,
            timer: None,
            flushes_completed: 0,
        }
    }
}

impl<S: Serializer + 'static> Cache<S> {
    /// Mark a block dirty, enrolling it in the writeback set. Triggers a
    /// flush when the dirty count crosses the threshold.
    pub(crate) fn mark_dirty(self: &Rc<Self>, block: BlockId) {
        let mut st = self.state.borrow_mut();
        let buf = st.map.get(block).expect("set_dirty on a non-resident block");
        assert!(buf.data.is_some(), "set_dirty on an uncached block");

        let bytes = self.block_size.as_usize();
        st.wb.dirty.mark(block, bytes);
        trace!(
            event = "dirty_mark",
            block = block.0,
            dirty_blocks = st.wb.dirty.count(),
            dirty_bytes = st.wb.dirty.bytes()
        );

        if st.wb.dirty.count() >= st.wb.flush_threshold_blocks {
            self.request_flush(&mut st);
        }
    }

    /// Register `waiter` for the next flush round and make sure one is
    /// coming.
    pub(crate) fn sync(self: &Rc<Self>, waiter: SyncWaiter) {
        let mut st = self.state.borrow_mut();
        st.wb.sync_waiters.push(waiter);
        self.request_flush(&mut st);
    }

    /// Ask for a flush round. Deduplicates: at most one snapshot is
    /// pending, and a round already in flight defers the request to its
    /// completion.
    pub(crate) fn request_flush(self: &Rc<Self>, st: &mut CoreState<S>) {
        if st.wb.active_flush {
            st.wb.rerun_after_flush = true;
            return;
        }
        if st.wb.flush_requested {
            return;
        }
        st.wb.flush_requested = true;
        debug!(
            event = "flush_requested",
            dirty_blocks = st.wb.dirty.count(),
            sync_waiters = st.wb.sync_waiters.len()
        );

        let cache = Rc::clone(self);
        let snapshot: FlushLockWaiter = Box::new(move || cache.flush_snapshot());
        if st.wb.flush_lock.try_lock(Access::Write) {
            self.handle.post(snapshot);
        } else {
            // Open write transactions hold the lock; the snapshot runs
            // when the last of them commits.
            st.wb.flush_lock.add_waiter(Access::Write, snapshot);
        }
    }

    /// Snapshot the dirty set and submit one batched write.
    ///
    /// Runs with the flush lock held in `Write`; the lock is released
    /// as soon as the snapshot is taken so transactions overlap the
    /// device I/O.
    pub(crate) fn flush_snapshot(self: &Rc<Self>) {
        let (batch, waiters, granted) = {
            let mut st = self.state.borrow_mut();
            debug_assert!(st.wb.flush_requested);
            debug_assert!(!st.wb.active_flush);
            st.wb.flush_requested = false;
            st.wb.active_flush = true;

            let waiters = std::mem::take(&mut st.wb.sync_waiters);
            let order = st.wb.dirty.take_oldest_first();
            let mut batch: Vec<(BlockId, PageBuf)> = Vec::with_capacity(order.len());
            for block in order {
                let buf = st.map.get_mut(block).expect("dirty block is resident");
                let page = buf
                    .data
                    .as_ref()
                    .expect("dirty block is cached")
                    .clone_ref();
                buf.in_flight = crate::InFlight::Write;
                batch.push((block, page));
            }

            let granted = st.wb.flush_lock.unlock(Access::Write);
            debug!(
                event = "flush_snapshot",
                blocks = batch.len(),
                sync_waiters = waiters.len(),
                unblocked_txns = granted.len()
            );
            (batch, waiters, granted)
        };

        for cont in granted {
            self.handle.post(cont);
        }

        if batch.is_empty() {
            self.finish_flush_round(Vec::new(), waiters, Ok(()));
            return;
        }

        let blocks: Vec<BlockId> = batch.iter().map(|(block, _)| *block).collect();
        let cache = Rc::clone(self);
        self.serializer.borrow_mut().write_many(
            batch,
            Box::new(move |result| cache.finish_flush_round(blocks, waiters, result)),
        );
    }

    /// Completion of a flush round: clear in-flight markers, refresh
    /// eviction eligibility, notify the round's waiters in order, and
    /// re-trigger if work arrived meanwhile.
    pub(crate) fn finish_flush_round(
        self: &Rc<Self>,
        blocks: Vec<BlockId>,
        waiters: Vec<SyncWaiter>,
        result: sdb_error::Result<()>,
    ) {
        match result {
            Ok(()) => {
                {
                    let mut st = self.state.borrow_mut();
                    for block in &blocks {
                        let buf = st.map.get_mut(*block).expect("flushed block is resident");
                        debug_assert_eq!(buf.in_flight, crate::InFlight::Write);
                        buf.in_flight = crate::InFlight::None;
                    }
                    st.wb.active_flush = false;
                    if !blocks.is_empty() {
                        st.wb.flushes_completed += 1;
                    }
                    st.evict_overflow(self.max_blocks);
                    info!(
                        event = "flush_batch_complete",
                        flushed_blocks = blocks.len(),
                        remaining_dirty_blocks = st.wb.dirty.count(),
                        remaining_dirty_bytes = st.wb.dirty.bytes()
                    );
                }
                for waiter in waiters {
                    self.handle.post(move || waiter(Ok(())));
                }
            }
            Err(err) => {
                let detail = err.to_string();
                {
                    let mut st = self.state.borrow_mut();
                    let bytes = self.block_size.as_usize();
                    for block in &blocks {
                        let buf = st.map.get_mut(*block).expect("flushed block is resident");
                        buf.in_flight = crate::InFlight::None;
                        // Put the payload back in the dirty set so a
                        // later round (or the shutdown flush) retries.
                        st.wb.dirty.mark(*block, bytes);
                    }
                    st.wb.active_flush = false;
                    error!(
                        event = "flush_batch_failed",
                        attempted_blocks = blocks.len(),
                        error = %detail
                    );
                }
                for waiter in waiters {
                    let detail = detail.clone();
                    self.handle
                        .post(move || waiter(Err(CacheError::io_detail(&detail))));
                }
            }
        }
        self.maybe_rerun_flush();
    }

    fn maybe_rerun_flush(self: &Rc<Self>) {
        let mut st = self.state.borrow_mut();
        if st.phase == Phase::Stopped {
            return;
        }
        let rerun = std::mem::take(&mut st.wb.rerun_after_flush);
        let dirty = st.wb.dirty.count();
        let threshold_hit = dirty > 0 && dirty >= st.wb.flush_threshold_blocks;
        if !st.wb.sync_waiters.is_empty() || threshold_hit || (rerun && dirty > 0) {
            self.request_flush(&mut st);
        }
    }

    /// Timer tick: flush only when there is something to write.
    pub(crate) fn on_flush_timer(self: &Rc<Self>) {
        let mut st = self.state.borrow_mut();
        if st.phase != Phase::Running {
            return;
        }
        if st.wb.dirty.count() == 0 {
            trace!(event = "flush_timer_idle");
            return;
        }
        trace!(
            event = "flush_timer_tick",
            dirty_blocks = st.wb.dirty.count(),
            oldest_dirty_age_ticks = st.wb.dirty.oldest_age_ticks().unwrap_or(0)
        );
        self.request_flush(&mut st);
    }

    /// Discard dirty state after a failed shutdown flush. The image
    /// loses the unflushed writes; resident bookkeeping stays coherent
    /// so the blocks can still be unloaded.
    pub(crate) fn discard_dirty_for_shutdown(&self) {
        let mut st = self.state.borrow_mut();
        let discarded = st.wb.dirty.take_oldest_first();
        for block in &discarded {
            warn!(
                event = "dirty_block_discarded",
                block = block.0,
                reason = "shutdown_flush_failed"
            );
        }
        if !discarded.is_empty() {
            warn!(
                event = "shutdown_discarded_dirty",
                blocks = discarded.len()
            );
        }
    }
}
