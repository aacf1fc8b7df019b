#![forbid(unsafe_code)]
//! Mirrored buffer cache for a single SliceDB slice.
//!
//! The cache itself performs no I/O policy of its own; it composes the
//! four per-block concerns — page map, page replacement, writeback, and
//! the per-block reader-writer-intent lock — into one coherent object
//! sitting between transactions and the serializer. Each concern is a
//! plain field on the cache (or the block record), so swapping a policy
//! is swapping a field type, not re-threading an inheritance chain.
//!
//! A cache is pinned to one event loop for its lifetime. All mutable
//! state lives behind a single `RefCell`; public methods take `&self`,
//! and user continuations are never invoked while that cell is
//! borrowed. Synchronous fast paths (a cache hit with an uncontended
//! lock, `allocate`) complete inline; every contended or missing path
//! defers its continuation through the loop:
//!
//! - acquire on a cache miss waits for the serializer read,
//! - acquire under an incompatible lock waits for a FIFO grant,
//! - commit of a write transaction waits for writeback sync,
//! - begin of a write transaction waits for the writeback intent lock.
//!
//! Blocks are evicted only when provably idle: unlocked, no waiters of
//! either kind, clean, and with no in-flight I/O. Violations of those
//! rules are programming errors and halt with a diagnostic dump rather
//! than propagate.

mod page_repl;
pub mod rwi_lock;
mod writeback;

use page_repl::LruOrder;
use rwi_lock::RwiLock;
use sdb_error::{CacheError, Result};
use sdb_runloop::LoopHandle;
use sdb_serializer::{PageBuf, Serializer};
use sdb_types::{Access, BlockId, BlockSize, TxnId};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::rc::Rc;
use std::time::Duration;
use tracing::{error, info, trace};
use writeback::WritebackState;

// ── Configuration ───────────────────────────────────────────────────────────

/// Cache construction parameters.
///
/// `max_blocks` and the flush threshold are derived at construction:
/// `max_blocks = max_size_bytes / block_size`, and the threshold is
/// `max_blocks * flush_threshold_percent / 100` dirty blocks.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub block_size: BlockSize,
    pub max_size_bytes: u64,
    /// When true, a write transaction's commit callback fires only
    /// after the flush round containing its writes is durable;
    /// otherwise it fires once the dirty bits are set.
    pub wait_for_flush: bool,
    /// Periodic writeback interval.
    pub flush_timer: Duration,
    /// Dirty fraction of cache capacity that also triggers writeback.
    pub flush_threshold_percent: u32,
}

impl CacheConfig {
    fn validate(&self) -> Result<(usize, usize)> {
        if self.flush_timer.is_zero() {
            return Err(CacheError::Config("flush timer must be > 0".to_owned()));
        }
        if self.flush_threshold_percent > 100 {
            return Err(CacheError::Config(
                "flush threshold percent must be <= 100".to_owned(),
            ));
        }
        let max_blocks = self.max_size_bytes / u64::from(self.block_size.get());
        if max_blocks == 0 {
            return Err(CacheError::Config(
                "max_size_bytes must hold at least one block".to_owned(),
            ));
        }
        let max_blocks = sdb_types::u64_to_usize(max_blocks, "max_blocks")
            .map_err(|err| CacheError::Config(err.to_string()))?;
        let threshold = max_blocks * self.flush_threshold_percent as usize / 100;
        Ok((max_blocks, threshold))
    }
}

/// Frozen point-in-time snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetrics {
    /// Acquisitions satisfied from a resident block.
    pub hits: u64,
    /// Acquisitions that required a serializer read.
    pub misses: u64,
    /// Resident blocks evicted by page replacement.
    pub evictions: u64,
    /// Completed non-empty flush rounds.
    pub flushes: u64,
    /// Current number of resident blocks.
    pub resident: usize,
    /// Current number of dirty blocks.
    pub dirty_blocks: usize,
    /// Total bytes represented by dirty blocks.
    pub dirty_bytes: usize,
    /// Age of the oldest dirty block in mark-order ticks.
    pub oldest_dirty_age_ticks: Option<u64>,
    /// Maximum resident capacity in blocks.
    pub capacity: usize,
}

// ── Block record ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InFlight {
    None,
    Read,
    Write,
}

pub(crate) enum WaiterCont<S: Serializer + 'static> {
    /// An acquire waiting for data or a lock grant.
    Block(BlockCallback<S>),
    /// An upgrade waiting for readers to drain.
    Plain(Box<dyn FnOnce()>),
}

/// A deferred acquirer: the owning transaction, the requested mode, and
/// the continuation to run exactly once.
pub(crate) struct Waiter<S: Serializer + 'static> {
    txn: Transaction<S>,
    mode: Access,
    cont: WaiterCont<S>,
}

/// One resident (or loading) block.
///
/// The lock's waiter queue and `load_waiters` split the deferred
/// acquirers: a waiter that was granted the lock on a still-loading
/// block parks on `load_waiters`; one that could not take the lock
/// parks inside the lock itself, payload included.
pub(crate) struct Buf<S: Serializer + 'static> {
    pub(crate) id: BlockId,
    /// `Some` iff the block is cached.
    pub(crate) data: Option<PageBuf>,
    pub(crate) load_waiters: VecDeque<Waiter<S>>,
    pub(crate) lock: RwiLock<Waiter<S>>,
    pub(crate) in_flight: InFlight,
    /// Outstanding deferred continuations pointing at this block.
    pub(crate) active_callbacks: u32,
}

impl<S: Serializer + 'static> Buf<S> {
    fn new(id: BlockId) -> Self {
        Self {
            id,
            data: None,
            load_waiters: VecDeque::new(),
            lock: RwiLock::new(),
            in_flight: InFlight::None,
            active_callbacks: 0,
        }
    }
}

// ── Page map ────────────────────────────────────────────────────────────────

/// Mapping from block id to block record. Owns every resident block.
pub(crate) struct PageMap<S: Serializer + 'static> {
    blocks: HashMap<BlockId, Buf<S>>,
}

impl<S: Serializer + 'static> PageMap<S> {
    fn new() -> Self {
        Self {
            blocks: HashMap::new(),
        }
    }

    pub(crate) fn get(&self, block: BlockId) -> Option<&Buf<S>> {
        self.blocks.get(&block)
    }

    pub(crate) fn get_mut(&mut self, block: BlockId) -> Option<&mut Buf<S>> {
        self.blocks.get_mut(&block)
    }

    pub(crate) fn insert(&mut self, buf: Buf<S>) {
        let prev = self.blocks.insert(buf.id, buf);
        debug_assert!(prev.is_none(), "duplicate block in page map");
    }

    pub(crate) fn remove(&mut self, block: BlockId) -> Option<Buf<S>> {
        self.blocks.remove(&block)
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub(crate) fn ids_sorted(&self) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self.blocks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

// ── Core state ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Default)]
pub(crate) struct LifecycleCounters {
    pub(crate) n_trans_created: u64,
    pub(crate) n_trans_freed: u64,
    pub(crate) n_blocks_acquired: u64,
    pub(crate) n_blocks_released: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub(crate) hits: u64,
    pub(crate) misses: u64,
    pub(crate) evictions: u64,
}

pub(crate) struct CoreState<S: Serializer + 'static> {
    pub(crate) map: PageMap<S>,
    pub(crate) repl: LruOrder,
    pub(crate) wb: WritebackState,
    pub(crate) phase: Phase,
    pub(crate) next_txn: u64,
    pub(crate) counters: LifecycleCounters,
    pub(crate) stats: StatCounters,
}

impl<S: Serializer + 'static> CoreState<S> {
    /// A block may leave memory iff nothing can observe it going: no
    /// lock holders or waiters, no load waiters, no in-flight I/O, not
    /// dirty, and actually cached (a loading block always has waiters).
    pub(crate) fn safe_to_unload(&self, block: BlockId) -> bool {
        let Some(buf) = self.map.get(block) else {
            return false;
        };
        buf.data.is_some()
            && buf.lock.is_idle()
            && buf.load_waiters.is_empty()
            && buf.in_flight == InFlight::None
            && buf.active_callbacks == 0
            && !self.wb.dirty.is_dirty(block)
    }

    /// Per-block lock state and waiter identities, for diagnosing a
    /// stuck slice from a watchdog or signal handler.
    pub(crate) fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "cache: phase={:?} resident={} dirty={} sync_waiters={}",
            self.phase,
            self.map.len(),
            self.wb.dirty.count(),
            self.wb.sync_waiters.len(),
        );
        let _ = writeln!(
            out,
            "flush lock: {} queued={}",
            self.wb.flush_lock.holder_summary(),
            self.wb.flush_lock.waiter_count(),
        );
        let dirty: Vec<u64> = self.wb.dirty.oldest_first().map(|b| b.0).collect();
        let _ = writeln!(out, "dirty (oldest first): {dirty:?}");
        for block in self.map.ids_sorted() {
            let buf = self.map.get(block).expect("listed block");
            let _ = writeln!(
                out,
                "block {}: cached={} dirty={} in_flight={:?} lock[{}]",
                block,
                buf.data.is_some(),
                self.wb.dirty.is_dirty(block),
                buf.in_flight,
                buf.lock.holder_summary(),
            );
            for (mode, waiter) in buf.lock.waiters() {
                let _ = writeln!(out, "\tlock waiter: txn={} mode={}", waiter.txn.id(), mode);
            }
            if let Some(waiter) = buf.lock.upgrade_waiter() {
                let _ = writeln!(out, "\tupgrade waiter: txn={}", waiter.txn.id());
            }
            for waiter in &buf.load_waiters {
                let _ = writeln!(
                    out,
                    "\tload waiter: txn={} mode={}",
                    waiter.txn.id(),
                    waiter.mode
                );
            }
        }
        out
    }
}

// ── Cache ───────────────────────────────────────────────────────────────────

/// The per-slice mirrored buffer cache.
///
/// Constructed with [`Cache::new`], armed with [`Cache::start`], driven
/// through [`Transaction`]s, and torn down with [`Cache::shutdown`].
pub struct Cache<S: Serializer + 'static> {
    pub(crate) handle: LoopHandle,
    pub(crate) block_size: BlockSize,
    pub(crate) max_blocks: usize,
    pub(crate) flush_timer: Duration,
    pub(crate) serializer: RefCell<S>,
    pub(crate) state: RefCell<CoreState<S>>,
}

impl<S: Serializer + 'static> Cache<S> {
    /// Build a cache over `serializer`, validating the configuration
    /// against the serializer's block size.
    pub fn new(handle: LoopHandle, serializer: S, config: CacheConfig) -> Result<Rc<Self>> {
        let (max_blocks, flush_threshold_blocks) = config.validate()?;
        if serializer.block_size() != config.block_size {
            return Err(CacheError::Config(format!(
                "serializer block size {} does not match configured {}",
                serializer.block_size(),
                config.block_size
            )));
        }
        info!(
            event = "cache_new",
            block_size = config.block_size.get(),
            max_blocks,
            flush_threshold_blocks,
            wait_for_flush = config.wait_for_flush,
            flush_timer_ms = config.flush_timer.as_millis()
        );
        Ok(Rc::new(Self {
            handle,
            block_size: config.block_size,
            max_blocks,
            flush_timer: config.flush_timer,
            serializer: RefCell::new(serializer),
            state: RefCell::new(CoreState {
                map: PageMap::new(),
                repl: LruOrder::default(),
                wb: WritebackState::new(config.wait_for_flush, flush_threshold_blocks),
                phase: Phase::Running,
                next_txn: 0,
                counters: LifecycleCounters::default(),
                stats: StatCounters::default(),
            }),
        }))
    }

    /// Arm the writeback timer. No blocks are resident yet.
    pub fn start(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        let token = self.handle.add_timer(self.flush_timer, move || {
            if let Some(cache) = weak.upgrade() {
                cache.on_flush_timer();
            }
        });
        let mut st = self.state.borrow_mut();
        debug_assert!(st.wb.timer.is_none(), "cache started twice");
        st.wb.timer = Some(token);
        info!(event = "cache_start", flush_timer_ms = self.flush_timer.as_millis());
    }

    /// Open a transaction. The transaction object is returned
    /// synchronously; `begin_cb` fires when it may acquire blocks —
    /// on this very turn for read access, after the writeback intent
    /// lock is granted for write access.
    pub fn begin_transaction(
        self: &Rc<Self>,
        access: Access,
        begin_cb: impl FnOnce(Transaction<S>) + 'static,
    ) -> Result<Transaction<S>> {
        assert!(
            !access.is_intent(),
            "transactions open in read or write access, not {access}"
        );
        let mut begin_cb: Option<Box<dyn FnOnce(Transaction<S>)>> = Some(Box::new(begin_cb));

        let (txn, immediate) = {
            let mut st = self.state.borrow_mut();
            if st.phase != Phase::Running {
                return Err(CacheError::ShuttingDown);
            }
            st.counters.n_trans_created += 1;
            let id = TxnId(st.next_txn);
            st.next_txn += 1;
            let txn = Transaction::new(Rc::clone(self), id, access);

            let immediate = if access.is_write_mode() {
                if st.wb.flush_lock.try_lock(Access::Read) {
                    true
                } else {
                    // A flush snapshot is pending; queue FIFO behind it.
                    let pending = txn.clone();
                    let cb = begin_cb.take().expect("begin callback consumed once");
                    st.wb.flush_lock.add_waiter(
                        Access::Read,
                        Box::new(move || {
                            pending.inner.state.set(TxnState::Open);
                            trace!(event = "txn_begin_granted", txn = pending.id().0);
                            cb(pending.clone());
                        }),
                    );
                    false
                }
            } else {
                true
            };
            (txn, immediate)
        };

        if immediate {
            txn.inner.state.set(TxnState::Open);
            trace!(event = "txn_begin", txn = txn.id().0, access = %access);
            (begin_cb.take().expect("begin callback consumed once"))(txn.clone());
        } else {
            trace!(event = "txn_begin_waiting", txn = txn.id().0);
        }
        Ok(txn)
    }

    /// Snapshot of the cache counters.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let st = self.state.borrow();
        CacheMetrics {
            hits: st.stats.hits,
            misses: st.stats.misses,
            evictions: st.stats.evictions,
            flushes: st.wb.flushes_completed,
            resident: st.map.len(),
            dirty_blocks: st.wb.dirty.count(),
            dirty_bytes: st.wb.dirty.bytes(),
            oldest_dirty_age_ticks: st.wb.dirty.oldest_age_ticks(),
            capacity: self.max_blocks,
        }
    }

    /// Render the deadlock-diagnosis dump: every block's lock state and
    /// the identity of every queued waiter.
    #[must_use]
    pub fn deadlock_dump(&self) -> String {
        self.state.borrow().dump()
    }

    /// Flush pending writes, then unload every block and stop.
    ///
    /// `cb` fires after the final write batch completes and the page
    /// map is empty. All transactions must have committed; a block
    /// still in use at shutdown is an invariant breach.
    pub fn shutdown(self: &Rc<Self>, cb: impl FnOnce() + 'static) {
        {
            let mut st = self.state.borrow_mut();
            assert_eq!(st.phase, Phase::Running, "shutdown on a non-running cache");
            st.phase = Phase::ShuttingDown;
            if let Some(token) = st.wb.timer.take() {
                self.handle.cancel_timer(token);
            }
            info!(
                event = "shutdown_start",
                resident = st.map.len(),
                dirty_blocks = st.wb.dirty.count()
            );
        }
        let cache = Rc::clone(self);
        self.sync(Box::new(move |result| {
            let failed = result.is_err();
            if let Err(err) = result {
                error!(event = "shutdown_flush_failed", error = %err);
            }
            cache.finish_shutdown(failed);
            cb();
        }));
    }

    fn finish_shutdown(self: &Rc<Self>, flush_failed: bool) {
        if flush_failed {
            self.discard_dirty_for_shutdown();
        }
        let mut st = self.state.borrow_mut();
        debug_assert_eq!(
            st.counters.n_trans_created, st.counters.n_trans_freed,
            "transactions leaked across shutdown"
        );
        debug_assert_eq!(
            st.counters.n_blocks_acquired, st.counters.n_blocks_released,
            "block acquisitions leaked across shutdown"
        );
        for block in st.map.ids_sorted() {
            st.do_unload_buf(block);
        }
        debug_assert!(st.map.is_empty());
        st.phase = Phase::Stopped;
        info!(event = "shutdown_complete");
    }

    // ── Transaction-driven paths ────────────────────────────────────

    pub(crate) fn acquire(
        self: &Rc<Self>,
        txn: &Transaction<S>,
        block: BlockId,
        mode: Access,
        cb: BlockCallback<S>,
    ) -> Result<Option<BufRef<S>>> {
        assert!(
            txn.access().permits(mode),
            "transaction access {} does not permit acquiring in {}",
            txn.access(),
            mode
        );
        assert_eq!(
            txn.state(),
            TxnState::Open,
            "acquire on a transaction that is not open"
        );

        let mut st = self.state.borrow_mut();
        if st.phase != Phase::Running {
            return Err(CacheError::ShuttingDown);
        }

        if st.map.get(block).is_none() {
            // Miss: create the record, take the (fresh) lock, park the
            // caller on the load queue, and start the read.
            let page = PageBuf::try_zeroed(self.block_size.as_usize())?;
            st.stats.misses += 1;
            let mut buf = Buf::new(block);
            let granted = buf.lock.try_lock(mode);
            debug_assert!(granted, "fresh lock always grants");
            buf.in_flight = InFlight::Read;
            buf.active_callbacks += 1;
            buf.load_waiters.push_back(Waiter {
                txn: txn.clone(),
                mode,
                cont: WaiterCont::Block(cb),
            });
            st.map.insert(buf);
            st.repl.touch(block);
            st.evict_overflow(self.max_blocks);
            trace!(event = "block_miss_load", block = block.0, mode = %mode);
            drop(st);

            let cache = Rc::clone(self);
            self.serializer.borrow_mut().read(
                block,
                page,
                Box::new(move |result| cache.on_read_complete(block, result)),
            );
            return Ok(None);
        }

        st.stats.hits += 1;
        st.repl.touch(block);
        let cached = st
            .map
            .get(block)
            .map(|buf| buf.data.is_some())
            .expect("resident block");

        if cached {
            let granted = st
                .map
                .get_mut(block)
                .expect("resident block")
                .lock
                .try_lock(mode);
            if granted {
                st.counters.n_blocks_acquired += 1;
                trace!(event = "block_hit", block = block.0, mode = %mode);
                drop(st);
                return Ok(Some(BufRef::attach(self, txn, block, mode)));
            }
            let buf = st.map.get_mut(block).expect("resident block");
            buf.active_callbacks += 1;
            buf.lock.add_waiter(
                mode,
                Waiter {
                    txn: txn.clone(),
                    mode,
                    cont: WaiterCont::Block(cb),
                },
            );
            trace!(event = "lock_wait", block = block.0, mode = %mode);
            return Ok(None);
        }

        // Still loading: joining acquirers either share the lock now
        // and wait for the data, or queue on the lock.
        let buf = st.map.get_mut(block).expect("resident block");
        buf.active_callbacks += 1;
        let waiter = Waiter {
            txn: txn.clone(),
            mode,
            cont: WaiterCont::Block(cb),
        };
        if buf.lock.try_lock(mode) {
            buf.load_waiters.push_back(waiter);
            trace!(event = "load_join", block = block.0, mode = %mode);
        } else {
            buf.lock.add_waiter(mode, waiter);
            trace!(event = "lock_wait", block = block.0, mode = %mode);
        }
        Ok(None)
    }

    pub(crate) fn allocate(self: &Rc<Self>, txn: &Transaction<S>) -> Result<BufRef<S>> {
        assert_eq!(
            txn.state(),
            TxnState::Open,
            "allocate on a transaction that is not open"
        );
        assert!(
            txn.access().is_write_mode(),
            "allocate requires a write transaction"
        );

        let mut st = self.state.borrow_mut();
        if st.phase != Phase::Running {
            return Err(CacheError::ShuttingDown);
        }
        let page = PageBuf::try_zeroed(self.block_size.as_usize())?;
        let block = self.serializer.borrow_mut().allocate();

        let mut buf = Buf::new(block);
        buf.data = Some(page);
        let granted = buf.lock.try_lock(Access::Write);
        debug_assert!(granted, "fresh lock always grants");
        st.map.insert(buf);
        st.repl.touch(block);
        st.counters.n_blocks_acquired += 1;
        st.evict_overflow(self.max_blocks);
        trace!(event = "block_allocate", block = block.0);
        drop(st);

        Ok(BufRef::attach(self, txn, block, Access::Write))
    }

    pub(crate) fn commit(self: &Rc<Self>, txn: &Transaction<S>, cb: CommitCallback) -> bool {
        assert_eq!(
            txn.state(),
            TxnState::Open,
            "commit on a transaction that is not open"
        );
        assert_eq!(
            txn.inner.blocks_held.get(),
            0,
            "transaction {} committed while still holding blocks",
            txn.id()
        );

        if !txn.access().is_write_mode() {
            txn.inner.state.set(TxnState::Committed);
            let mut st = self.state.borrow_mut();
            st.counters.n_trans_freed += 1;
            trace!(event = "txn_commit_readonly", txn = txn.id().0);
            return true;
        }

        txn.inner.state.set(TxnState::Committing);
        let (granted, wait_for_flush) = {
            let mut st = self.state.borrow_mut();
            let granted = st.wb.flush_lock.unlock(Access::Read);
            (granted, st.wb.wait_for_flush)
        };
        trace!(
            event = "txn_committing",
            txn = txn.id().0,
            wait_for_flush,
            unblocked = granted.len()
        );
        for cont in granted {
            self.handle.post(cont);
        }

        let pending = txn.clone();
        let cache = Rc::clone(self);
        if wait_for_flush {
            self.sync(Box::new(move |result| {
                pending.inner.state.set(TxnState::Committed);
                cache.state.borrow_mut().counters.n_trans_freed += 1;
                trace!(event = "txn_committed", txn = pending.id().0);
                cb(result);
            }));
        } else {
            self.handle.post(move || {
                pending.inner.state.set(TxnState::Committed);
                cache.state.borrow_mut().counters.n_trans_freed += 1;
                trace!(event = "txn_committed", txn = pending.id().0);
                cb(Ok(()));
            });
        }
        false
    }

    pub(crate) fn release_block(self: &Rc<Self>, block: BlockId, mode: Access) {
        let granted = {
            let mut st = self.state.borrow_mut();
            st.counters.n_blocks_released += 1;
            let buf = st.map.get_mut(block).expect("release of a resident block");
            let granted = buf.lock.unlock(mode);
            trace!(
                event = "block_release",
                block = block.0,
                mode = %mode,
                woken = granted.len()
            );
            st.evict_overflow(self.max_blocks);
            granted
        };
        for waiter in granted {
            self.dispatch_waiter(block, waiter);
        }
    }

    /// Dispatch one granted waiter on its own turn. The continuation
    /// may release and even unload the block; nothing here touches the
    /// block after the continuation runs.
    pub(crate) fn dispatch_waiter(self: &Rc<Self>, block: BlockId, waiter: Waiter<S>) {
        let cache = Rc::clone(self);
        self.handle.post(move || {
            let Waiter { txn, mode, cont } = waiter;
            {
                let mut st = cache.state.borrow_mut();
                let buf = st
                    .map
                    .get_mut(block)
                    .expect("block with a dispatched waiter");
                debug_assert!(buf.active_callbacks > 0);
                buf.active_callbacks -= 1;
                if matches!(cont, WaiterCont::Block(_)) {
                    st.counters.n_blocks_acquired += 1;
                }
            }
            match cont {
                WaiterCont::Block(cb) => {
                    let handle = BufRef::attach(&cache, &txn, block, mode);
                    cb(Ok(handle));
                }
                WaiterCont::Plain(f) => f(),
            }
        });
    }

    /// Serializer read completion: flip the block to cached and notify
    /// the load waiters in arrival order, one wakeup each.
    pub(crate) fn on_read_complete(self: &Rc<Self>, block: BlockId, result: Result<PageBuf>) {
        match result {
            Ok(page) => {
                let waiters = {
                    let mut st = self.state.borrow_mut();
                    let buf = st.map.get_mut(block).expect("loading block is resident");
                    debug_assert_eq!(buf.in_flight, InFlight::Read);
                    debug_assert!(buf.data.is_none());
                    buf.in_flight = InFlight::None;
                    buf.data = Some(page);
                    let waiters: Vec<Waiter<S>> = buf.load_waiters.drain(..).collect();
                    debug_assert!(!waiters.is_empty(), "loading block always has waiters");
                    trace!(event = "block_loaded", block = block.0, waiters = waiters.len());
                    st.evict_overflow(self.max_blocks);
                    waiters
                };
                for waiter in waiters {
                    self.dispatch_waiter(block, waiter);
                }
            }
            Err(err) => self.fail_load(block, &err),
        }
    }

    /// Serializer read failure: tear the record down and fail every
    /// deferred acquirer exactly once.
    fn fail_load(self: &Rc<Self>, block: BlockId, err: &CacheError) {
        let detail = err.to_string();
        let waiters = {
            let mut st = self.state.borrow_mut();
            let mut buf = st.map.remove(block).expect("loading block is resident");
            st.repl.remove(block);
            let mut waiters: Vec<Waiter<S>> = buf.load_waiters.drain(..).collect();
            waiters.extend(buf.lock.drain_waiters().into_iter().map(|(_, w)| w));
            error!(
                event = "block_load_failed",
                block = block.0,
                waiters = waiters.len(),
                error = %detail
            );
            waiters
        };
        for waiter in waiters {
            let detail = detail.clone();
            self.handle.post(move || {
                let Waiter { cont, .. } = waiter;
                match cont {
                    WaiterCont::Block(cb) => cb(Err(CacheError::io_detail(&detail))),
                    WaiterCont::Plain(_) => {
                        debug_assert!(false, "upgrade waiter on a loading block");
                    }
                }
            });
        }
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// Run `f` against the underlying serializer.
    ///
    /// The serializer must not be re-entered from `f` (no reads, writes,
    /// or allocations); intended for inspection and test assertions.
    pub fn with_serializer<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.serializer.borrow())
    }
}

// ── Transaction ─────────────────────────────────────────────────────────────

/// Lifecycle of a transaction. Read-only transactions skip
/// `Committing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Pending,
    Open,
    Committing,
    Committed,
}

struct TxnCore<S: Serializer + 'static> {
    cache: Rc<Cache<S>>,
    id: TxnId,
    access: Access,
    state: Cell<TxnState>,
    blocks_held: Cell<u32>,
}

impl<S: Serializer + 'static> Drop for TxnCore<S> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert_eq!(
                self.state.get(),
                TxnState::Committed,
                "transaction {} dropped without commit",
                self.id
            );
        }
    }
}

/// A bounded sequence of block acquisitions under one access mode.
///
/// Cheap to clone; clones share the underlying record. Every
/// transaction must be committed exactly once, after releasing every
/// block it acquired.
pub struct Transaction<S: Serializer + 'static> {
    inner: Rc<TxnCore<S>>,
}

impl<S: Serializer + 'static> Clone for Transaction<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// Continuation for a deferred block acquisition.
pub type BlockCallback<S> = Box<dyn FnOnce(Result<BufRef<S>>)>;
/// Continuation for a write transaction's commit.
pub type CommitCallback = Box<dyn FnOnce(Result<()>)>;

impl<S: Serializer + 'static> Transaction<S> {
    fn new(cache: Rc<Cache<S>>, id: TxnId, access: Access) -> Self {
        Self {
            inner: Rc::new(TxnCore {
                cache,
                id,
                access,
                state: Cell::new(TxnState::Pending),
                blocks_held: Cell::new(0),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> TxnId {
        self.inner.id
    }

    #[must_use]
    pub fn access(&self) -> Access {
        self.inner.access
    }

    #[must_use]
    pub fn state(&self) -> TxnState {
        self.inner.state.get()
    }

    /// Acquire `block` in `mode`.
    ///
    /// Returns `Ok(Some(..))` when the block is resident, cached, and
    /// the lock is granted on this turn. Otherwise returns `Ok(None)`
    /// and `cb` fires exactly once — with the handle after the load or
    /// lock grant, or with the error that killed the load.
    pub fn acquire(
        &self,
        block: BlockId,
        mode: Access,
        cb: impl FnOnce(Result<BufRef<S>>) + 'static,
    ) -> Result<Option<BufRef<S>>> {
        Cache::acquire(&self.inner.cache, self, block, mode, Box::new(cb))
    }

    /// Allocate a fresh block: zero-filled, cached, and write-locked,
    /// all on this turn. No callback is involved.
    pub fn allocate(&self) -> Result<BufRef<S>> {
        Cache::allocate(&self.inner.cache, self)
    }

    /// Commit the transaction.
    ///
    /// Read-only: returns `true` synchronously; `cb` is never invoked.
    /// Write: returns `false`; `cb` fires once after writeback sync
    /// (or on the next turn when the cache runs without
    /// `wait_for_flush`), carrying any flush error.
    pub fn commit(&self, cb: impl FnOnce(Result<()>) + 'static) -> bool {
        Cache::commit(&self.inner.cache, self, Box::new(cb))
    }
}

// ── Block handle ────────────────────────────────────────────────────────────

/// A transaction's handle to a locked block.
///
/// The handle is the lock: dropping it without [`BufRef::release`] is a
/// programming error caught by a debug assertion. Data access goes
/// through short-lived guards; holding a guard across another cache
/// call is a borrow error by construction.
pub struct BufRef<S: Serializer + 'static> {
    cache: Rc<Cache<S>>,
    txn: Transaction<S>,
    block: BlockId,
    mode: Rc<Cell<Access>>,
    released: Cell<bool>,
}

impl<S: Serializer + 'static> std::fmt::Debug for BufRef<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufRef")
            .field("block", &self.block)
            .field("mode", &self.mode.get())
            .field("released", &self.released.get())
            .finish()
    }
}

impl<S: Serializer + 'static> BufRef<S> {
    fn attach(cache: &Rc<Cache<S>>, txn: &Transaction<S>, block: BlockId, mode: Access) -> Self {
        txn.inner.blocks_held.set(txn.inner.blocks_held.get() + 1);
        Self {
            cache: Rc::clone(cache),
            txn: txn.clone(),
            block,
            mode: Rc::new(Cell::new(mode)),
            released: Cell::new(false),
        }
    }

    #[must_use]
    pub fn block_id(&self) -> BlockId {
        self.block
    }

    /// The currently held lock mode (`Write` after a completed
    /// upgrade).
    #[must_use]
    pub fn access(&self) -> Access {
        self.mode.get()
    }

    /// Read the block contents. The block must be cached and locked.
    #[must_use]
    pub fn data(&self) -> Ref<'_, [u8]> {
        let st = self.cache.state.borrow();
        Ref::map(st, |st| {
            let buf = st
                .map
                .get(self.block)
                .expect("block is resident while a handle exists");
            assert!(buf.lock.locked(), "data access on an unlocked block");
            buf.data
                .as_ref()
                .expect("data access on an uncached block")
                .as_slice()
        })
    }

    /// Mutate the block contents in place. Requires a write-capable
    /// mode; diverges copy-on-write from any in-flight flush snapshot.
    #[must_use]
    pub fn data_mut(&self) -> RefMut<'_, [u8]> {
        debug_assert!(
            self.mode.get().is_write_mode(),
            "mutable data access under {}",
            self.mode.get()
        );
        let st = self.cache.state.borrow_mut();
        RefMut::map(st, |st| {
            let buf = st
                .map
                .get_mut(self.block)
                .expect("block is resident while a handle exists");
            assert!(buf.lock.locked(), "data access on an unlocked block");
            buf.data
                .as_mut()
                .expect("data access on an uncached block")
                .make_mut()
        })
    }

    /// Overwrite the whole block (loader convenience).
    pub fn fill(&self, bytes: &[u8]) {
        let mut data = self.data_mut();
        assert_eq!(bytes.len(), data.len(), "fill with a non-block-sized buffer");
        data.copy_from_slice(bytes);
    }

    /// Enroll the block in the writeback dirty set.
    pub fn set_dirty(&self) {
        self.cache.mark_dirty(self.block);
    }

    /// Upgrade a held `IntentWrite` to `Write`.
    ///
    /// Returns `true` when the upgrade completes on this turn (no
    /// readers held). Otherwise `cb` fires once the readers drain; new
    /// readers cannot enter ahead of the pending upgrade.
    pub fn upgrade(&self, cb: impl FnOnce() + 'static) -> bool {
        assert_eq!(
            self.mode.get(),
            Access::IntentWrite,
            "upgrade requires an intent-write lock"
        );
        let upgraded = {
            let mut st = self.cache.state.borrow_mut();
            let buf = st
                .map
                .get_mut(self.block)
                .expect("upgrade of a resident block");
            let mode_cell = Rc::clone(&self.mode);
            let cb: Box<dyn FnOnce()> = Box::new(cb);
            let waiter = Waiter {
                txn: self.txn.clone(),
                mode: Access::Write,
                cont: WaiterCont::Plain(Box::new(move || {
                    mode_cell.set(Access::Write);
                    cb();
                })),
            };
            if buf.lock.upgrade(waiter) {
                true
            } else {
                buf.active_callbacks += 1;
                false
            }
        };
        if upgraded {
            self.mode.set(Access::Write);
            trace!(event = "lock_upgrade", block = self.block.0, immediate = true);
        } else {
            trace!(event = "lock_upgrade_wait", block = self.block.0);
        }
        upgraded
    }

    /// Drop the transaction's lock on this block, waking the next
    /// compatible waiters. The only way to relinquish access.
    pub fn release(self) {
        debug_assert!(!self.released.get(), "block released twice");
        self.released.set(true);
        let held = self.txn.inner.blocks_held.get();
        debug_assert!(held > 0);
        self.txn.inner.blocks_held.set(held - 1);
        Cache::release_block(&self.cache, self.block, self.mode.get());
    }
}

impl<S: Serializer + 'static> Drop for BufRef<S> {
    fn drop(&mut self) {
        if !self.released.get() && !std::thread::panicking() {
            debug_assert!(
                false,
                "block {} handle dropped without release",
                self.block
            );
        }
    }
}
