//! Reader-writer-intent lock with a FIFO waiter queue.
//!
//! Four modes: `Read` (shared), `Write` (exclusive), and the two intent
//! modes that coexist with readers while reserving the right to act.
//! At most one intent holder of either kind exists at a time, and an
//! `IntentWrite` holder may upgrade to `Write` once readers drain; a
//! pending upgrade blocks new readers from entering ahead of it.
//!
//! The lock is strictly FIFO: a request that finds any queued waiter
//! enqueues behind it even when it would be compatible with the current
//! holders, so a stream of readers can never starve a queued writer.
//!
//! Waiters carry an opaque payload `W` supplied by the caller. The lock
//! never invokes anything: granting returns the payloads to the owner,
//! which dispatches exactly one wakeup per grant. That keeps the lock
//! ignorant of block-level callbacks and lets the owner unload the
//! block from inside a dispatched continuation without the lock
//! touching freed state afterwards.

use sdb_types::Access;
use std::collections::VecDeque;
use std::fmt::Write as _;

#[derive(Debug)]
pub struct RwiLock<W> {
    readers: usize,
    intent: Option<Access>,
    writer: bool,
    upgrade_waiter: Option<W>,
    waiters: VecDeque<(Access, W)>,
}

impl<W> RwiLock<W> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            readers: 0,
            intent: None,
            writer: false,
            upgrade_waiter: None,
            waiters: VecDeque::new(),
        }
    }

    /// Compatibility of `mode` with the current holders only; queue
    /// fairness is handled by the callers.
    fn compatible(&self, mode: Access) -> bool {
        match mode {
            Access::Read => !self.writer && self.upgrade_waiter.is_none(),
            Access::IntentRead | Access::IntentWrite => !self.writer && self.intent.is_none(),
            Access::Write => !self.writer && self.readers == 0 && self.intent.is_none(),
        }
    }

    fn record_grant(&mut self, mode: Access) {
        match mode {
            Access::Read => self.readers += 1,
            Access::Write => self.writer = true,
            Access::IntentRead | Access::IntentWrite => {
                debug_assert!(self.intent.is_none());
                self.intent = Some(mode);
            }
        }
    }

    /// Grant `mode` immediately iff it is compatible with the holders
    /// and no earlier waiter is queued.
    pub fn try_lock(&mut self, mode: Access) -> bool {
        if !self.waiters.is_empty() || self.upgrade_waiter.is_some() {
            return false;
        }
        if !self.compatible(mode) {
            return false;
        }
        self.record_grant(mode);
        true
    }

    /// Enqueue a waiter unconditionally; it is granted in FIFO order by
    /// a later `unlock`.
    pub fn add_waiter(&mut self, mode: Access, waiter: W) {
        self.waiters.push_back((mode, waiter));
    }

    /// `try_lock`, falling back to enqueueing. Returns whether the lock
    /// was granted immediately.
    pub fn lock_or_wait(&mut self, mode: Access, waiter: W) -> bool {
        if self.try_lock(mode) {
            true
        } else {
            self.add_waiter(mode, waiter);
            false
        }
    }

    /// Release a held `mode`, then grant the longest compatible FIFO
    /// prefix of the waiter queue (a pending upgrade goes first). The
    /// granted payloads are returned for the owner to dispatch; their
    /// modes are already recorded as held.
    pub fn unlock(&mut self, mode: Access) -> Vec<W> {
        match mode {
            Access::Read => {
                debug_assert!(self.readers > 0, "read unlock with no readers");
                self.readers -= 1;
            }
            Access::Write => {
                debug_assert!(self.writer, "write unlock with no writer");
                self.writer = false;
            }
            Access::IntentRead | Access::IntentWrite => {
                debug_assert_eq!(self.intent, Some(mode), "intent unlock without holder");
                debug_assert!(
                    mode != Access::IntentWrite || self.upgrade_waiter.is_none(),
                    "intent-write unlocked while its upgrade is pending"
                );
                self.intent = None;
            }
        }
        self.pump()
    }

    fn pump(&mut self) -> Vec<W> {
        let mut granted = Vec::new();

        // A pending upgrade holds IntentWrite already and outranks the
        // queue; it completes as soon as the readers drain.
        if self.upgrade_waiter.is_some() && self.readers == 0 && !self.writer {
            debug_assert_eq!(self.intent, Some(Access::IntentWrite));
            self.intent = None;
            self.writer = true;
            granted.extend(self.upgrade_waiter.take());
            return granted;
        }

        while let Some((mode, _)) = self.waiters.front() {
            if !self.compatible(*mode) {
                break;
            }
            let (mode, waiter) = self.waiters.pop_front().expect("nonempty queue");
            self.record_grant(mode);
            granted.push(waiter);
        }
        granted
    }

    /// Upgrade the held `IntentWrite` to `Write`. Immediate iff no
    /// readers are held; otherwise the payload waits for the last
    /// reader and new readers are blocked from entering.
    pub fn upgrade(&mut self, waiter: W) -> bool {
        debug_assert_eq!(self.intent, Some(Access::IntentWrite), "upgrade without intent-write");
        debug_assert!(self.upgrade_waiter.is_none(), "double upgrade");
        if self.readers == 0 {
            self.intent = None;
            self.writer = true;
            true
        } else {
            self.upgrade_waiter = Some(waiter);
            false
        }
    }

    #[must_use]
    pub fn locked(&self) -> bool {
        self.readers > 0 || self.writer || self.intent.is_some()
    }

    #[must_use]
    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty() || self.upgrade_waiter.is_some()
    }

    /// Unlocked with an empty queue: the lock holds no obligations.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.locked() && !self.has_waiters()
    }

    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiters.len() + usize::from(self.upgrade_waiter.is_some())
    }

    /// Queued waiters in FIFO order (excluding a pending upgrade).
    pub fn waiters(&self) -> impl Iterator<Item = (Access, &W)> {
        self.waiters.iter().map(|(mode, w)| (*mode, w))
    }

    #[must_use]
    pub fn upgrade_waiter(&self) -> Option<&W> {
        self.upgrade_waiter.as_ref()
    }

    /// Drop every queued waiter and pending upgrade, returning them in
    /// FIFO order. Holder state is left untouched; used on load failure
    /// when the block is being torn down.
    pub fn drain_waiters(&mut self) -> Vec<(Access, W)> {
        let mut out: Vec<(Access, W)> = self.waiters.drain(..).collect();
        if let Some(waiter) = self.upgrade_waiter.take() {
            out.push((Access::Write, waiter));
        }
        out
    }

    /// One-line holder description for the deadlock dump.
    #[must_use]
    pub fn holder_summary(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "readers={} writer={} intent={}",
            self.readers,
            self.writer,
            self.intent.map_or_else(|| "none".to_owned(), |m| m.to_string()),
        );
        if self.upgrade_waiter.is_some() {
            out.push_str(" upgrade-pending");
        }
        out
    }
}

impl<W> Default for RwiLock<W> {
    fn default() -> Self {
        Self::new()
    }
}
