#![forbid(unsafe_code)]
//! Single-threaded cooperative event loop.
//!
//! Each SliceDB slice is pinned to exactly one scheduler for its whole
//! lifetime; "concurrency" inside a slice is the interleaving of
//! continuations across turns of this loop, never parallelism. The loop
//! provides the two capabilities the cache consumes:
//!
//! - deferring a continuation to a later turn ([`LoopHandle::post`]),
//! - registering a repeating timer ([`LoopHandle::add_timer`]).
//!
//! Time is virtual and driven explicitly through [`EventLoop::advance`],
//! which makes timer-dependent behavior (writeback intervals, flush
//! thresholds racing the timer) fully deterministic in tests. A
//! production driver advances the clock from its own wall-time source.
//!
//! Handles are `!Send` by construction: posting work onto a slice from
//! another thread is a type error, not a runtime race.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, trace};

type Task = Box<dyn FnOnce()>;
type TimerFn = Rc<RefCell<dyn FnMut()>>;

/// Identifies a repeating timer registered on a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

struct TimerEntry {
    interval: Duration,
    callback: TimerFn,
}

struct LoopState {
    now: Duration,
    ready: VecDeque<Task>,
    timers: HashMap<u64, TimerEntry>,
    // Min-heap of (deadline, tie-break seq, timer id). Entries for
    // cancelled timers are discarded lazily when popped.
    deadlines: BinaryHeap<Reverse<(Duration, u64, u64)>>,
    next_timer: u64,
    next_seq: u64,
    turns: u64,
}

impl LoopState {
    fn new() -> Self {
        Self {
            now: Duration::ZERO,
            ready: VecDeque::new(),
            timers: HashMap::new(),
            deadlines: BinaryHeap::new(),
            next_timer: 0,
            next_seq: 0,
            turns: 0,
        }
    }

    fn schedule(&mut self, due: Duration, id: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.deadlines.push(Reverse((due, seq, id)));
    }

    /// Pop the next live deadline at or before `limit`.
    fn pop_due(&mut self, limit: Duration) -> Option<(Duration, u64)> {
        while let Some(Reverse((due, _, id))) = self.deadlines.peek().copied() {
            if due > limit {
                return None;
            }
            let _ = self.deadlines.pop();
            if self.timers.contains_key(&id) {
                return Some((due, id));
            }
            // Cancelled timer; keep draining.
        }
        None
    }
}

/// Cheap, clonable capability handle for posting work and timers.
#[derive(Clone)]
pub struct LoopHandle {
    state: Rc<RefCell<LoopState>>,
}

impl LoopHandle {
    /// Defer `task` to a later turn of the loop. Tasks run in FIFO order.
    pub fn post(&self, task: impl FnOnce() + 'static) {
        self.state.borrow_mut().ready.push_back(Box::new(task));
    }

    /// Register a repeating timer firing every `interval` of virtual time.
    ///
    /// The first firing is one full interval after registration. The
    /// interval must be nonzero.
    pub fn add_timer(&self, interval: Duration, callback: impl FnMut() + 'static) -> TimerToken {
        assert!(!interval.is_zero(), "timer interval must be > 0");
        let mut state = self.state.borrow_mut();
        let id = state.next_timer;
        state.next_timer += 1;
        state.timers.insert(
            id,
            TimerEntry {
                interval,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        let due = state.now + interval;
        state.schedule(due, id);
        debug!(event = "timer_armed", timer = id, interval_ms = interval.as_millis());
        TimerToken(id)
    }

    /// Cancel a repeating timer. Safe to call from within its own callback.
    pub fn cancel_timer(&self, token: TimerToken) {
        let removed = self.state.borrow_mut().timers.remove(&token.0).is_some();
        if removed {
            debug!(event = "timer_cancelled", timer = token.0);
        }
    }

    /// Current virtual time.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.state.borrow().now
    }
}

/// Owner side of the loop: drives turns and the virtual clock.
pub struct EventLoop {
    state: Rc<RefCell<LoopState>>,
}

impl EventLoop {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(LoopState::new())),
        }
    }

    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            state: Rc::clone(&self.state),
        }
    }

    /// Run a single ready task. Returns false when the ready queue is empty.
    pub fn turn(&self) -> bool {
        let task = {
            let mut state = self.state.borrow_mut();
            let task = state.ready.pop_front();
            if task.is_some() {
                state.turns += 1;
            }
            task
        };
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Drain the ready queue, including tasks posted while draining.
    /// Returns the number of turns executed. Does not move the clock.
    pub fn run_until_idle(&self) -> usize {
        let mut turns = 0;
        while self.turn() {
            turns += 1;
        }
        turns
    }

    /// Advance virtual time by `delta`, firing due timers in deadline
    /// order and draining the ready queue after each firing.
    pub fn advance(&self, delta: Duration) {
        let target = self.state.borrow().now + delta;
        self.run_until_idle();

        loop {
            let due = self.state.borrow_mut().pop_due(target);
            let Some((due, id)) = due else {
                break;
            };

            // Re-arm before firing so a callback that cancels its own
            // timer also kills the rescheduled deadline.
            let callback = {
                let mut state = self.state.borrow_mut();
                state.now = state.now.max(due);
                let Some(entry) = state.timers.get(&id) else {
                    continue;
                };
                let next = due + entry.interval;
                let callback = Rc::clone(&entry.callback);
                state.schedule(next, id);
                callback
            };
            trace!(event = "timer_fire", timer = id, at_ms = due.as_millis());
            (callback.borrow_mut())();
            self.run_until_idle();
        }

        self.state.borrow_mut().now = target;
    }

    /// Total tasks executed since the loop was created.
    #[must_use]
    pub fn turns(&self) -> u64 {
        self.state.borrow().turns
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn posted_tasks_run_in_fifo_order() {
        let el = EventLoop::new();
        let handle = el.handle();
        let log = Rc::new(RefCell::new(Vec::new()));

        for i in 0..4 {
            let log = Rc::clone(&log);
            handle.post(move || log.borrow_mut().push(i));
        }
        assert!(log.borrow().is_empty(), "tasks must not run at post time");

        let turns = el.run_until_idle();
        assert_eq!(turns, 4);
        assert_eq!(*log.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn tasks_posted_while_draining_run_in_the_same_drain() {
        let el = EventLoop::new();
        let handle = el.handle();
        let log = Rc::new(RefCell::new(Vec::new()));

        {
            let log = Rc::clone(&log);
            let handle2 = handle.clone();
            handle.post(move || {
                log.borrow_mut().push("outer");
                let log = Rc::clone(&log);
                handle2.post(move || log.borrow_mut().push("inner"));
            });
        }

        el.run_until_idle();
        assert_eq!(*log.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn repeating_timer_fires_once_per_interval() {
        let el = EventLoop::new();
        let handle = el.handle();
        let fired = Rc::new(RefCell::new(0_u32));

        let counter = Rc::clone(&fired);
        let _token = handle.add_timer(Duration::from_millis(10), move || {
            *counter.borrow_mut() += 1;
        });

        el.advance(Duration::from_millis(9));
        assert_eq!(*fired.borrow(), 0);
        el.advance(Duration::from_millis(1));
        assert_eq!(*fired.borrow(), 1);
        el.advance(Duration::from_millis(35));
        assert_eq!(*fired.borrow(), 4);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let el = EventLoop::new();
        let handle = el.handle();
        let log = Rc::new(RefCell::new(Vec::new()));

        let slow_log = Rc::clone(&log);
        let _slow = handle.add_timer(Duration::from_millis(15), move || {
            slow_log.borrow_mut().push("slow");
        });
        let fast_log = Rc::clone(&log);
        let _fast = handle.add_timer(Duration::from_millis(10), move || {
            fast_log.borrow_mut().push("fast");
        });

        el.advance(Duration::from_millis(20));
        assert_eq!(*log.borrow(), vec!["fast", "slow", "fast"]);
    }

    #[test]
    fn cancelled_timer_stops_firing() {
        let el = EventLoop::new();
        let handle = el.handle();
        let fired = Rc::new(RefCell::new(0_u32));

        let counter = Rc::clone(&fired);
        let token = handle.add_timer(Duration::from_millis(5), move || {
            *counter.borrow_mut() += 1;
        });

        el.advance(Duration::from_millis(12));
        assert_eq!(*fired.borrow(), 2);
        handle.cancel_timer(token);
        el.advance(Duration::from_millis(50));
        assert_eq!(*fired.borrow(), 2);
    }

    #[test]
    fn timer_callback_may_cancel_itself() {
        let el = EventLoop::new();
        let handle = el.handle();
        let fired = Rc::new(RefCell::new(0_u32));
        let slot: Rc<RefCell<Option<TimerToken>>> = Rc::new(RefCell::new(None));

        let counter = Rc::clone(&fired);
        let inner_slot = Rc::clone(&slot);
        let inner_handle = handle.clone();
        let token = handle.add_timer(Duration::from_millis(5), move || {
            *counter.borrow_mut() += 1;
            if let Some(token) = *inner_slot.borrow() {
                inner_handle.cancel_timer(token);
            }
        });
        *slot.borrow_mut() = Some(token);

        el.advance(Duration::from_millis(100));
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn timer_callback_posts_run_before_later_timers() {
        let el = EventLoop::new();
        let handle = el.handle();
        let log = Rc::new(RefCell::new(Vec::new()));

        let t1_log = Rc::clone(&log);
        let t1_handle = handle.clone();
        let _t1 = handle.add_timer(Duration::from_millis(10), move || {
            t1_log.borrow_mut().push("t1");
            let log = Rc::clone(&t1_log);
            t1_handle.post(move || log.borrow_mut().push("t1-post"));
        });
        let t2_log = Rc::clone(&log);
        let _t2 = handle.add_timer(Duration::from_millis(11), move || {
            t2_log.borrow_mut().push("t2");
        });

        el.advance(Duration::from_millis(11));
        assert_eq!(*log.borrow(), vec!["t1", "t1-post", "t2"]);
    }

    #[test]
    fn clock_reaches_target_even_with_no_timers() {
        let el = EventLoop::new();
        let handle = el.handle();
        el.advance(Duration::from_millis(250));
        assert_eq!(handle.now(), Duration::from_millis(250));
    }
}
