//! A minimal cooperative event loop.
//!
//! Two kinds of work: zero-delay immediates, run in submission order, and
//! absolute-deadline timers. The loop is single-threaded and run-to-
//! completion — a callback never suspends, and no two callbacks overlap.
//! Due timers run before queued immediates, so a deadline that has passed
//! preempts the unit of work it guards.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Instant;

type Callback = Box<dyn FnOnce()>;

struct TimerEntry {
    when: Instant,
    cancelled: Rc<Cell<bool>>,
    callback: Callback,
}

/// A handle to a pending timer; cancelling makes the timer a no-op.
pub struct TimerHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TimerHandle {
    /// Disarms the timer.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }
}

/// The cooperative event loop.
#[derive(Default)]
pub struct EventLoop {
    immediates: RefCell<VecDeque<Callback>>,
    timers: RefCell<Vec<TimerEntry>>,
}

impl EventLoop {
    /// An empty loop.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a zero-delay unit of work.
    pub fn defer(&self, callback: impl FnOnce() + 'static) {
        self.immediates.borrow_mut().push_back(Box::new(callback));
    }

    /// Arms a timer that fires once `when` has passed.
    pub fn at(&self, when: Instant, callback: impl FnOnce() + 'static) -> TimerHandle {
        let cancelled = Rc::new(Cell::new(false));
        self.timers.borrow_mut().push(TimerEntry {
            when,
            cancelled: Rc::clone(&cancelled),
            callback: Box::new(callback),
        });
        TimerHandle { cancelled }
    }

    // Pops the earliest due, uncancelled timer. Cancelled entries are
    // pruned here so their captured state is released promptly.
    fn take_due_timer(&self, now: Instant) -> Option<Callback> {
        let mut timers = self.timers.borrow_mut();
        timers.retain(|t| !t.cancelled.get());
        let due = timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.when <= now)
            .min_by_key(|(_, t)| t.when)
            .map(|(i, _)| i)?;
        Some(timers.remove(due).callback)
    }

    /// Runs one callback if any is runnable right now. Returns whether
    /// anything ran. Armed-but-not-due timers do not count as runnable.
    pub fn run_once(&self) -> bool {
        if let Some(callback) = self.take_due_timer(Instant::now()) {
            callback();
            return true;
        }
        let next = self.immediates.borrow_mut().pop_front();
        match next {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Runs callbacks until nothing is runnable. Does not wait for armed
    /// timers; drive the loop again once their deadlines near.
    pub fn run_until_idle(&self) {
        while self.run_once() {}
    }

    /// Whether any immediate or uncancelled timer is outstanding.
    pub fn has_pending(&self) -> bool {
        !self.immediates.borrow().is_empty()
            || self.timers.borrow().iter().any(|t| !t.cancelled.get())
    }
}
