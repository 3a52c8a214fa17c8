//! Request contexts and the caller-held spy handle.
//!
//! Each accepted operation gets a [`RequestCtx`] owned by the scheduler's
//! closures. The caller keeps only a [`Request`] — a `Weak` spy into the
//! context. Dropping the request before completion marks the context
//! terminated; the unit-of-work and deadline callbacks both check that
//! flag before touching any state, so abandoned work degrades to a no-op
//! and the context is freed without the caller's completion ever firing.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::error::Result;
use crate::model::{Filter, ModElement, Name, Record, Scope, SequenceKind};
use crate::sched::event_loop::TimerHandle;

/// The operation kinds a request can carry.
#[derive(Debug)]
pub enum Operation {
    /// Add a record.
    Add(Record),
    /// Apply modify elements to a record.
    Modify {
        /// The record to modify.
        name: Name,
        /// The change elements.
        elements: Vec<ModElement>,
        /// Relax duplicate/absence errors to no-ops.
        permissive: bool,
    },
    /// Delete a record.
    Delete(Name),
    /// Rename a record.
    Rename {
        /// The current name.
        old: Name,
        /// The target name.
        new: Name,
    },
    /// Find records.
    Search {
        /// The search base.
        base: Name,
        /// The scope relative to the base.
        scope: Scope,
        /// An optional equality filter.
        filter: Option<Filter>,
    },
    /// Read a sequence number.
    SequenceNumber(SequenceKind),
}

/// What a completed operation hands to its completion callback.
#[derive(Debug)]
pub enum Reply {
    /// A mutation completed; the store's sequence number afterwards.
    Mutated {
        /// The sequence number after the mutation.
        sequence: u64,
    },
    /// A search completed.
    Records(Vec<Record>),
    /// A sequence-number query completed.
    Sequence(u64),
}

/// The completion callback type.
pub type Completion = Box<dyn FnOnce(Result<Reply>)>;

/// Per-operation state shared between the scheduled unit of work, the
/// deadline timer, and the caller's spy.
pub struct RequestCtx {
    deadline: Instant,
    terminated: Cell<bool>,
    completed: Cell<bool>,
    completion: RefCell<Option<Completion>>,
    timer: RefCell<Option<TimerHandle>>,
}

impl RequestCtx {
    pub(crate) fn new(deadline: Instant, completion: Completion) -> Rc<Self> {
        Rc::new(Self {
            deadline,
            terminated: Cell::new(false),
            completed: Cell::new(false),
            completion: RefCell::new(Some(completion)),
            timer: RefCell::new(None),
        })
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn arm_timer(&self, handle: TimerHandle) {
        *self.timer.borrow_mut() = Some(handle);
    }

    /// Whether a callback should do nothing: the caller abandoned the
    /// request, or the other callback already completed it.
    pub(crate) fn is_dead(&self) -> bool {
        self.terminated.get() || self.completed.get()
    }

    /// Finishes the request: disarms the deadline timer and fires the
    /// completion callback, unless the caller abandoned the request first.
    pub(crate) fn complete(&self, result: Result<Reply>) {
        if self.completed.replace(true) {
            return;
        }
        if let Some(timer) = self.timer.borrow_mut().take() {
            timer.cancel();
        }
        if self.terminated.get() {
            return;
        }
        // Drop the borrow before running user code; the completion may
        // re-enter the scheduler.
        let callback = self.completion.borrow_mut().take();
        if let Some(callback) = callback {
            callback(result);
        }
    }

    /// Frees an abandoned request: marks it done and disarms the timer so
    /// the loop drops the last references, without ever running the
    /// caller's completion.
    pub(crate) fn release(&self) {
        self.completed.set(true);
        if let Some(timer) = self.timer.borrow_mut().take() {
            timer.cancel();
        }
        self.completion.borrow_mut().take();
    }

    fn terminate(&self) {
        if !self.completed.get() {
            self.terminated.set(true);
        }
    }
}

/// The caller's handle on an in-flight operation.
///
/// Holds only a weak spy into the request context; dropping (or
/// explicitly cancelling) before completion turns the pending work into a
/// no-op without freeing anything the scheduler still references.
#[derive(Debug)]
pub struct Request {
    spy: Weak<RequestCtx>,
}

impl Request {
    pub(crate) fn new(spy: Weak<RequestCtx>) -> Self {
        Self { spy }
    }

    /// Abandons the operation if it has not completed yet. The completion
    /// callback will not fire.
    pub fn cancel(&self) {
        if let Some(ctx) = self.spy.upgrade() {
            ctx.terminate();
        }
    }

    /// Whether the operation has completed (or its context is already
    /// gone).
    pub fn is_finished(&self) -> bool {
        self.spy.upgrade().map_or(true, |ctx| ctx.completed.get())
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.cancel();
    }
}
