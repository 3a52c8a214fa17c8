//! The asynchronous, cancellable request interface.
//!
//! [`Database`] wraps a [`Store`] and a cooperative [`EventLoop`]. Each
//! operation is accepted with an absolute deadline, scheduled as a
//! zero-delay unit of work, and guarded by an independent deadline timer;
//! whichever fires first completes the request and the loser is a no-op.
//! The returned [`Request`] is a weak spy — dropping it abandons the
//! operation without the completion callback ever firing.
//!
//! The loop is single-threaded: operation bodies never overlap, and
//! operations dispatch in acceptance order.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

use tracing::trace;

use crate::config::OpenOptions;
use crate::db::store::Store;
use crate::error::{Error, Result};
use crate::model::{Filter, ModElement, Name, Record, Scope, SequenceKind};
use crate::sched::event_loop::EventLoop;
use crate::sched::request::{Completion, Operation, Reply, Request, RequestCtx};

/// A store plus the event loop that drives its request interface.
pub struct Database {
    store: Rc<RefCell<Store>>,
    events: Rc<EventLoop>,
}

impl Database {
    /// Opens a database over the bundled file engine.
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        Ok(Self::from_store(Store::open(path, options)?))
    }

    /// Wraps an already-open store.
    pub fn from_store(store: Store) -> Self {
        Self {
            store: Rc::new(RefCell::new(store)),
            events: Rc::new(EventLoop::new()),
        }
    }

    /// The underlying synchronous store, for embedders that mix direct
    /// calls with scheduled requests.
    pub fn store(&self) -> &Rc<RefCell<Store>> {
        &self.store
    }

    /// Runs scheduled work until nothing is runnable.
    pub fn run_until_idle(&self) {
        self.events.run_until_idle()
    }

    /// Runs at most one scheduled callback.
    pub fn run_once(&self) -> bool {
        self.events.run_once()
    }

    /// Whether any request is still outstanding.
    pub fn has_pending(&self) -> bool {
        self.events.has_pending()
    }

    /// Schedules an Add.
    pub fn add(
        &self,
        record: Record,
        deadline: Option<Instant>,
        completion: impl FnOnce(Result<Reply>) + 'static,
    ) -> Result<Request> {
        self.submit(Operation::Add(record), deadline, Box::new(completion))
    }

    /// Schedules a Modify.
    pub fn modify(
        &self,
        name: Name,
        elements: Vec<ModElement>,
        permissive: bool,
        deadline: Option<Instant>,
        completion: impl FnOnce(Result<Reply>) + 'static,
    ) -> Result<Request> {
        self.submit(
            Operation::Modify {
                name,
                elements,
                permissive,
            },
            deadline,
            Box::new(completion),
        )
    }

    /// Schedules a Delete.
    pub fn delete(
        &self,
        name: Name,
        deadline: Option<Instant>,
        completion: impl FnOnce(Result<Reply>) + 'static,
    ) -> Result<Request> {
        self.submit(Operation::Delete(name), deadline, Box::new(completion))
    }

    /// Schedules a Rename.
    pub fn rename(
        &self,
        old: Name,
        new: Name,
        deadline: Option<Instant>,
        completion: impl FnOnce(Result<Reply>) + 'static,
    ) -> Result<Request> {
        self.submit(Operation::Rename { old, new }, deadline, Box::new(completion))
    }

    /// Schedules a Search.
    pub fn search(
        &self,
        base: Name,
        scope: Scope,
        filter: Option<Filter>,
        deadline: Option<Instant>,
        completion: impl FnOnce(Result<Reply>) + 'static,
    ) -> Result<Request> {
        self.submit(
            Operation::Search {
                base,
                scope,
                filter,
            },
            deadline,
            Box::new(completion),
        )
    }

    /// Schedules a sequence-number query.
    pub fn sequence_number(
        &self,
        kind: SequenceKind,
        deadline: Option<Instant>,
        completion: impl FnOnce(Result<Reply>) + 'static,
    ) -> Result<Request> {
        self.submit(
            Operation::SequenceNumber(kind),
            deadline,
            Box::new(completion),
        )
    }

    fn submit(
        &self,
        op: Operation,
        deadline: Option<Instant>,
        completion: Completion,
    ) -> Result<Request> {
        let deadline = deadline.ok_or(Error::TimeLimitExceeded)?;
        if Instant::now() >= deadline {
            return Err(Error::TimeLimitExceeded);
        }
        let ctx = RequestCtx::new(deadline, completion);

        let work_ctx = Rc::clone(&ctx);
        let store = Rc::clone(&self.store);
        self.events.defer(move || {
            if work_ctx.is_dead() {
                work_ctx.release();
                return;
            }
            // The timer may not have run yet this tick; the deadline still
            // wins.
            if Instant::now() >= work_ctx.deadline() {
                work_ctx.complete(Err(Error::TimeLimitExceeded));
                return;
            }
            let result = execute(&mut store.borrow_mut(), op);
            work_ctx.complete(result);
        });

        let timer_ctx = Rc::clone(&ctx);
        let handle = self.events.at(deadline, move || {
            if timer_ctx.is_dead() {
                timer_ctx.release();
                return;
            }
            timer_ctx.complete(Err(Error::TimeLimitExceeded));
        });
        ctx.arm_timer(handle);

        trace!("request scheduled");
        Ok(Request::new(Rc::downgrade(&ctx)))
    }
}

fn execute(store: &mut Store, op: Operation) -> Result<Reply> {
    match op {
        Operation::Add(record) => store.add(&record).map(|sequence| Reply::Mutated { sequence }),
        Operation::Modify {
            name,
            elements,
            permissive,
        } => store
            .modify(&name, &elements, permissive)
            .map(|sequence| Reply::Mutated { sequence }),
        Operation::Delete(name) => store
            .delete(&name)
            .map(|sequence| Reply::Mutated { sequence }),
        Operation::Rename { old, new } => store
            .rename(&old, &new)
            .map(|sequence| Reply::Mutated { sequence }),
        Operation::Search {
            base,
            scope,
            filter,
        } => store
            .search(&base, scope, filter.as_ref())
            .map(Reply::Records),
        Operation::SequenceNumber(kind) => store.sequence_number(kind).map(Reply::Sequence),
    }
}
