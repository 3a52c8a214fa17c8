//! Sable is an embedded, transactional directory record store.
//!
//! Records — a unique hierarchical name plus ordered, multi-valued
//! attributes — persist in a single local key/value file. Declared
//! attributes get secondary indexes kept consistent with every mutation;
//! schema constraints (single-valued attributes, no duplicate values) are
//! enforced on the way in; and every mutation is transactional across the
//! data and its indexes. Operations are exposed twice: synchronously on
//! [`Store`], and as cancellable, deadline-bounded requests on
//! [`Database`], driven by a cooperative single-threaded event loop.
//!
//! # Example
//!
//! ```rust
//! use sable::{Attribute, Name, OpenOptions, Record, Store};
//!
//! let mut store = Store::open("people.sable", OpenOptions::default())?;
//! let alice = Record::new("cn=alice,ou=people")
//!     .attr(Attribute::single("uid", "1001"));
//! let sequence = store.add(&alice)?;
//! assert_eq!(store.fetch(&Name::new("CN=Alice,OU=People"))?.unwrap(), alice);
//! # Ok::<(), sable::Error>(())
//! ```

pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod model;
pub mod schema;
pub mod sched;
pub mod storage;

pub use config::OpenOptions;
pub use db::{
    Database, Store, ATTRIBUTES_NAME, CHECK_BASE_OPTION, INDEXED_ATTR, INDEXES_NAME, META_NAME,
    OPTIONS_NAME, SEQUENCE_ATTR, WHEN_CHANGED_ATTR,
};
pub use error::{Error, Result};
pub use model::{
    Attribute, AttributeFlags, Filter, ModElement, ModOp, Name, Record, Scope, SequenceKind,
    Value,
};
pub use schema::{CaseFoldSchema, Schema};
pub use sched::{Reply, Request};
pub use storage::{FileKv, KvBackend, KvError, StorePolicy};
