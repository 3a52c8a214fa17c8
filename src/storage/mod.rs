//! The persistent key/value file layer.
//!
//! [`KvBackend`] is the interface the store consumes; [`FileKv`] is the
//! bundled single-file implementation. Embedders with their own file
//! engine implement the trait and hand it to
//! [`Store::with_backend`](crate::db::Store::with_backend).

mod file;
mod kv;

pub use file::FileKv;
pub use kv::{KvBackend, KvError, StorePolicy};
