//! The consumed file-engine interface and its error surface.

use std::io;

use thiserror::Error;

use crate::error::Error;

/// Existence requirement for a [`KvBackend::store`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePolicy {
    /// Insert or overwrite.
    Any,
    /// The key must already exist.
    MustExist,
    /// The key must not exist yet.
    MustNotExist,
}

/// Errors surfaced by a file engine.
///
/// These never leak to store callers raw; the mutation engine maps them
/// into the public taxonomy.
#[derive(Debug, Error)]
pub enum KvError {
    /// An I/O failure from the filesystem.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// A `MustNotExist` store hit an existing key.
    #[error("key already exists")]
    Exists,
    /// A `MustExist` store or a delete missed.
    #[error("key not found")]
    NotFound,
    /// The file is locked by another writer.
    #[error("file is locked")]
    Busy,
    /// The file content failed validation.
    #[error("file corrupt: {0}")]
    Corruption(String),
}

impl From<KvError> for Error {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Io(e) => Error::Operations(format!("file engine i/o: {e}")),
            KvError::Exists => Error::EntryAlreadyExists,
            KvError::NotFound => Error::NoSuchObject,
            KvError::Busy => Error::Busy,
            KvError::Corruption(msg) => Error::Operations(format!("file engine corrupt: {msg}")),
        }
    }
}

/// The persistent key/value file engine the store is built over.
///
/// Implementations provide atomic single-key operations, whole-file
/// traversal, and whole-file transactions with prepare/commit/cancel
/// semantics. A transaction holds the file's exclusive write lock for its
/// whole duration; reads outside a transaction run under a shared lock.
pub trait KvBackend {
    /// Fetches the blob stored under `key`, if any.
    fn fetch(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    /// Stores `blob` under `key`, subject to `policy`.
    fn store(&mut self, key: &[u8], blob: &[u8], policy: StorePolicy) -> Result<(), KvError>;

    /// Deletes `key`. Fails with [`KvError::NotFound`] if absent.
    fn delete(&mut self, key: &[u8]) -> Result<(), KvError>;

    /// Visits every key/blob pair in key order.
    fn scan(
        &self,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), KvError>,
    ) -> Result<(), KvError>;

    /// Opens the whole-file transaction. Fails with [`KvError::Busy`] when
    /// another writer holds the file.
    fn txn_start(&mut self) -> Result<(), KvError>;

    /// Durably stages the transaction so a following commit cannot fail
    /// for resource reasons.
    fn txn_prepare(&mut self) -> Result<(), KvError>;

    /// Finalizes the transaction, making its writes visible and advancing
    /// the sequence counter.
    fn txn_commit(&mut self) -> Result<(), KvError>;

    /// Rolls the transaction back, restoring the pre-transaction state.
    fn txn_cancel(&mut self) -> Result<(), KvError>;

    /// A counter that advances on every committed change to the file; used
    /// to detect that cached state derived from the file has gone stale.
    fn sequence_counter(&self) -> u64;
}
