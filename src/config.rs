//! Store configuration options.
//!
//! [`OpenOptions`] controls how the backing file is opened and how eagerly
//! writes reach disk. Use [`OpenOptions::default`] for a durable store,
//! or [`OpenOptions::fast`] to trade sync guarantees for speed in tests
//! and bulk loads.

/// Options controlling how a store is opened.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Create the backing file if it does not exist.
    pub create_if_missing: bool,
    /// Fsync the backing file on every commit.
    pub durable_sync: bool,
    /// Reject every mutation with an access-rights error.
    pub read_only: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            durable_sync: true,
            read_only: false,
        }
    }
}

impl OpenOptions {
    /// Durable defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// No fsync on commit. Data still lands in the file, but a crash can
    /// lose recent transactions.
    pub fn fast() -> Self {
        Self {
            durable_sync: false,
            ..Self::default()
        }
    }

    /// Opens the store for reading only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Fail instead of creating a missing file.
    pub fn must_exist(mut self) -> Self {
        self.create_if_missing = false;
        self
    }
}
