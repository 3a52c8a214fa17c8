//! Error handling for Sable operations.
//!
//! This module defines the error taxonomy used throughout the store. All
//! public APIs return `Result<T, Error>` for consistent error handling.
//!
//! Errors from the underlying key/value file engine are mapped into this
//! taxonomy at the transaction-coordinator / mutation-engine boundary and
//! are never surfaced in their raw form. A failed operation completes with
//! exactly one error kind and no partial side effects.

use thiserror::Error;

/// Result type for Sable operations.
///
/// All public APIs return `Result<T, Error>` for error handling.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Internal or resource failure (I/O, corruption, allocation).
    ///
    /// Covers everything the caller cannot meaningfully react to beyond
    /// reporting it. The message carries the underlying cause.
    #[error("operations error: {0}")]
    Operations(String),

    /// The file is locked by another writer. The caller may retry.
    #[error("store is busy")]
    Busy,

    /// The operation's deadline passed before it completed, or no deadline
    /// was supplied.
    #[error("time limit exceeded")]
    TimeLimitExceeded,

    /// An Add targeted a name that already has a record.
    #[error("entry already exists")]
    EntryAlreadyExists,

    /// The named record does not exist.
    #[error("no such object")]
    NoSuchObject,

    /// A Modify referenced an attribute or value the record does not carry.
    #[error("no such attribute")]
    NoSuchAttribute,

    /// A value being added is already present on the attribute.
    #[error("attribute or value exists")]
    AttributeOrValueExists,

    /// A single-valued attribute would end up with more than one value.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// A name or attribute failed syntactic validation.
    #[error("invalid attribute syntax: {0}")]
    InvalidAttributeSyntax(String),

    /// A mutation was attempted on a store opened read-only.
    #[error("insufficient access rights")]
    InsufficientAccessRights,

    /// A malformed request, such as a modify element with no values where
    /// values are required.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Anything that does not fit the kinds above.
    #[error("{0}")]
    Other(String),
}
