//! The schema collaborator interface.
//!
//! The store does not decide how attribute values compare or whether an
//! attribute may hold more than one value; it asks a [`Schema`]. The
//! bundled [`CaseFoldSchema`] answers the way a plain directory does:
//! values compare case-insensitively after whitespace trimming, and no
//! attribute is single-valued unless registered. Per-file overrides from
//! the `@ATTRIBUTES` special record are layered on top by the store and
//! are not this trait's concern.

use std::collections::HashSet;

use crate::model::fold_attr_name;

/// Decides value syntax questions for the store.
pub trait Schema {
    /// Whether the attribute may hold at most one value.
    fn is_single_valued(&self, attr: &str) -> bool;

    /// Whether two values of the attribute are equal.
    fn values_equal(&self, attr: &str, a: &[u8], b: &[u8]) -> bool;

    /// The canonical byte form of a value, used as the index-entry key
    /// component. Values that are equal per [`Schema::values_equal`] must
    /// canonicalize identically.
    fn canonical_form(&self, attr: &str, value: &[u8]) -> Vec<u8>;
}

/// A case-insensitive default schema.
///
/// UTF-8 values canonicalize to their trimmed, lowercased form; non-UTF-8
/// values canonicalize to themselves. Single-valued attributes are only
/// those registered via [`CaseFoldSchema::with_single_valued`].
#[derive(Debug, Default, Clone)]
pub struct CaseFoldSchema {
    single_valued: HashSet<String>,
}

impl CaseFoldSchema {
    /// A schema with no single-valued attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers attributes as single-valued.
    pub fn with_single_valued<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for attr in attrs {
            self.single_valued.insert(fold_attr_name(attr.as_ref()));
        }
        self
    }
}

impl Schema for CaseFoldSchema {
    fn is_single_valued(&self, attr: &str) -> bool {
        self.single_valued.contains(&fold_attr_name(attr))
    }

    fn values_equal(&self, attr: &str, a: &[u8], b: &[u8]) -> bool {
        self.canonical_form(attr, a) == self.canonical_form(attr, b)
    }

    fn canonical_form(&self, _attr: &str, value: &[u8]) -> Vec<u8> {
        match std::str::from_utf8(value) {
            Ok(s) => s.trim().to_lowercase().into_bytes(),
            Err(_) => value.to_vec(),
        }
    }
}
