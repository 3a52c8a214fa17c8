//! Special-record metadata and the cached view of it.
//!
//! Four reserved names carry engine metadata rather than user data:
//! `@META` (sequence number, last-modified timestamp), `@INDEXES` (which
//! attributes are indexed), `@ATTRIBUTES` (per-attribute schema overrides),
//! and `@OPTIONS` (global options). [`MetaCache`] holds the parsed form of
//! the last three and reloads itself when the file engine's sequence
//! counter says the file has moved underneath it.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::codec;
use crate::error::{Error, Result};
use crate::model::{fold_attr_name, Attribute, Name, Record};
use crate::schema::Schema;
use crate::storage::KvBackend;

/// The special record holding the sequence number and change timestamp.
pub const META_NAME: &str = "@META";
/// The special record declaring which attributes are indexed.
pub const INDEXES_NAME: &str = "@INDEXES";
/// The special record carrying per-attribute schema overrides.
pub const ATTRIBUTES_NAME: &str = "@ATTRIBUTES";
/// The special record carrying global options.
pub const OPTIONS_NAME: &str = "@OPTIONS";

/// Attribute of `@META` holding the sequence number, as decimal text.
pub const SEQUENCE_ATTR: &str = "sequenceNumber";
/// Attribute of `@META` holding the last-modified time, as RFC 3339 text.
pub const WHEN_CHANGED_ATTR: &str = "whenChanged";
/// Attribute of `@INDEXES` whose values name the indexed attributes.
pub const INDEXED_ATTR: &str = "indexedAttribute";
/// Attribute of `@OPTIONS` controlling missing-search-base behavior.
pub const CHECK_BASE_OPTION: &str = "checkBaseOnSearch";

const FLAG_SINGLE_VALUE: &[u8] = b"SINGLE-VALUE";
const FLAG_CASE_SENSITIVE: &[u8] = b"CASE-SENSITIVE";
const FLAG_NONE: &[u8] = b"NONE";

/// The parsed, cached content of the declaration special records.
#[derive(Debug, Default)]
pub struct MetaCache {
    indexed: HashSet<String>,
    single_valued: HashSet<String>,
    case_sensitive: HashSet<String>,
    check_base_on_search: bool,
    loaded_generation: Option<u64>,
}

impl MetaCache {
    /// An empty cache; nothing is loaded until [`MetaCache::reload`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Reloads unless the cache already reflects the file's current
    /// generation.
    pub fn ensure_current(&mut self, kv: &dyn KvBackend) -> Result<()> {
        if self.loaded_generation == Some(kv.sequence_counter()) {
            return Ok(());
        }
        self.reload(kv)
    }

    /// Re-reads the declaration records from the file engine.
    pub fn reload(&mut self, kv: &dyn KvBackend) -> Result<()> {
        self.indexed.clear();
        self.single_valued.clear();
        self.case_sensitive.clear();
        self.check_base_on_search = false;

        if let Some(rec) = fetch_special(kv, INDEXES_NAME)? {
            if let Some(attr) = rec.get(INDEXED_ATTR) {
                for value in &attr.values {
                    match std::str::from_utf8(value) {
                        Ok(s) => {
                            self.indexed.insert(fold_attr_name(s));
                        }
                        Err(_) => warn!("ignoring non-text indexed attribute declaration"),
                    }
                }
            }
        }

        if let Some(rec) = fetch_special(kv, ATTRIBUTES_NAME)? {
            for attr in &rec.attributes {
                self.apply_attribute_flags(attr);
            }
        }

        if let Some(rec) = fetch_special(kv, OPTIONS_NAME)? {
            if let Some(attr) = rec.get(CHECK_BASE_OPTION) {
                self.check_base_on_search = attr
                    .values
                    .first()
                    .map_or(false, |v| v.eq_ignore_ascii_case(b"true"));
            }
        }

        self.loaded_generation = Some(kv.sequence_counter());
        debug!(
            indexed = self.indexed.len(),
            single_valued = self.single_valued.len(),
            case_sensitive = self.case_sensitive.len(),
            check_base_on_search = self.check_base_on_search,
            "metadata cache loaded"
        );
        Ok(())
    }

    fn apply_attribute_flags(&mut self, attr: &Attribute) {
        let target = attr.folded_name();
        for value in &attr.values {
            if value.as_slice() == FLAG_SINGLE_VALUE {
                self.single_valued.insert(target.clone());
            } else if value.as_slice() == FLAG_CASE_SENSITIVE {
                self.case_sensitive.insert(target.clone());
            } else if value.as_slice() != FLAG_NONE {
                warn!(
                    attribute = %attr.name,
                    flag = %String::from_utf8_lossy(value),
                    "ignoring unknown attribute flag"
                );
            }
        }
    }

    /// Whether the attribute is declared indexed.
    pub fn is_indexed(&self, attr: &str) -> bool {
        self.indexed.contains(&fold_attr_name(attr))
    }

    /// Whether a missing search base is an error rather than an empty
    /// result.
    pub fn check_base_on_search(&self) -> bool {
        self.check_base_on_search
    }

    fn overrides_single_valued(&self, attr: &str) -> bool {
        self.single_valued.contains(&fold_attr_name(attr))
    }

    fn overrides_case_sensitive(&self, attr: &str) -> bool {
        self.case_sensitive.contains(&fold_attr_name(attr))
    }
}

fn fetch_special(kv: &dyn KvBackend, name: &str) -> Result<Option<Record>> {
    let key = codec::key_for(&Name::new(name));
    match kv.fetch(&key).map_err(Error::from)? {
        Some(blob) => Ok(Some(codec::unpack(&blob)?)),
        None => Ok(None),
    }
}

/// The schema collaborator answer with `@ATTRIBUTES` overrides layered on
/// top, borrowed for the duration of one mutation.
pub struct SchemaView<'a> {
    cache: &'a MetaCache,
    schema: &'a dyn Schema,
}

impl<'a> SchemaView<'a> {
    /// Borrows a view over the cache and schema.
    pub fn new(cache: &'a MetaCache, schema: &'a dyn Schema) -> Self {
        Self { cache, schema }
    }

    /// Whether the attribute produces index entries.
    pub fn is_indexed(&self, attr: &str) -> bool {
        self.cache.is_indexed(attr)
    }

    /// The effective single-valued answer for one modify/add element:
    /// element override, then `@ATTRIBUTES`, then the schema.
    pub fn is_single_valued(&self, attr: &Attribute) -> bool {
        attr.flags.force_single_value
            || self.cache.overrides_single_valued(&attr.name)
            || self.schema.is_single_valued(&attr.name)
    }

    /// Value equality under the effective syntax.
    pub fn values_equal(&self, attr: &str, a: &[u8], b: &[u8]) -> bool {
        if self.cache.overrides_case_sensitive(attr) {
            a == b
        } else {
            self.schema.values_equal(attr, a, b)
        }
    }

    /// Canonical index-key form under the effective syntax.
    pub fn canonical(&self, attr: &str, value: &[u8]) -> Vec<u8> {
        if self.cache.overrides_case_sensitive(attr) {
            value.to_vec()
        } else {
            self.schema.canonical_form(attr, value)
        }
    }
}
