//! Secondary index maintenance.
//!
//! For every (indexed attribute, canonical value) pair there is one index
//! entry: a record-shaped blob under an `IDX=` key whose `@ref` attribute
//! lists the folded names of the records carrying that value. Index work
//! performed inside a transaction is buffered here and only written to the
//! file engine when the transaction prepares, so a cancel discards it
//! wholesale. Special records and undeclared attributes never produce
//! entries.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::{info, trace};

use crate::codec::{self, INDEX_KEY_PREFIX, RECORD_KEY_PREFIX};
use crate::db::cache::SchemaView;
use crate::error::{Error, Result};
use crate::model::{fold_attr_name, Attribute, Name, Record};
use crate::storage::{KvBackend, KvError, StorePolicy};

/// The attribute of an index entry listing the referencing record names.
pub const REF_ATTR: &str = "@ref";

const ENTRY_NAME: &str = "@IDX";

fn entry_key(attr: &str, canonical: &[u8]) -> Vec<u8> {
    let folded = fold_attr_name(attr);
    let mut key =
        Vec::with_capacity(INDEX_KEY_PREFIX.len() + folded.len() + 1 + canonical.len());
    key.extend_from_slice(INDEX_KEY_PREFIX);
    key.extend_from_slice(folded.as_bytes());
    key.push(b':');
    key.extend_from_slice(canonical);
    key
}

#[derive(Debug, Default)]
struct BufferedEntry {
    refs: Vec<String>,
    dirty: bool,
}

/// Keeps index entries consistent with data mutations.
///
/// All mutating methods require an open transaction; the buffer they write
/// to is flushed by [`IndexMaintainer::txn_commit`] and discarded by
/// [`IndexMaintainer::txn_cancel`].
#[derive(Debug, Default)]
pub struct IndexMaintainer {
    buffer: Option<HashMap<Vec<u8>, BufferedEntry>>,
}

impl IndexMaintainer {
    /// A maintainer with no transaction open.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins buffering index work for a new transaction.
    pub fn txn_start(&mut self) {
        self.buffer = Some(HashMap::new());
    }

    /// Discards all buffered index work.
    pub fn txn_cancel(&mut self) {
        self.buffer = None;
    }

    /// Writes every dirty buffered entry to the file engine.
    ///
    /// Entries whose reference list emptied are deleted; a reference list
    /// that was never materialized on disk deletes as a no-op.
    pub fn txn_commit(&mut self, kv: &mut dyn KvBackend) -> Result<()> {
        let Some(buffer) = self.buffer.take() else {
            return Ok(());
        };
        for (key, entry) in buffer {
            if !entry.dirty {
                continue;
            }
            if entry.refs.is_empty() {
                match kv.delete(&key) {
                    Ok(()) | Err(KvError::NotFound) => {}
                    Err(e) => return Err(e.into()),
                }
            } else {
                let record = Record::with_attributes(
                    Name::new(ENTRY_NAME),
                    vec![Attribute::new(
                        REF_ATTR,
                        entry.refs.iter().map(|r| r.clone().into_bytes()).collect(),
                    )],
                );
                kv.store(&key, &codec::pack(&record), StorePolicy::Any)
                    .map_err(Error::from)?;
            }
        }
        Ok(())
    }

    fn entry_mut(
        &mut self,
        kv: &dyn KvBackend,
        key: Vec<u8>,
    ) -> Result<&mut BufferedEntry> {
        let buffer = self
            .buffer
            .as_mut()
            .ok_or_else(|| Error::Operations("index mutation outside a transaction".into()))?;
        match buffer.entry(key) {
            Entry::Occupied(slot) => Ok(slot.into_mut()),
            Entry::Vacant(slot) => {
                let loaded = match kv.fetch(slot.key()).map_err(Error::from)? {
                    None => BufferedEntry::default(),
                    Some(blob) => BufferedEntry {
                        refs: unpack_refs(&blob)?,
                        dirty: false,
                    },
                };
                Ok(slot.insert(loaded))
            }
        }
    }

    fn add_ref(
        &mut self,
        kv: &dyn KvBackend,
        view: &SchemaView<'_>,
        name: &Name,
        attr: &str,
        value: &[u8],
    ) -> Result<()> {
        if name.is_special() || !view.is_indexed(attr) {
            return Ok(());
        }
        let key = entry_key(attr, &view.canonical(attr, value));
        let folded = name.folded();
        let entry = self.entry_mut(kv, key)?;
        if !entry.refs.iter().any(|r| r == &folded) {
            trace!(name = %folded, attr, "index add");
            entry.refs.push(folded);
            entry.dirty = true;
        }
        Ok(())
    }

    fn remove_ref(
        &mut self,
        kv: &dyn KvBackend,
        view: &SchemaView<'_>,
        name: &Name,
        attr: &str,
        value: &[u8],
    ) -> Result<()> {
        if name.is_special() || !view.is_indexed(attr) {
            return Ok(());
        }
        let key = entry_key(attr, &view.canonical(attr, value));
        let folded = name.folded();
        let entry = self.entry_mut(kv, key)?;
        let before = entry.refs.len();
        entry.refs.retain(|r| r != &folded);
        if entry.refs.len() != before {
            trace!(name = %folded, attr, "index remove");
            entry.dirty = true;
        }
        Ok(())
    }

    /// Indexes every attribute value of a newly added record.
    pub fn add_new(
        &mut self,
        kv: &dyn KvBackend,
        view: &SchemaView<'_>,
        record: &Record,
    ) -> Result<()> {
        for attr in &record.attributes {
            self.add_element(kv, view, &record.name, attr)?;
        }
        Ok(())
    }

    /// Indexes the values of one attribute element being added.
    pub fn add_element(
        &mut self,
        kv: &dyn KvBackend,
        view: &SchemaView<'_>,
        name: &Name,
        attr: &Attribute,
    ) -> Result<()> {
        for value in &attr.values {
            self.add_ref(kv, view, name, &attr.name, value)?;
        }
        Ok(())
    }

    /// Retracts the values of one attribute element being deleted.
    pub fn delete_element(
        &mut self,
        kv: &dyn KvBackend,
        view: &SchemaView<'_>,
        name: &Name,
        attr: &Attribute,
    ) -> Result<()> {
        for value in &attr.values {
            self.remove_ref(kv, view, name, &attr.name, value)?;
        }
        Ok(())
    }

    /// Retracts a single value, addressed by its position in `attr`.
    pub fn delete_value(
        &mut self,
        kv: &dyn KvBackend,
        view: &SchemaView<'_>,
        name: &Name,
        attr: &Attribute,
        value_index: usize,
    ) -> Result<()> {
        let value = attr
            .values
            .get(value_index)
            .ok_or_else(|| Error::Operations("index value position out of range".into()))?;
        self.remove_ref(kv, view, name, &attr.name, value)
    }

    /// Retracts every index entry of a record being deleted.
    pub fn delete_all(
        &mut self,
        kv: &dyn KvBackend,
        view: &SchemaView<'_>,
        record: &Record,
    ) -> Result<()> {
        for attr in &record.attributes {
            self.delete_element(kv, view, &record.name, attr)?;
        }
        Ok(())
    }

    /// Drops every index entry and rebuilds from a scan of all records.
    ///
    /// Runs inside the enclosing transaction, always from a clean slate, so
    /// re-running after a mid-reindex crash converges to the same state.
    pub fn full_reindex(
        &mut self,
        kv: &mut dyn KvBackend,
        view: &SchemaView<'_>,
    ) -> Result<()> {
        if self.buffer.is_none() {
            return Err(Error::Operations("reindex outside a transaction".into()));
        }
        self.buffer = Some(HashMap::new());

        let mut stale_keys = Vec::new();
        let mut blobs = Vec::new();
        kv.scan(&mut |key, blob| {
            if key.starts_with(INDEX_KEY_PREFIX) {
                stale_keys.push(key.to_vec());
            } else if key.starts_with(RECORD_KEY_PREFIX) {
                blobs.push(blob.to_vec());
            }
            Ok(())
        })
        .map_err(Error::from)?;

        for key in stale_keys {
            match kv.delete(&key) {
                Ok(()) | Err(KvError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        let records = blobs.len();
        for blob in blobs {
            let record = codec::unpack(&blob)?;
            self.add_new(kv, view, &record)?;
        }
        info!(records, "full reindex complete");
        Ok(())
    }

    /// The current reference list for (attribute, value), reading through
    /// the buffer when a transaction is open.
    pub fn lookup(
        &mut self,
        kv: &dyn KvBackend,
        view: &SchemaView<'_>,
        attr: &str,
        value: &[u8],
    ) -> Result<Vec<Name>> {
        let key = entry_key(attr, &view.canonical(attr, value));
        let refs = if self.buffer.is_some() {
            self.entry_mut(kv, key)?.refs.clone()
        } else {
            match kv.fetch(&key).map_err(Error::from)? {
                None => Vec::new(),
                Some(blob) => unpack_refs(&blob)?,
            }
        };
        Ok(refs.into_iter().map(Name::new).collect())
    }
}

fn unpack_refs(blob: &[u8]) -> Result<Vec<String>> {
    let record = codec::unpack(blob)?;
    record
        .get(REF_ATTR)
        .map(|attr| {
            attr.values
                .iter()
                .map(|v| {
                    String::from_utf8(v.clone())
                        .map_err(|_| Error::Operations("index reference is not valid UTF-8".into()))
                })
                .collect::<Result<Vec<_>>>()
        })
        .transpose()
        .map(Option::unwrap_or_default)
}
