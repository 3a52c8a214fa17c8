//! The mutation engine and synchronous store core.
//!
//! [`Store`] owns the file engine, the schema collaborator, the index
//! maintainer, the transaction coordinator, and the metadata cache, and
//! implements the add / modify / delete / rename / search / sequence
//! operations over them. Every mutation runs inside one coordinated
//! transaction: a failure at any step cancels the transaction and leaves
//! no partial effect; success bumps the sequence number unless the
//! mutated record is the `@META` metadata record itself.
//!
//! Writes to declaration special records run post-write hooks from an
//! explicit table: `@INDEXES` and `@ATTRIBUTES` trigger a full reindex,
//! `@OPTIONS` reloads the metadata cache.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, trace};

use crate::codec::{self, RECORD_KEY_PREFIX};
use crate::config::OpenOptions;
use crate::db::cache::{
    MetaCache, SchemaView, ATTRIBUTES_NAME, INDEXES_NAME, META_NAME, OPTIONS_NAME, SEQUENCE_ATTR,
    WHEN_CHANGED_ATTR,
};
use crate::db::constraint;
use crate::db::index::IndexMaintainer;
use crate::db::txn::TxnCoordinator;
use crate::error::{Error, Result};
use crate::model::{
    Filter, ModElement, ModOp, Name, Record, Scope, SequenceKind,
};
use crate::schema::{CaseFoldSchema, Schema};
use crate::storage::{FileKv, KvBackend, KvError, StorePolicy};

#[derive(Debug, Clone, Copy)]
enum Hook {
    Reindex,
    ReloadCache,
}

// Post-write side effects of the declaration records, keyed by reserved
// name. Names compare exactly; special names are case-sensitive.
const SPECIAL_HOOKS: &[(&str, Hook)] = &[
    (INDEXES_NAME, Hook::Reindex),
    (ATTRIBUTES_NAME, Hook::Reindex),
    (OPTIONS_NAME, Hook::ReloadCache),
];

/// The synchronous store core.
///
/// Single-threaded by design: exactly one operation body runs at a time.
/// The asynchronous request interface in [`crate::db::Database`] drives
/// this type from a cooperative event loop; embedders with their own loop
/// can call it directly.
pub struct Store {
    kv: Box<dyn KvBackend>,
    schema: Box<dyn Schema>,
    index: IndexMaintainer,
    txn: TxnCoordinator,
    cache: MetaCache,
    options: OpenOptions,
}

impl Store {
    /// Opens a store over the bundled single-file engine with the default
    /// case-insensitive schema.
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let kv = FileKv::open(path.as_ref(), &options).map_err(Error::from)?;
        Self::with_backend(Box::new(kv), Box::new(CaseFoldSchema::new()), options)
    }

    /// Opens a store over a caller-supplied file engine and schema.
    pub fn with_backend(
        kv: Box<dyn KvBackend>,
        schema: Box<dyn Schema>,
        options: OpenOptions,
    ) -> Result<Self> {
        let mut store = Self {
            kv,
            schema,
            index: IndexMaintainer::new(),
            txn: TxnCoordinator::new(),
            cache: MetaCache::new(),
            options,
        };
        store.cache.reload(store.kv.as_ref())?;
        info!(read_only = store.options.read_only, "store opened");
        Ok(store)
    }

    /// Adds a new record. Fails with [`Error::EntryAlreadyExists`] if the
    /// name is taken, or with a constraint error from the checks in
    /// [`crate::db::constraint`]. Returns the sequence number after the
    /// mutation.
    pub fn add(&mut self, record: &Record) -> Result<u64> {
        self.ensure_writable()?;
        validate_record(record)?;
        self.run_in_txn(|s| s.add_inner(record, true))
    }

    /// Applies modify elements to an existing record. Fails with
    /// [`Error::NoSuchObject`] if the name is unknown. `permissive`
    /// downgrades duplicate-value and missing-attribute errors to silent
    /// no-ops. Returns the sequence number after the mutation.
    pub fn modify(
        &mut self,
        name: &Name,
        elements: &[ModElement],
        permissive: bool,
    ) -> Result<u64> {
        self.ensure_writable()?;
        self.run_in_txn(|s| s.modify_inner(name, elements, permissive))
    }

    /// Deletes a record and retracts its index entries. Returns the
    /// sequence number after the mutation.
    pub fn delete(&mut self, name: &Name) -> Result<u64> {
        self.ensure_writable()?;
        self.run_in_txn(|s| s.delete_inner(name, true))
    }

    /// Moves a record to a new name, atomically, bumping the sequence
    /// number exactly once.
    pub fn rename(&mut self, old: &Name, new: &Name) -> Result<u64> {
        self.ensure_writable()?;
        if new.as_str().is_empty() {
            return Err(Error::InvalidAttributeSyntax("empty record name".into()));
        }
        self.run_in_txn(|s| s.rename_inner(old, new))
    }

    /// Finds records under `base` at the given scope, optionally filtered
    /// by one attribute equality. The filter is answered from the index
    /// when its attribute is declared indexed, by a full scan otherwise.
    /// Special records never appear in one-level or subtree results.
    pub fn search(
        &mut self,
        base: &Name,
        scope: Scope,
        filter: Option<&Filter>,
    ) -> Result<Vec<Record>> {
        self.cache.ensure_current(self.kv.as_ref())?;
        match scope {
            Scope::Base => match self.fetch(base)? {
                Some(record) => {
                    let view = SchemaView::new(&self.cache, self.schema.as_ref());
                    if filter.map_or(true, |f| record_matches(&record, f, &view)) {
                        Ok(vec![record])
                    } else {
                        Ok(Vec::new())
                    }
                }
                None => {
                    if self.cache.check_base_on_search() {
                        Err(Error::NoSuchObject)
                    } else {
                        Ok(Vec::new())
                    }
                }
            },
            Scope::OneLevel | Scope::Subtree => {
                if self.cache.check_base_on_search()
                    && !base.as_str().is_empty()
                    && self.fetch(base)?.is_none()
                {
                    return Err(Error::NoSuchObject);
                }
                let candidates = self.search_candidates(filter)?;
                let view = SchemaView::new(&self.cache, self.schema.as_ref());
                Ok(candidates
                    .into_iter()
                    .filter(|r| {
                        let in_scope = match scope {
                            Scope::OneLevel => r.name.is_child_of(base),
                            _ => {
                                r.name.is_descendant_of(base)
                                    || (!base.as_str().is_empty() && r.name == *base)
                            }
                        };
                        in_scope && filter.map_or(true, |f| record_matches(r, f, &view))
                    })
                    .collect())
            }
        }
    }

    /// Reads the record stored under `name`, if any.
    pub fn fetch(&self, name: &Name) -> Result<Option<Record>> {
        let key = codec::key_for(name);
        match self.kv.fetch(&key).map_err(Error::from)? {
            Some(blob) => Ok(Some(codec::unpack(&blob)?)),
            None => Ok(None),
        }
    }

    /// Answers a sequence-number query from the `@META` record.
    pub fn sequence_number(&self, kind: SequenceKind) -> Result<u64> {
        let (sequence, timestamp) = self.read_meta()?;
        Ok(match kind {
            SequenceKind::HighestCommitted => sequence,
            SequenceKind::Next => sequence + 1,
            SequenceKind::HighestTimestamp => {
                timestamp.map_or(0, |t| t.timestamp().max(0) as u64)
            }
        })
    }

    /// The names currently referenced by the (attribute, value) index
    /// entry. Empty when the attribute is not indexed or the value unseen.
    pub fn lookup_index(&mut self, attr: &str, value: &[u8]) -> Result<Vec<Name>> {
        self.cache.ensure_current(self.kv.as_ref())?;
        let view = SchemaView::new(&self.cache, self.schema.as_ref());
        self.index.lookup(self.kv.as_ref(), &view, attr, value)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.options.read_only {
            return Err(Error::InsufficientAccessRights);
        }
        Ok(())
    }

    fn run_in_txn<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.txn.start(self.kv.as_mut(), &mut self.index)?;
        match f(&mut *self) {
            Ok(value) => {
                self.txn.commit(self.kv.as_mut(), &mut self.index)?;
                Ok(value)
            }
            Err(e) => {
                self.txn.cancel(self.kv.as_mut(), &mut self.index);
                Err(e)
            }
        }
    }

    fn add_inner(&mut self, record: &Record, bump: bool) -> Result<u64> {
        self.cache.ensure_current(self.kv.as_ref())?;
        let mut rec = record.clone();
        {
            let view = SchemaView::new(&self.cache, self.schema.as_ref());
            for attr in &mut rec.attributes {
                constraint::check_no_duplicates(None, attr, false, &view)?;
                let single =
                    !attr.flags.skip_single_value_check && view.is_single_valued(attr);
                constraint::check_single_valued(None, attr, single)?;
            }
        }
        let key = codec::key_for(&rec.name);
        match self.kv.store(&key, &codec::pack(&rec), StorePolicy::MustNotExist) {
            Ok(()) => {}
            Err(KvError::Exists) => return Err(Error::EntryAlreadyExists),
            Err(e) => return Err(e.into()),
        }
        {
            let view = SchemaView::new(&self.cache, self.schema.as_ref());
            self.index.add_new(self.kv.as_ref(), &view, &rec)?;
        }
        self.run_hooks(&rec.name)?;
        debug!(name = %rec.name, "record added");
        if bump {
            self.bump_sequence(&rec.name)
        } else {
            self.current_sequence()
        }
    }

    fn modify_inner(
        &mut self,
        name: &Name,
        elements: &[ModElement],
        permissive: bool,
    ) -> Result<u64> {
        self.cache.ensure_current(self.kv.as_ref())?;
        let mut record = self.fetch(name)?.ok_or(Error::NoSuchObject)?;
        for element in elements {
            if element.attribute.name.is_empty() {
                return Err(Error::InvalidAttributeSyntax("empty attribute name".into()));
            }
            match element.op {
                ModOp::Add => self.apply_add(&mut record, element, permissive)?,
                ModOp::Replace => self.apply_replace(&mut record, element, permissive)?,
                ModOp::Delete => self.apply_delete(&mut record, element, permissive)?,
            }
        }
        let key = codec::key_for(&record.name);
        match self.kv.store(&key, &codec::pack(&record), StorePolicy::MustExist) {
            Ok(()) => {}
            Err(KvError::NotFound) => return Err(Error::NoSuchObject),
            Err(e) => return Err(e.into()),
        }
        self.run_hooks(&record.name)?;
        debug!(name = %record.name, elements = elements.len(), "record modified");
        self.bump_sequence(&record.name)
    }

    fn apply_add(
        &mut self,
        record: &mut Record,
        element: &ModElement,
        permissive: bool,
    ) -> Result<()> {
        if element.attribute.values.is_empty() {
            return Err(Error::Protocol("add element without values".into()));
        }
        let folded = element.attribute.folded_name();
        let mut incoming = element.attribute.clone();
        let pos = record.position(&folded);
        {
            let view = SchemaView::new(&self.cache, self.schema.as_ref());
            let existing = pos.map(|i| &record.attributes[i]);
            constraint::check_no_duplicates(existing, &mut incoming, permissive, &view)?;
            let single =
                !incoming.flags.skip_single_value_check && view.is_single_valued(&incoming);
            constraint::check_single_valued(existing, &incoming, single)?;
            if incoming.values.is_empty() {
                // Every value was a permissive-suppressed duplicate.
                return Ok(());
            }
            self.index
                .add_element(self.kv.as_ref(), &view, &record.name, &incoming)?;
        }
        match pos {
            Some(i) => record.attributes[i].values.extend(incoming.values),
            None => record.attributes.push(incoming),
        }
        Ok(())
    }

    fn apply_replace(
        &mut self,
        record: &mut Record,
        element: &ModElement,
        permissive: bool,
    ) -> Result<()> {
        let folded = element.attribute.folded_name();
        let mut incoming = element.attribute.clone();
        let pos = record.position(&folded);
        let view = SchemaView::new(&self.cache, self.schema.as_ref());
        constraint::check_no_duplicates(None, &mut incoming, permissive, &view)?;
        let single = !incoming.flags.skip_single_value_check && view.is_single_valued(&incoming);
        constraint::check_single_valued(None, &incoming, single)?;
        match pos {
            Some(i) => {
                // Value-set equality uses the schema comparison, so a
                // replace that spells the same values differently is a
                // data rewrite but not index work.
                let unchanged = {
                    let old = &record.attributes[i];
                    old.values.len() == incoming.values.len()
                        && old
                            .values
                            .iter()
                            .zip(&incoming.values)
                            .all(|(a, b)| view.values_equal(&incoming.name, a, b))
                };
                if unchanged {
                    return Ok(());
                }
                let old = record.attributes.remove(i);
                self.index
                    .delete_element(self.kv.as_ref(), &view, &record.name, &old)?;
                if !incoming.values.is_empty() {
                    self.index
                        .add_element(self.kv.as_ref(), &view, &record.name, &incoming)?;
                    record.attributes.insert(i, incoming);
                }
            }
            None => {
                if !incoming.values.is_empty() {
                    self.index
                        .add_element(self.kv.as_ref(), &view, &record.name, &incoming)?;
                    record.attributes.push(incoming);
                }
            }
        }
        Ok(())
    }

    fn apply_delete(
        &mut self,
        record: &mut Record,
        element: &ModElement,
        permissive: bool,
    ) -> Result<()> {
        let folded = element.attribute.folded_name();
        let Some(i) = record.position(&folded) else {
            if permissive {
                return Ok(());
            }
            return Err(Error::NoSuchAttribute);
        };
        let view = SchemaView::new(&self.cache, self.schema.as_ref());
        if element.attribute.values.is_empty() {
            let old = record.attributes.remove(i);
            self.index
                .delete_element(self.kv.as_ref(), &view, &record.name, &old)?;
            return Ok(());
        }
        for value in &element.attribute.values {
            let found = record.attributes[i]
                .values
                .iter()
                .position(|v| view.values_equal(&element.attribute.name, v, value));
            match found {
                Some(vi) => {
                    self.index.delete_value(
                        self.kv.as_ref(),
                        &view,
                        &record.name,
                        &record.attributes[i],
                        vi,
                    )?;
                    record.attributes[i].values.remove(vi);
                }
                None => {
                    if !permissive {
                        return Err(Error::NoSuchAttribute);
                    }
                }
            }
        }
        if record.attributes[i].values.is_empty() {
            record.attributes.remove(i);
        }
        Ok(())
    }

    fn delete_inner(&mut self, name: &Name, bump: bool) -> Result<u64> {
        self.cache.ensure_current(self.kv.as_ref())?;
        let record = self.fetch(name)?.ok_or(Error::NoSuchObject)?;
        let key = codec::key_for(&record.name);
        match self.kv.delete(&key) {
            Ok(()) => {}
            Err(KvError::NotFound) => return Err(Error::NoSuchObject),
            Err(e) => return Err(e.into()),
        }
        {
            let view = SchemaView::new(&self.cache, self.schema.as_ref());
            self.index.delete_all(self.kv.as_ref(), &view, &record)?;
        }
        self.run_hooks(&record.name)?;
        debug!(name = %record.name, "record deleted");
        if bump {
            self.bump_sequence(&record.name)
        } else {
            self.current_sequence()
        }
    }

    fn rename_inner(&mut self, old: &Name, new: &Name) -> Result<u64> {
        self.cache.ensure_current(self.kv.as_ref())?;
        let existing = self.fetch(old)?.ok_or(Error::NoSuchObject)?;
        let renamed = Record::with_attributes(new.clone(), existing.attributes);
        self.delete_inner(old, false)?;
        self.add_inner(&renamed, false)?;
        debug!(old = %old, new = %new, "record renamed");
        self.bump_sequence(new)
    }

    fn search_candidates(&mut self, filter: Option<&Filter>) -> Result<Vec<Record>> {
        if let Some(f) = filter {
            if self.cache.is_indexed(&f.attribute) {
                let names = {
                    let view = SchemaView::new(&self.cache, self.schema.as_ref());
                    self.index
                        .lookup(self.kv.as_ref(), &view, &f.attribute, &f.value)?
                };
                let mut out = Vec::with_capacity(names.len());
                for name in names {
                    if let Some(record) = self.fetch(&name)? {
                        out.push(record);
                    }
                }
                return Ok(out);
            }
        }
        let mut blobs = Vec::new();
        self.kv
            .scan(&mut |key, blob| {
                if key.starts_with(RECORD_KEY_PREFIX) {
                    blobs.push(blob.to_vec());
                }
                Ok(())
            })
            .map_err(Error::from)?;
        blobs.iter().map(|b| codec::unpack(b)).collect()
    }

    fn run_hooks(&mut self, name: &Name) -> Result<()> {
        let Some((_, hook)) = SPECIAL_HOOKS.iter().find(|(n, _)| *n == name.as_str()) else {
            return Ok(());
        };
        match hook {
            Hook::Reindex => {
                info!(trigger = %name, "declaration changed; reindexing");
                self.cache.reload(self.kv.as_ref())?;
                let view = SchemaView::new(&self.cache, self.schema.as_ref());
                self.index.full_reindex(self.kv.as_mut(), &view)
            }
            Hook::ReloadCache => {
                info!(trigger = %name, "options changed; reloading cache");
                self.cache.reload(self.kv.as_ref())
            }
        }
    }

    fn current_sequence(&self) -> Result<u64> {
        Ok(self.read_meta()?.0)
    }

    // The metadata record is written directly, outside the normal add or
    // modify paths, so advancing the sequence cannot recurse into another
    // bump.
    fn bump_sequence(&mut self, changed: &Name) -> Result<u64> {
        if changed.as_str() == META_NAME {
            return self.current_sequence();
        }
        let (sequence, _) = self.read_meta()?;
        let next = sequence + 1;
        let meta = Record::new(META_NAME)
            .attr(crate::model::Attribute::single(
                SEQUENCE_ATTR,
                next.to_string(),
            ))
            .attr(crate::model::Attribute::single(
                WHEN_CHANGED_ATTR,
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        self.kv
            .store(&codec::key_for(&meta.name), &codec::pack(&meta), StorePolicy::Any)
            .map_err(Error::from)?;
        trace!(sequence = next, "sequence advanced");
        Ok(next)
    }

    fn read_meta(&self) -> Result<(u64, Option<DateTime<Utc>>)> {
        let key = codec::key_for(&Name::new(META_NAME));
        let Some(blob) = self.kv.fetch(&key).map_err(Error::from)? else {
            return Ok((0, None));
        };
        let record = codec::unpack(&blob)?;
        let sequence = record
            .get(SEQUENCE_ATTR)
            .and_then(|a| a.values.first())
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let timestamp = record
            .get(WHEN_CHANGED_ATTR)
            .and_then(|a| a.values.first())
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        Ok((sequence, timestamp))
    }
}

fn record_matches(record: &Record, filter: &Filter, view: &SchemaView<'_>) -> bool {
    record.get(&filter.attribute).map_or(false, |attr| {
        attr.values
            .iter()
            .any(|v| view.values_equal(&filter.attribute, v, &filter.value))
    })
}

fn validate_record(record: &Record) -> Result<()> {
    if record.name.as_str().is_empty() {
        return Err(Error::InvalidAttributeSyntax("empty record name".into()));
    }
    for attr in &record.attributes {
        if attr.name.is_empty() {
            return Err(Error::InvalidAttributeSyntax("empty attribute name".into()));
        }
    }
    Ok(())
}
