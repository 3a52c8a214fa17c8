use sable::{
    Attribute, CaseFoldSchema, Error, FileKv, KvBackend, ModElement, ModOp, Name, OpenOptions,
    Record, SequenceKind, Store, StorePolicy, INDEXED_ATTR, INDEXES_NAME,
};
use tempfile::TempDir;

fn open_plain(dir: &TempDir) -> Store {
    Store::open(dir.path().join("dir.sable"), OpenOptions::fast()).expect("open")
}

// A store with `uid` single-valued (schema) and indexed (declaration laid
// down before the store opens, so the sequence number starts at zero).
fn open_directory(dir: &TempDir) -> Store {
    let mut kv = FileKv::open(&dir.path().join("dir.sable"), &OpenOptions::fast()).unwrap();
    let decl = Record::new(INDEXES_NAME).attr(Attribute::single(INDEXED_ATTR, "uid"));
    kv.store(
        &sable::codec::key_for(&decl.name),
        &sable::codec::pack(&decl),
        StorePolicy::Any,
    )
    .unwrap();
    Store::with_backend(
        Box::new(kv),
        Box::new(CaseFoldSchema::new().with_single_valued(["uid"])),
        OpenOptions::fast(),
    )
    .expect("open")
}

fn modify_one(store: &mut Store, name: &str, op: ModOp, attr: Attribute) -> sable::Result<u64> {
    store.modify(&Name::new(name), &[ModElement::new(op, attr)], false)
}

#[test]
fn add_enforces_name_uniqueness() {
    let dir = TempDir::new().unwrap();
    let mut store = open_plain(&dir);
    let rec = Record::new("cn=a").attr(Attribute::single("cn", "a"));
    store.add(&rec).unwrap();

    let again = Record::new("CN=A").attr(Attribute::single("cn", "a"));
    assert!(matches!(store.add(&again), Err(Error::EntryAlreadyExists)));

    store.delete(&Name::new("cn=a")).unwrap();
    store.add(&again).unwrap();
}

#[test]
fn single_valued_attribute_rejects_second_value() {
    let dir = TempDir::new().unwrap();
    let mut store = open_directory(&dir);
    store
        .add(&Record::new("cn=a").attr(Attribute::single("uid", "1")))
        .unwrap();

    let err = modify_one(&mut store, "cn=a", ModOp::Add, Attribute::single("uid", "2"))
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));

    // The stored record is unchanged.
    let rec = store.fetch(&Name::new("cn=a")).unwrap().unwrap();
    assert_eq!(rec.get("uid").unwrap().values, vec![b"1".to_vec()]);
}

#[test]
fn add_rejects_multi_valued_single_attribute() {
    let dir = TempDir::new().unwrap();
    let mut store = open_directory(&dir);
    let rec = Record::new("cn=a").attr(Attribute::new(
        "uid",
        vec![b"1".to_vec(), b"2".to_vec()],
    ));
    assert!(matches!(
        store.add(&rec),
        Err(Error::ConstraintViolation(_))
    ));
    assert!(store.fetch(&Name::new("cn=a")).unwrap().is_none());
}

#[test]
fn element_flags_override_the_schema() {
    let dir = TempDir::new().unwrap();
    let mut store = open_plain(&dir);
    store
        .add(&Record::new("cn=a").attr(Attribute::single("mail", "a@x")))
        .unwrap();

    // mail is multi-valued by schema; the element flag forces the check.
    let mut forced = Attribute::single("mail", "b@x");
    forced.flags.force_single_value = true;
    let err = modify_one(&mut store, "cn=a", ModOp::Add, forced).unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
}

#[test]
fn skip_flag_disables_the_single_value_check() {
    let dir = TempDir::new().unwrap();
    let mut store = open_directory(&dir);
    let mut uid = Attribute::new("uid", vec![b"1".to_vec(), b"2".to_vec()]);
    uid.flags.skip_single_value_check = true;
    store.add(&Record::new("cn=a").attr(uid)).unwrap();
    let rec = store.fetch(&Name::new("cn=a")).unwrap().unwrap();
    assert_eq!(rec.get("uid").unwrap().values.len(), 2);
}

#[test]
fn duplicate_values_error_strict_and_vanish_permissive() {
    let dir = TempDir::new().unwrap();
    let mut store = open_plain(&dir);
    store
        .add(&Record::new("cn=a").attr(Attribute::single("mail", "a@x")))
        .unwrap();

    let err = modify_one(
        &mut store,
        "cn=a",
        ModOp::Add,
        Attribute::single("mail", "A@X"),
    )
    .unwrap_err();
    assert!(matches!(err, Error::AttributeOrValueExists));

    // Permissive: the duplicate is dropped, nothing is stored twice.
    store
        .modify(
            &Name::new("cn=a"),
            &[ModElement::new(
                ModOp::Add,
                Attribute::new("mail", vec![b"A@X".to_vec(), b"b@x".to_vec()]),
            )],
            true,
        )
        .unwrap();
    let rec = store.fetch(&Name::new("cn=a")).unwrap().unwrap();
    assert_eq!(
        rec.get("mail").unwrap().values,
        vec![b"a@x".to_vec(), b"b@x".to_vec()]
    );
}

#[test]
fn delete_element_semantics() {
    let dir = TempDir::new().unwrap();
    let mut store = open_plain(&dir);
    store
        .add(
            &Record::new("cn=a")
                .attr(Attribute::new(
                    "mail",
                    vec![b"a@x".to_vec(), b"b@x".to_vec()],
                ))
                .attr(Attribute::single("cn", "a")),
        )
        .unwrap();

    // Deleting one value keeps the rest.
    modify_one(
        &mut store,
        "cn=a",
        ModOp::Delete,
        Attribute::single("mail", "A@X"),
    )
    .unwrap();
    let rec = store.fetch(&Name::new("cn=a")).unwrap().unwrap();
    assert_eq!(rec.get("mail").unwrap().values, vec![b"b@x".to_vec()]);

    // Deleting the last value removes the attribute.
    modify_one(
        &mut store,
        "cn=a",
        ModOp::Delete,
        Attribute::single("mail", "b@x"),
    )
    .unwrap();
    assert!(store
        .fetch(&Name::new("cn=a"))
        .unwrap()
        .unwrap()
        .get("mail")
        .is_none());

    // A missing attribute fails strict and passes permissive.
    let err = modify_one(
        &mut store,
        "cn=a",
        ModOp::Delete,
        Attribute::new("mail", vec![]),
    )
    .unwrap_err();
    assert!(matches!(err, Error::NoSuchAttribute));
    store
        .modify(
            &Name::new("cn=a"),
            &[ModElement::new(ModOp::Delete, Attribute::new("mail", vec![]))],
            true,
        )
        .unwrap();
}

#[test]
fn replace_with_equal_values_keeps_stored_spelling() {
    let dir = TempDir::new().unwrap();
    let mut store = open_plain(&dir);
    store
        .add(&Record::new("cn=a").attr(Attribute::single("mail", "Alice@X")))
        .unwrap();

    // Equal under the schema comparison: treated as unchanged.
    modify_one(
        &mut store,
        "cn=a",
        ModOp::Replace,
        Attribute::single("mail", "alice@x"),
    )
    .unwrap();
    let rec = store.fetch(&Name::new("cn=a")).unwrap().unwrap();
    assert_eq!(rec.get("mail").unwrap().values, vec![b"Alice@X".to_vec()]);
}

#[test]
fn replace_of_absent_attribute_with_no_values_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let mut store = open_plain(&dir);
    store
        .add(&Record::new("cn=a").attr(Attribute::single("cn", "a")))
        .unwrap();
    modify_one(
        &mut store,
        "cn=a",
        ModOp::Replace,
        Attribute::new("mail", vec![]),
    )
    .unwrap();
    assert!(store
        .fetch(&Name::new("cn=a"))
        .unwrap()
        .unwrap()
        .get("mail")
        .is_none());
}

#[test]
fn add_element_without_values_is_a_protocol_error() {
    let dir = TempDir::new().unwrap();
    let mut store = open_plain(&dir);
    store
        .add(&Record::new("cn=a").attr(Attribute::single("cn", "a")))
        .unwrap();
    let err = modify_one(&mut store, "cn=a", ModOp::Add, Attribute::new("mail", vec![]))
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

#[test]
fn modify_of_unknown_record_reports_no_such_object() {
    let dir = TempDir::new().unwrap();
    let mut store = open_plain(&dir);
    let err = modify_one(
        &mut store,
        "cn=ghost",
        ModOp::Add,
        Attribute::single("cn", "x"),
    )
    .unwrap_err();
    assert!(matches!(err, Error::NoSuchObject));
}

#[test]
fn rename_requires_the_old_name_and_a_free_new_name() {
    let dir = TempDir::new().unwrap();
    let mut store = open_plain(&dir);
    store
        .add(&Record::new("cn=a").attr(Attribute::single("cn", "a")))
        .unwrap();
    store
        .add(&Record::new("cn=b").attr(Attribute::single("cn", "b")))
        .unwrap();

    assert!(matches!(
        store.rename(&Name::new("cn=ghost"), &Name::new("cn=c")),
        Err(Error::NoSuchObject)
    ));
    assert!(matches!(
        store.rename(&Name::new("cn=a"), &Name::new("CN=B")),
        Err(Error::EntryAlreadyExists)
    ));

    store.rename(&Name::new("cn=a"), &Name::new("cn=c")).unwrap();
    assert!(store.fetch(&Name::new("cn=a")).unwrap().is_none());
    let moved = store.fetch(&Name::new("cn=c")).unwrap().unwrap();
    assert_eq!(moved.get("cn").unwrap().values, vec![b"a".to_vec()]);
}

#[test]
fn read_only_stores_reject_mutations() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open_plain(&dir);
        store
            .add(&Record::new("cn=a").attr(Attribute::single("cn", "a")))
            .unwrap();
    }
    let mut store = Store::open(
        dir.path().join("dir.sable"),
        OpenOptions::fast().read_only(),
    )
    .unwrap();
    assert!(store.fetch(&Name::new("cn=a")).unwrap().is_some());
    assert!(matches!(
        store.add(&Record::new("cn=b")),
        Err(Error::InsufficientAccessRights)
    ));
    assert!(matches!(
        store.delete(&Name::new("cn=a")),
        Err(Error::InsufficientAccessRights)
    ));
}

#[test]
fn empty_names_are_rejected() {
    let dir = TempDir::new().unwrap();
    let mut store = open_plain(&dir);
    assert!(matches!(
        store.add(&Record::new("")),
        Err(Error::InvalidAttributeSyntax(_))
    ));
}

#[test]
fn sequence_kinds_agree() {
    let dir = TempDir::new().unwrap();
    let mut store = open_plain(&dir);
    assert_eq!(
        store.sequence_number(SequenceKind::HighestCommitted).unwrap(),
        0
    );
    assert_eq!(store.sequence_number(SequenceKind::Next).unwrap(), 1);
    assert_eq!(
        store
            .sequence_number(SequenceKind::HighestTimestamp)
            .unwrap(),
        0
    );

    store
        .add(&Record::new("cn=a").attr(Attribute::single("cn", "a")))
        .unwrap();
    let highest = store.sequence_number(SequenceKind::HighestCommitted).unwrap();
    assert_eq!(highest, 1);
    assert_eq!(store.sequence_number(SequenceKind::Next).unwrap(), 2);
    assert!(store.sequence_number(SequenceKind::HighestTimestamp).unwrap() > 0);
}

#[test]
fn scenario_end_to_end() {
    let dir = TempDir::new().unwrap();
    let mut store = open_directory(&dir);

    // Add cn=a with single-valued uid=1.
    let seq = store
        .add(&Record::new("cn=a").attr(Attribute::single("uid", "1")))
        .unwrap();
    assert_eq!(seq, 1);

    // A second add of the same name fails and leaves the sequence alone.
    assert!(matches!(
        store.add(&Record::new("cn=a")),
        Err(Error::EntryAlreadyExists)
    ));
    assert_eq!(
        store.sequence_number(SequenceKind::HighestCommitted).unwrap(),
        1
    );

    // Replace uid with 2: sequence 2, index moves from 1 to 2.
    let seq = modify_one(&mut store, "cn=a", ModOp::Replace, Attribute::single("uid", "2"))
        .unwrap();
    assert_eq!(seq, 2);
    assert!(store.lookup_index("uid", b"1").unwrap().is_empty());
    assert_eq!(
        store.lookup_index("uid", b"2").unwrap(),
        vec![Name::new("cn=a")]
    );

    // Deleting a never-set attribute without the permissive modifier fails.
    let err = modify_one(
        &mut store,
        "cn=a",
        ModOp::Delete,
        Attribute::new("mail", vec![]),
    )
    .unwrap_err();
    assert!(matches!(err, Error::NoSuchAttribute));

    // Rename cn=a to cn=b: old key gone, content identical, sequence 3.
    let seq = store.rename(&Name::new("cn=a"), &Name::new("cn=b")).unwrap();
    assert_eq!(seq, 3);
    assert!(store.fetch(&Name::new("cn=a")).unwrap().is_none());
    let moved = store.fetch(&Name::new("cn=b")).unwrap().unwrap();
    assert_eq!(moved.get("uid").unwrap().values, vec![b"2".to_vec()]);
}
