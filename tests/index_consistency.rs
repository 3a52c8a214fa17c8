use sable::{
    Attribute, Error, Filter, ModElement, ModOp, Name, OpenOptions, Record, Scope, Store,
    ATTRIBUTES_NAME, CHECK_BASE_OPTION, INDEXED_ATTR, INDEXES_NAME, OPTIONS_NAME,
};
use tempfile::TempDir;

fn open_indexed(dir: &TempDir, attrs: &[&str]) -> Store {
    let mut store = Store::open(dir.path().join("dir.sable"), OpenOptions::fast()).unwrap();
    store
        .add(&Record::new(INDEXES_NAME).attr(Attribute::new(
            INDEXED_ATTR,
            attrs.iter().map(|a| a.as_bytes().to_vec()).collect(),
        )))
        .unwrap();
    store
}

fn names(mut found: Vec<Name>) -> Vec<String> {
    let mut out: Vec<String> = found.drain(..).map(|n| n.folded()).collect();
    out.sort();
    out
}

#[test]
fn index_follows_add_modify_delete_rename() {
    let dir = TempDir::new().unwrap();
    let mut store = open_indexed(&dir, &["uid"]);

    store
        .add(&Record::new("cn=a").attr(Attribute::single("uid", "1")))
        .unwrap();
    store
        .add(&Record::new("cn=b").attr(Attribute::single("uid", "1")))
        .unwrap();
    assert_eq!(
        names(store.lookup_index("uid", b"1").unwrap()),
        vec!["cn=a".to_string(), "cn=b".to_string()]
    );

    // Modify-add grows the entry for the new value.
    store
        .modify(
            &Name::new("cn=a"),
            &[ModElement::new(ModOp::Add, Attribute::single("uid", "2"))],
            false,
        )
        .unwrap();
    assert_eq!(names(store.lookup_index("uid", b"2").unwrap()), vec!["cn=a"]);

    // Deleting one value retracts only that reference.
    store
        .modify(
            &Name::new("cn=a"),
            &[ModElement::new(ModOp::Delete, Attribute::single("uid", "1"))],
            false,
        )
        .unwrap();
    assert_eq!(names(store.lookup_index("uid", b"1").unwrap()), vec!["cn=b"]);

    // Rename moves the references.
    store.rename(&Name::new("cn=a"), &Name::new("cn=z")).unwrap();
    assert_eq!(names(store.lookup_index("uid", b"2").unwrap()), vec!["cn=z"]);

    // Delete retracts everything the record carried.
    store.delete(&Name::new("cn=b")).unwrap();
    assert!(store.lookup_index("uid", b"1").unwrap().is_empty());
}

#[test]
fn index_entries_fold_values() {
    let dir = TempDir::new().unwrap();
    let mut store = open_indexed(&dir, &["uid"]);
    store
        .add(&Record::new("cn=a").attr(Attribute::single("uid", "Foo")))
        .unwrap();
    assert_eq!(names(store.lookup_index("uid", b"foo").unwrap()), vec!["cn=a"]);
    assert_eq!(names(store.lookup_index("uid", b"FOO").unwrap()), vec!["cn=a"]);
}

#[test]
fn unindexed_attributes_produce_no_entries() {
    let dir = TempDir::new().unwrap();
    let mut store = open_indexed(&dir, &["uid"]);
    store
        .add(&Record::new("cn=a").attr(Attribute::single("mail", "a@x")))
        .unwrap();
    assert!(store.lookup_index("mail", b"a@x").unwrap().is_empty());
}

#[test]
fn changing_the_declaration_reindexes_everything() {
    let dir = TempDir::new().unwrap();
    let mut store = open_indexed(&dir, &["uid"]);
    store
        .add(
            &Record::new("cn=a")
                .attr(Attribute::single("uid", "1"))
                .attr(Attribute::single("mail", "a@x")),
        )
        .unwrap();
    assert_eq!(names(store.lookup_index("uid", b"1").unwrap()), vec!["cn=a"]);
    assert!(store.lookup_index("mail", b"a@x").unwrap().is_empty());

    // Swap the declaration from uid to mail; the reindex hook rebuilds.
    store
        .modify(
            &Name::new(INDEXES_NAME),
            &[ModElement::new(
                ModOp::Replace,
                Attribute::single(INDEXED_ATTR, "mail"),
            )],
            false,
        )
        .unwrap();
    assert!(store.lookup_index("uid", b"1").unwrap().is_empty());
    assert_eq!(
        names(store.lookup_index("mail", b"a@x").unwrap()),
        vec!["cn=a"]
    );
}

#[test]
fn deleting_the_declaration_drops_all_entries() {
    let dir = TempDir::new().unwrap();
    let mut store = open_indexed(&dir, &["uid"]);
    store
        .add(&Record::new("cn=a").attr(Attribute::single("uid", "1")))
        .unwrap();
    store.delete(&Name::new(INDEXES_NAME)).unwrap();
    assert!(store.lookup_index("uid", b"1").unwrap().is_empty());
}

#[test]
fn attribute_overrides_apply_after_declaration_write() {
    let dir = TempDir::new().unwrap();
    let mut store = Store::open(dir.path().join("dir.sable"), OpenOptions::fast()).unwrap();
    store
        .add(&Record::new(ATTRIBUTES_NAME).attr(Attribute::single("uid", "SINGLE-VALUE")))
        .unwrap();

    let rec = Record::new("cn=a").attr(Attribute::new(
        "uid",
        vec![b"1".to_vec(), b"2".to_vec()],
    ));
    assert!(matches!(
        store.add(&rec),
        Err(Error::ConstraintViolation(_))
    ));
}

#[test]
fn options_record_controls_missing_base_behavior() {
    let dir = TempDir::new().unwrap();
    let mut store = Store::open(dir.path().join("dir.sable"), OpenOptions::fast()).unwrap();

    assert!(store
        .search(&Name::new("ou=ghost"), Scope::Base, None)
        .unwrap()
        .is_empty());

    store
        .add(&Record::new(OPTIONS_NAME).attr(Attribute::single(CHECK_BASE_OPTION, "true")))
        .unwrap();
    assert!(matches!(
        store.search(&Name::new("ou=ghost"), Scope::Base, None),
        Err(Error::NoSuchObject)
    ));
}

#[test]
fn index_stays_consistent_under_random_interleavings() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    let dir = TempDir::new().unwrap();
    let mut store = open_indexed(&dir, &["uid"]);
    let mut rng = StdRng::seed_from_u64(0x5ab1e);

    // Model: name -> uid value, mirrored through adds, deletes, replaces,
    // and renames over a small name pool.
    let pool: Vec<String> = (0..8).map(|i| format!("cn={i}")).collect();
    let mut model: HashMap<String, String> = HashMap::new();

    for _ in 0..200 {
        let name = pool[rng.gen_range(0..pool.len())].clone();
        let uid = format!("{}", rng.gen_range(0..4));
        match rng.gen_range(0..4) {
            0 => {
                if !model.contains_key(&name) {
                    store
                        .add(&Record::new(name.as_str()).attr(Attribute::single("uid", uid.as_str())))
                        .unwrap();
                    model.insert(name, uid);
                }
            }
            1 => {
                if model.remove(&name).is_some() {
                    store.delete(&Name::new(name.as_str())).unwrap();
                }
            }
            2 => {
                if model.contains_key(&name) {
                    store
                        .modify(
                            &Name::new(name.as_str()),
                            &[ModElement::new(
                                ModOp::Replace,
                                Attribute::single("uid", uid.as_str()),
                            )],
                            false,
                        )
                        .unwrap();
                    model.insert(name, uid);
                }
            }
            _ => {
                let target = pool[rng.gen_range(0..pool.len())].clone();
                if model.contains_key(&name) && !model.contains_key(&target) && name != target {
                    store
                        .rename(&Name::new(name.as_str()), &Name::new(target.as_str()))
                        .unwrap();
                    let uid = model.remove(&name).unwrap();
                    model.insert(target, uid);
                }
            }
        }
    }

    for value in ["0", "1", "2", "3"] {
        let mut expected: Vec<String> = model
            .iter()
            .filter(|(_, uid)| uid.as_str() == value)
            .map(|(name, _)| name.clone())
            .collect();
        expected.sort();
        assert_eq!(
            names(store.lookup_index("uid", value.as_bytes()).unwrap()),
            expected,
            "index for uid={value} diverged from the live records"
        );
    }
}

#[test]
fn filtered_search_uses_the_index_and_agrees_with_scans() {
    let dir = TempDir::new().unwrap();
    let mut store = open_indexed(&dir, &["uid"]);
    store
        .add(
            &Record::new("cn=a,ou=people")
                .attr(Attribute::single("uid", "1"))
                .attr(Attribute::single("mail", "a@x")),
        )
        .unwrap();
    store
        .add(
            &Record::new("cn=b,ou=people")
                .attr(Attribute::single("uid", "2"))
                .attr(Attribute::single("mail", "a@x")),
        )
        .unwrap();
    store
        .add(&Record::new("cn=c,ou=other").attr(Attribute::single("uid", "1")))
        .unwrap();

    // Indexed filter.
    let hits = store
        .search(
            &Name::new("ou=people"),
            Scope::Subtree,
            Some(&Filter::equals("uid", "1")),
        )
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name, Name::new("cn=a,ou=people"));

    // Unindexed filter falls back to a scan and agrees.
    let hits = store
        .search(
            &Name::new("ou=people"),
            Scope::Subtree,
            Some(&Filter::equals("mail", "A@X")),
        )
        .unwrap();
    assert_eq!(hits.len(), 2);

    // One-level scoping sees children only.
    let hits = store
        .search(&Name::new("ou=people"), Scope::OneLevel, None)
        .unwrap();
    assert_eq!(hits.len(), 2);

    // Special records never surface in subtree scans.
    let all = store.search(&Name::new(""), Scope::Subtree, None).unwrap();
    assert!(all.iter().all(|r| !r.name.is_special()));
    assert_eq!(all.len(), 3);
}
