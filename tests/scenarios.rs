//! End-to-end scenarios exercising the database through its public API
//! exactly as an embedding application would: open, elect a root, checkout,
//! commit, and observe conflicts across threads and across independent
//! `Database` instances sharing one file.

use std::sync::{Arc, Barrier};
use std::thread;

use pretty_assertions::assert_eq;

use podb::database::Database;
use podb::error::Error;
use podb::object::{ConflictResolver, ResolveError};
use podb::value::{AttrMap, Value};

fn open_temp() -> (tempfile::TempDir, Arc<Database>) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("test.podb")).unwrap();
    (dir, db)
}

#[test]
fn birth_then_commit() {
    let (_dir, db) = open_temp();

    let mut attrs = AttrMap::new();
    attrs.insert("name".to_string(), Value::Str("John".to_string()));
    let obj = db.new_object(attrs);
    db.elect(&obj);
    db.commit().unwrap();

    assert_eq!(db.len(), 1);
    assert_eq!(obj.oid().unwrap().value(), 0);
    assert_eq!(db.tx_count(), 1);
}

#[test]
fn cross_instance_visibility() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.podb");

    let a = Database::open(&path).unwrap();
    let root = a.new_object(AttrMap::new());
    root.set("name".to_string(), Value::Str("James".to_string())).unwrap();
    a.elect(&root);
    a.commit().unwrap();

    let b = Database::open(&path).unwrap();
    let b_root = b.root().unwrap();
    assert_eq!(b_root.get("name").unwrap(), Some(Value::Str("James".to_string())));
    assert_eq!(a.tx_count() - b.tx_count(), 0);

    a.checkout(&root).unwrap();
    root.set("name".to_string(), Value::Str("Jane".to_string())).unwrap();
    a.commit().unwrap();

    assert_eq!(a.tx_count() - b.tx_count(), 1);
    b.begin().unwrap();
    assert_eq!(a.tx_count() - b.tx_count(), 0);
    assert_eq!(b_root.get("name").unwrap(), Some(Value::Str("Jane".to_string())));
}

#[test]
fn write_conflict_first_committer_wins() {
    let (_dir, db) = open_temp();
    let root = db.new_object(AttrMap::new());
    db.elect(&root);
    db.commit().unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let db_a = db.clone();
    let root_a = root.clone();
    let barrier_a = barrier.clone();
    let first = thread::spawn(move || {
        db_a.checkout(&root_a).unwrap();
        root_a.set("name".to_string(), Value::Str("alice".to_string())).unwrap();
        barrier_a.wait();
        let result = db_a.commit();
        barrier_a.wait();
        result
    });

    let db_b = db.clone();
    let root_b = root.clone();
    let barrier_b = barrier.clone();
    let second = thread::spawn(move || {
        db_b.checkout(&root_b).unwrap();
        root_b.set("name".to_string(), Value::Str("bob".to_string())).unwrap();
        barrier_b.wait();
        barrier_b.wait();
        let result = db_b.commit();
        if result.is_err() {
            db_b.abort();
        }
        result
    });

    let first_result = first.join().unwrap();
    let second_result = second.join().unwrap();

    assert!(first_result.is_ok());
    assert!(matches!(second_result, Err(Error::WriteConflict(_))));
    assert_eq!(db.tx_count(), 3);
    assert_eq!(root.get("name").unwrap(), Some(Value::Str("alice".to_string())));
}

struct SummingResolver;

impl ConflictResolver for SummingResolver {
    fn resolve_conflict(&self, old: &AttrMap, mine: &AttrMap, theirs: &AttrMap) -> Result<AttrMap, ResolveError> {
        let base = match old.get("count") {
            Some(Value::Int(n)) => *n,
            _ => 0,
        };
        let mine_count = match mine.get("count") {
            Some(Value::Int(n)) => *n,
            _ => base,
        };
        let theirs_count = match theirs.get("count") {
            Some(Value::Int(n)) => *n,
            _ => base,
        };
        let mut merged = theirs.clone();
        merged.insert("count".to_string(), Value::Int(mine_count + theirs_count - base));
        Ok(merged)
    }
}

#[test]
fn conflict_resolver_merges_concurrent_increments() {
    let (_dir, db) = open_temp();
    let mut attrs = AttrMap::new();
    attrs.insert("count".to_string(), Value::Int(0));
    let counter = db.new_object(attrs);
    counter.set_resolver(Arc::new(SummingResolver));
    db.elect(&counter);
    db.commit().unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let db_a = db.clone();
    let counter_a = counter.clone();
    let barrier_a = barrier.clone();
    let first = thread::spawn(move || {
        db_a.checkout(&counter_a).unwrap();
        counter_a.set("count".to_string(), Value::Int(1)).unwrap();
        barrier_a.wait();
        barrier_a.wait();
        db_a.commit()
    });

    let db_b = db.clone();
    let counter_b = counter.clone();
    let barrier_b = barrier.clone();
    let second = thread::spawn(move || {
        db_b.checkout(&counter_b).unwrap();
        counter_b.set("count".to_string(), Value::Int(1)).unwrap();
        barrier_b.wait();
        db_b.commit().unwrap();
        barrier_b.wait();
    });

    second.join().unwrap();
    let first_result = first.join().unwrap();

    assert!(first_result.is_ok());
    assert_eq!(counter.get("count").unwrap(), Some(Value::Int(2)));
    assert_eq!(db.tx_count(), 3);
}

#[test]
fn graph_reachability_rejection_then_retry() {
    let (_dir, db) = open_temp();
    let root = db.new_object(AttrMap::new());
    db.elect(&root);
    db.commit().unwrap();

    let x = db.new_object(AttrMap::new());
    let err = db.commit();
    assert!(matches!(err, Err(Error::ObjectGraph(_))));
    db.abort();

    db.checkout(&root).unwrap();
    root.set("x".to_string(), Value::Object(x.clone())).unwrap();
    db.commit().unwrap();
    assert!(x.oid().is_some());
    assert_eq!(db.tx_count(), 2);
}

#[test]
fn blob_round_trips_through_a_second_instance() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blobs.podb");

    let a = Database::open(&path).unwrap();
    let root = a.new_object(AttrMap::new());
    let blob = podb::blob::PersistentBlob::new(b"abc".to_vec());
    root.set("payload".to_string(), Value::Blob(blob.clone())).unwrap();
    a.elect(&root);
    a.commit().unwrap();

    assert!(blob.is_committed());
    assert_eq!(blob.read_all().unwrap(), b"abc");

    let mut reader = blob.open_reader().unwrap();
    let mut buf = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut buf).unwrap();
    assert_eq!(buf, b"abc");

    let b = Database::open(&path).unwrap();
    let b_root = b.root().unwrap();
    match b_root.get("payload").unwrap() {
        Some(Value::Blob(b)) => assert_eq!(b.read_all().unwrap(), b"abc"),
        other => panic!("expected Value::Blob, got {other:?}"),
    }
}
