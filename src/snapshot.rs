//! The Snapshot Emitter (`spec.md` §4.6): collapses every committed
//! transaction of a source database into a single transaction written to a
//! fresh target database.

use std::collections::HashMap;
use std::sync::Arc;

use crate::database::Database;
use crate::error::{CResult, Error};
use crate::object::Handle;
use crate::value::{AttrMap, Value};

/// Breadth-first-copies `source`'s current graph into `target`, which must
/// be empty, as a single transaction. Postcondition: `target.tx_count() ==
/// 1` and `target`'s graph is structurally isomorphic to `source`'s current
/// view.
pub fn emit(source: &Arc<Database>, target: &Arc<Database>) -> CResult<()> {
    if !target.is_empty() || target.tx_count() > 0 {
        return Err(Error::Internal("snapshot target must be empty".to_string()));
    }

    let Some(source_root) = source.root() else {
        return Ok(());
    };

    // First pass: create a fresh local handle in `target` for every
    // reachable source object, without yet populating attributes (so
    // forward and cyclic references can resolve against a handle that
    // already exists).
    let reachable = source.collect_reachable()?;
    let mut mapped: HashMap<Handle, Handle> = HashMap::new();
    for old in &reachable {
        mapped.insert(old.clone(), target.new_object(AttrMap::new()));
    }

    // Second pass: copy attributes, substituting object references through
    // `mapped` and re-copying blob bytes byte-for-byte as fresh, pending
    // blobs so they get their own span in the target's single transaction.
    for old in &reachable {
        let new = mapped.get(old).expect("populated in the first pass").clone();
        let attrs = old.attrs_snapshot()?;
        for (key, value) in attrs {
            let translated = translate_value(value, &mapped)?;
            new.set(key, translated)?;
        }
    }

    let new_root = mapped.get(&source_root).expect("root is always reachable from itself").clone();
    target.elect(&new_root);
    target.commit()?;
    Ok(())
}

fn translate_value(value: Value, mapped: &HashMap<Handle, Handle>) -> CResult<Value> {
    Ok(match value {
        Value::Object(h) => {
            let new = mapped.get(&h).ok_or_else(|| {
                Error::ObjectGraph("snapshot encountered a reference outside the reachable set".to_string())
            })?;
            Value::Object(new.clone())
        }
        Value::Blob(b) => Value::Blob(crate::blob::PersistentBlob::new(b.read_all()?)),
        Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(translate_value(item, mapped)?);
            }
            Value::List(out)
        }
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn snapshot_collapses_history_into_one_transaction() {
        let dir = tempdir().unwrap();
        let source = Database::open(dir.path().join("source.podb")).unwrap();

        let root = source.new_object(AttrMap::new());
        source.elect(&root);
        source.commit().unwrap();

        source.checkout(&root).unwrap();
        root.set("name".to_string(), Value::Str("alice".to_string())).unwrap();
        source.commit().unwrap();

        let child = source.new_object(AttrMap::new());
        child.set("n".to_string(), Value::Int(42)).unwrap();
        source.checkout(&root).unwrap();
        root.set("child".to_string(), Value::Object(child.clone())).unwrap();
        source.commit().unwrap();

        assert_eq!(source.tx_count(), 3);

        let target = Database::open(dir.path().join("target.podb")).unwrap();
        source.snapshot(&target).unwrap();

        assert_eq!(target.tx_count(), 1);
        let new_root = target.root().unwrap();
        assert_eq!(new_root.get("name").unwrap(), Some(Value::Str("alice".to_string())));
        match new_root.get("child").unwrap() {
            Some(Value::Object(h)) => assert_eq!(h.get("n").unwrap(), Some(Value::Int(42))),
            other => panic!("expected Value::Object, got {other:?}"),
        }
    }
}
