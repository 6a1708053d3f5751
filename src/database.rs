//! The `Database`: ties the log, the registry, the codec, and the
//! transaction manager together behind the public API named in `spec.md`
//! §6 (`Database(path)`, `root`, `elect`, `tx_count`, `len`, `snapshot`, plus
//! the module-level `checkout`/`begin`/`commit`/`abort` verbs, modelled here
//! as methods since Rust has no module-level transaction context).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::blob::BlobHost;
use crate::codec::{AttrCodec, RefResolver};
use crate::error::{CResult, Error};
use crate::log::Log;
use crate::mvcc::TransactionManager;
use crate::object::{DatabaseHandle, Handle};
use crate::oid::{Oid, Serial, TxId};
use crate::registry::Registry;
use crate::value::{AttrMap, Value};

/// Options controlling how a log file is opened, mirroring the ambient
/// configuration knobs `spec.md` leaves to the embedding application.
#[derive(Clone, Debug)]
pub struct DatabaseOptions {
    /// Create the log file if it doesn't exist.
    pub create: bool,
    /// Take POSIX advisory locks for cross-process coordination. Disabling
    /// this is only sound when the caller guarantees single-process access.
    pub lock: bool,
    /// `fsync` after every commit trailer. Disabling trades durability for
    /// throughput; useful for short-lived test databases.
    pub fsync: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        DatabaseOptions { create: true, lock: true, fsync: true }
    }
}

struct RootCell {
    handle: Option<Handle>,
}

/// An embeddable, transactional object-graph database backed by a single
/// append-only log file.
pub struct Database {
    log: Log,
    registry: Registry,
    codec: AttrCodec,
    root: Mutex<RootCell>,
    serials: Mutex<HashMap<Oid, Serial>>,
    last_writer: Mutex<HashMap<Oid, TxId>>,
    txn: TransactionManager,
    self_weak: OnceLock<Weak<Database>>,
}

impl Database {
    /// Opens (creating if necessary) the log file at `path` with default
    /// options.
    pub fn open(path: impl AsRef<Path>) -> CResult<Arc<Database>> {
        Database::open_with(path, DatabaseOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: DatabaseOptions) -> CResult<Arc<Database>> {
        let log = Log::open(PathBuf::from(path.as_ref()), options.create, options.lock, options.fsync)?;
        let db = Arc::new(Database {
            log,
            registry: Registry::new(),
            codec: AttrCodec::new(),
            root: Mutex::new(RootCell { handle: None }),
            serials: Mutex::new(HashMap::new()),
            last_writer: Mutex::new(HashMap::new()),
            txn: TransactionManager::new(),
            self_weak: OnceLock::new(),
        });
        let _ = db.self_weak.set(Arc::downgrade(&db));

        // Eager load: fold every already-committed transaction into ghosts
        // and serials so the registry reflects everything on disk, per
        // the "do not introduce an eviction cache" design note.
        let txs = db.log.tx_catch_up(0)?;
        db.absorb(&txs)?;

        // The root is, by convention, whichever object received oid 0: the
        // reachability check in `TransactionManager::commit` only ever lets
        // the very first successful commit touch an unassigned-oid object
        // that isn't yet reachable from root, namely the object `elect`
        // just installed, so oid 0 always belongs to the root once one has
        // ever been committed.
        if db.last_writer.lock().unwrap().contains_key(&Oid::new(0)) {
            let root = db.registry.get_or_create_ghost(Oid::new(0), db.weak_handle());
            root.mark_sticky();
            db.root.lock().unwrap().handle = Some(root);
        }

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }

    /// Current root object, if one has been elected.
    pub fn root(&self) -> Option<Handle> {
        self.root.lock().unwrap().handle.clone()
    }

    /// Installs `obj` as the database root. Only the first call takes
    /// effect; later calls are no-ops, matching "installs... at most once".
    pub fn elect(&self, obj: &Handle) {
        let mut root = self.root.lock().unwrap();
        if root.handle.is_none() {
            obj.mark_sticky();
            self.txn.register_new(obj);
            root.handle = Some(obj.clone());
        }
    }

    pub fn tx_count(&self) -> u64 {
        self.log.tx_count()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Creates a new, detached local object. It is registered with the
    /// calling thread's working set immediately: a freshly created object
    /// is dirty from birth and must be swept by the next commit's
    /// reachability check even if none of its attributes are written again.
    pub fn new_object(&self, attrs: AttrMap) -> Handle {
        let handle = Handle::new_local(attrs);
        handle.bind_jar(self.weak_handle());
        self.txn.register_new(&handle);
        handle
    }

    /// `checkout(obj)`: promotes `handle` to a writable per-thread overlay.
    pub fn checkout(&self, handle: &Handle) -> CResult<()> {
        self.txn.checkout(handle)
    }

    pub fn begin(&self) -> CResult<()> {
        self.txn.begin(self)
    }

    pub fn commit(&self) -> CResult<TxId> {
        self.txn.commit(self)
    }

    pub fn abort(&self) {
        self.txn.abort()
    }

    /// Collapses every committed transaction into a single transaction in
    /// `target`, per `spec.md` §4.6. `target` must be empty.
    pub fn snapshot(self: &Arc<Self>, target: &Arc<Database>) -> CResult<()> {
        crate::snapshot::emit(self, target)
    }

    pub(crate) fn log(&self) -> &Log {
        &self.log
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn codec(&self) -> &AttrCodec {
        &self.codec
    }

    pub(crate) fn weak_handle(&self) -> Weak<dyn DatabaseHandle> {
        let weak: Weak<dyn DatabaseHandle> =
            self.self_weak.get().expect("self_weak set in open_with").clone();
        weak
    }

    pub(crate) fn blob_weak(&self) -> Weak<dyn BlobHost> {
        let weak: Weak<dyn BlobHost> =
            self.self_weak.get().expect("self_weak set in open_with").clone();
        weak
    }

    pub(crate) fn bump_serial(&self, oid: Oid) -> Serial {
        let mut serials = self.serials.lock().unwrap();
        let entry = serials.entry(oid).or_insert(0);
        *entry += 1;
        *entry
    }

    pub(crate) fn record_last_writer(&self, oid: Oid, txid: TxId) {
        self.last_writer.lock().unwrap().insert(oid, txid);
    }

    /// Folds a batch of newly observed transactions into the registry: every
    /// object record bumps its serial and updates `last_writer`; an object
    /// already materialized (shared or local) is refreshed in place; an
    /// object never seen before becomes a fresh ghost; an existing pure
    /// ghost is left untouched, matching lazy "populated on first attribute
    /// access" materialization. Returns every handle that was refreshed in
    /// place, for the caller to check for conflicts against.
    pub(crate) fn absorb(&self, txs: &[crate::log::TransactionRecord]) -> CResult<Vec<(Oid, Handle)>> {
        let mut touched = Vec::new();
        for tx in txs {
            if tx.is_failure {
                continue;
            }
            for (oid, bytes) in &tx.objects {
                let serial = self.bump_serial(*oid);
                self.record_last_writer(*oid, tx.txid);

                match self.registry.get(*oid) {
                    Some(handle) => {
                        if handle.is_shared() || handle.is_local() {
                            let attrs = self.codec.decode(bytes, &tx.blobs, self, self.blob_weak())?;
                            handle.apply_catch_up(attrs, serial);
                            touched.push((*oid, handle));
                        }
                        // A pure ghost is left alone; it materializes lazily,
                        // picking up the right serial from `self.serials` at
                        // that point via `DatabaseHandle::materialize`.
                    }
                    None => {
                        self.registry.get_or_create_ghost(*oid, self.weak_handle());
                    }
                }
            }
        }
        Ok(touched)
    }

    /// Breadth-first walk of every object reachable from the root, via each
    /// object's *current* attribute view (overlay if local, else shared).
    /// Used by commit's reachability check and by the snapshot emitter.
    pub(crate) fn collect_reachable(&self) -> CResult<Vec<Handle>> {
        let mut seen: Vec<Handle> = Vec::new();
        let mut queue: Vec<Handle> = Vec::new();
        if let Some(root) = self.root() {
            queue.push(root);
        }
        while let Some(h) = queue.pop() {
            if seen.iter().any(|s| s == &h) {
                continue;
            }
            seen.push(h.clone());
            let attrs = h.attrs_snapshot()?;
            for referenced in AttrCodec::collect_refs(&attrs) {
                if !seen.iter().any(|s| s == &referenced) {
                    queue.push(referenced);
                }
            }
        }
        Ok(seen)
    }
}

impl DatabaseHandle for Database {
    /// Materializes a ghost: looks up which transaction last wrote `oid`
    /// and re-reads that transaction in full, so blob markers embedded in
    /// the object's bytes resolve against the same transaction's blob
    /// spans they were encoded against.
    fn materialize(&self, oid: Oid) -> CResult<(AttrMap, Serial)> {
        let txid = *self
            .last_writer
            .lock()
            .unwrap()
            .get(&oid)
            .ok_or_else(|| Error::Storage(format!("no recorded writer for oid {oid}")))?;
        let tx = self.log.read_transaction(txid)?;
        let (_, bytes) = tx
            .objects
            .iter()
            .find(|(o, _)| *o == oid)
            .ok_or_else(|| Error::Storage(format!("oid {oid} not found in transaction {txid}")))?;
        let attrs = self.codec.decode(bytes, &tx.blobs, self, self.blob_weak())?;
        let serial = *self.serials.lock().unwrap().get(&oid).unwrap_or(&0);
        Ok((attrs, serial))
    }
}

impl BlobHost for Database {
    fn read_blob_span(&self, offset: u64, length: u64) -> CResult<Vec<u8>> {
        self.log.read_blob(offset, length)
    }
}

impl RefResolver for Database {
    fn resolve_ref(&self, oid: Oid) -> CResult<Handle> {
        Ok(self.registry.get_or_create_ghost(oid, self.weak_handle()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, Arc<Database>) {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("test.podb")).unwrap();
        (dir, db)
    }

    #[test]
    fn birth_to_commit() {
        let (_dir, db) = open_temp();
        let mut attrs = AttrMap::new();
        attrs.insert("name".to_string(), Value::Str("John".to_string()));
        let obj = db.new_object(attrs);
        db.elect(&obj);
        let txid = db.commit().unwrap();

        assert_eq!(txid, 1);
        assert_eq!(db.len(), 1);
        assert_eq!(db.tx_count(), 1);
        assert_eq!(obj.oid(), Some(Oid::new(0)));
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
        let txid = db.commit().unwrap();
        assert_eq!(txid, 2);
        assert!(x.oid().is_some());
    }

    #[test]
    fn cross_instance_visibility() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.podb");

        let a = Database::open(&path).unwrap();
        let root = a.new_object(AttrMap::new());
        root.set("name".to_string(), Value::Str("James".to_string())).unwrap();
        a.elect(&root);
        a.commit().unwrap();

        let b = Database::open(&path).unwrap();
        let b_root = b.root().expect("oid 0 was committed before b opened");
        assert_eq!(b_root.get("name").unwrap(), Some(Value::Str("James".to_string())));

        a.checkout(&root).unwrap();
        root.set("name".to_string(), Value::Str("Jane".to_string())).unwrap();
        a.commit().unwrap();

        assert_eq!(b.tx_count(), 1);
        b.begin().unwrap();
        assert_eq!(b.tx_count(), 2);
        assert_eq!(b_root.get("name").unwrap(), Some(Value::Str("Jane".to_string())));
    }
}
