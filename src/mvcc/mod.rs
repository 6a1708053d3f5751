//! The MVCC transaction manager: per-thread, per-database bookkeeping of
//! which objects a transaction has touched, plus the `begin`/`commit`/`abort`
//! algorithm described in `spec.md` §4.5. `Database` owns one
//! `TransactionManager` and delegates its four verbs to it; this module
//! never touches the log or the registry directly except through the
//! narrow accessors `Database` exposes to it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread::ThreadId;

use crate::database::Database;
use crate::error::{CResult, Error};
use crate::object::Handle;
use crate::oid::{Oid, TxId};

/// Per-thread working set for one database: the objects this thread has
/// written (or created) since its last commit/abort, the txid its view was
/// last refreshed to, and which of those objects were already stale by the
/// time `begin()` last ran (used only to pick `ReadConflictError` over
/// `WriteConflictError` when a commit-time conflict is reported).
#[derive(Default)]
struct ThreadState {
    registered: Vec<Handle>,
    last_seen_txid: TxId,
    stale_on_begin: Vec<Oid>,
}

/// Coordinates `begin`/`checkout`/`commit`/`abort` for every thread sharing
/// one `Database`. Holds no lock across I/O: the commit lock lives on
/// `Log::tx_begin_write`'s `WriteGuard`, not here.
#[derive(Default)]
pub(crate) struct TransactionManager {
    threads: Mutex<HashMap<ThreadId, ThreadState>>,
}

impl TransactionManager {
    pub(crate) fn new() -> Self {
        TransactionManager { threads: Mutex::new(HashMap::new()) }
    }

    fn tid() -> ThreadId {
        std::thread::current().id()
    }

    fn last_seen(&self, tid: ThreadId) -> TxId {
        self.threads.lock().unwrap().entry(tid).or_default().last_seen_txid
    }

    /// Registers a freshly created local object with the calling thread's
    /// working set, matching the state table's "born local" lifecycle
    /// start: it is dirty from birth and must be part of the reachability
    /// check even before any explicit write.
    pub(crate) fn register_new(&self, handle: &Handle) {
        let tid = Self::tid();
        let mut threads = self.threads.lock().unwrap();
        let state = threads.entry(tid).or_default();
        if !state.registered.iter().any(|h| h == handle) {
            state.registered.push(handle.clone());
        }
    }

    /// `checkout(obj)`: promotes `handle` to a thread-local overlay and adds
    /// it to the calling thread's working set.
    pub(crate) fn checkout(&self, handle: &Handle) -> CResult<()> {
        handle.checkout()?;
        self.register_new(handle);
        Ok(())
    }

    /// `begin()`: catches the calling thread up on every transaction
    /// committed since it last looked, refreshing already-materialized
    /// objects and flagging a pending read conflict for any the thread
    /// currently holds an overlay on.
    pub(crate) fn begin(&self, db: &Database) -> CResult<()> {
        let tid = Self::tid();
        let last_seen = self.last_seen(tid);
        let txs = db.log().tx_catch_up(last_seen)?;
        let touched = db.absorb(&txs)?;

        let mut threads = self.threads.lock().unwrap();
        let state = threads.entry(tid).or_default();
        if let Some(last) = txs.last() {
            state.last_seen_txid = last.txid;
        }
        for (oid, handle) in touched {
            if handle.is_local() && handle.has_write_conflict() && !state.stale_on_begin.contains(&oid) {
                state.stale_on_begin.push(oid);
            }
        }
        log::debug!("begin: thread {:?} caught up to txid {}", tid, state.last_seen_txid);
        Ok(())
    }

    /// `abort()`: discards the calling thread's overlay on every registered,
    /// already-persisted object; objects born this transaction and never
    /// committed keep their only copy of their state and stay registered so
    /// a caller can reconnect them to the graph and retry, matching the
    /// birth→abort→retry scenario in `spec.md` §8.
    pub(crate) fn abort(&self) {
        let tid = Self::tid();
        let mut threads = self.threads.lock().unwrap();
        if let Some(state) = threads.get_mut(&tid) {
            state.registered.retain(|h| {
                if h.oid().is_some() {
                    h.take_overlay();
                    false
                } else {
                    true
                }
            });
            state.stale_on_begin.clear();
            log::debug!("abort: thread {:?} last seen txid {}", tid, state.last_seen_txid);
        }
    }

    /// `commit()`: the five-step algorithm of `spec.md` §4.5 — reachability
    /// check, commit-lock acquisition, a final catch-up, per-object conflict
    /// resolution, and publication.
    pub(crate) fn commit(&self, db: &Database) -> CResult<TxId> {
        let tid = Self::tid();
        let registered = {
            let mut threads = self.threads.lock().unwrap();
            threads.entry(tid).or_default().registered.clone()
        };
        if registered.is_empty() {
            return Ok(db.log().tx_count());
        }

        let reachable = db.collect_reachable()?;
        for h in &registered {
            if h.oid().is_none() && !reachable.iter().any(|r| r == h) {
                return Err(Error::ObjectGraph(
                    "committed object has no oid and is not reachable from the database root"
                        .to_string(),
                ));
            }
        }

        let mut write = db.log().tx_begin_write()?;

        let last_seen = self.last_seen(tid);
        let txs = write.catch_up(last_seen)?;

        // Snapshot each registered handle's checkout baseline before
        // `absorb` folds in anyone else's concurrent commits.
        let bases: Vec<(Handle, Option<crate::value::AttrMap>)> =
            registered.iter().map(|h| (h.clone(), h.overlay_base_attrs())).collect();

        db.absorb(&txs)?;
        {
            let mut threads = self.threads.lock().unwrap();
            let state = threads.entry(tid).or_default();
            if let Some(last) = txs.last() {
                state.last_seen_txid = last.txid;
            }
        }

        let stale_on_begin = {
            let mut threads = self.threads.lock().unwrap();
            threads.entry(tid).or_default().stale_on_begin.clone()
        };

        if let Some(err) = self.resolve_conflicts(&bases, &stale_on_begin) {
            for h in &registered {
                if h.oid().is_some() {
                    h.take_overlay();
                }
            }
            write.commit_failure_marker()?;
            let mut threads = self.threads.lock().unwrap();
            let state = threads.entry(tid).or_default();
            state.registered.retain(|h| h.oid().is_none());
            state.stale_on_begin.clear();
            return Err(err);
        }

        // Append pending blobs first so every `Value::Blob` has a
        // committed span by the time objects are encoded.
        let blob_host = db.blob_weak();
        for h in &registered {
            let attrs = h.attrs_snapshot()?;
            for blob in crate::codec::AttrCodec::collect_pending_blobs(&attrs) {
                let bytes = blob.pending_bytes().expect("just filtered to pending blobs");
                let (offset, length) = write.append_blob(&bytes);
                blob.mark_committed(offset, length, blob_host.clone());
            }
        }

        // Assign OIDs to every newly reachable object before any of them
        // are encoded, so forward references between objects created in
        // the same transaction resolve correctly regardless of order.
        for h in &registered {
            if h.oid().is_none() {
                let oid = db.log().new_oid();
                h.assign_oid(oid, db.weak_handle());
                db.registry().insert(oid, h.clone());
            }
        }

        for h in &registered {
            let attrs = h.attrs_snapshot()?;
            let encoded = db.codec().encode(&attrs, write.blob_spans())?;
            write.append_object(h.oid().expect("oid assigned above"), &encoded);
        }

        let txid = write.commit()?;
        log::debug!("commit: thread {:?} committed txid {}", tid, txid);

        for h in &registered {
            let attrs = h.take_overlay().expect("registered handles are local to this thread");
            let oid = h.oid().expect("oid assigned above");
            let serial = db.bump_serial(oid);
            db.record_last_writer(oid, txid);
            h.promote_to_shared(attrs, serial);
        }

        let mut threads = self.threads.lock().unwrap();
        let state = threads.entry(tid).or_default();
        state.registered.clear();
        state.stale_on_begin.clear();
        state.last_seen_txid = txid;

        Ok(txid)
    }

    /// Returns `Some(error)` the moment an unresolved conflict is found.
    /// Successful resolutions are applied in place (the overlay is replaced
    /// with the merged state) as a side effect.
    fn resolve_conflicts(
        &self,
        bases: &[(Handle, Option<crate::value::AttrMap>)],
        stale_on_begin: &[Oid],
    ) -> Option<Error> {
        for (handle, base_attrs) in bases {
            if !handle.has_write_conflict() {
                continue;
            }
            let oid = handle.oid().expect("a conflicting handle was already persisted");
            let theirs = handle.shared_snapshot().unwrap_or_default();
            let old = base_attrs.clone().unwrap_or_default();
            let resolved = match handle.resolver() {
                Some(resolver) => match handle.attrs_snapshot() {
                    Ok(mine) => resolver.resolve_conflict(&old, &mine, &theirs),
                    Err(e) => return Some(e),
                },
                None => Err(crate::object::ResolveError("no conflict resolver registered".to_string())),
            };
            match resolved {
                Ok(merged) => handle.replace_overlay_attrs(merged),
                Err(_) => {
                    return Some(if stale_on_begin.contains(&oid) {
                        Error::ReadConflict(format!("oid {oid} changed before this transaction began"))
                    } else {
                        Error::WriteConflict(format!("oid {oid} changed since it was checked out"))
                    });
                }
            }
        }
        None
    }
}
