//! Live persistent objects.
//!
//! A [`Handle`] is a stable, cloneable identity for one persistent object.
//! It moves through four states as a transaction touches it:
//!
//! - **ghost**: an OID is known but no attributes have been loaded yet.
//! - **shared**: attributes are loaded and visible read-only to every
//!   thread, via an immutable snapshot.
//! - **local**: the calling thread holds a private, mutable overlay that
//!   shadows the shared snapshot until commit or abort.
//! - **sticky**: pinned so it is never treated as a ghost again, regardless
//!   of how it was reached (used for the database root).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::ThreadId;

use arc_swap::ArcSwapOption;

use crate::error::{CResult, Error};
use crate::oid::{Oid, Serial};
use crate::value::AttrMap;

/// Narrow interface a [`Handle`] uses to reach back into its owning
/// database, without depending on `crate::database` directly.
pub(crate) trait DatabaseHandle: Send + Sync {
    /// Loads the durable attributes of `oid`, plus the serial of the
    /// transaction that last wrote it, at the thread's current catch-up
    /// point.
    fn materialize(&self, oid: Oid) -> CResult<(AttrMap, Serial)>;
}

/// Resolves a write conflict between two transactions that both modified
/// the same object since `old`.
///
/// Returning `Ok` salvages the commit; returning `Err` surfaces as a
/// [`Error::WriteConflict`].
pub trait ConflictResolver: Send + Sync {
    fn resolve_conflict(&self, old: &AttrMap, mine: &AttrMap, theirs: &AttrMap) -> Result<AttrMap, ResolveError>;
}

#[derive(Debug, Clone)]
pub struct ResolveError(pub String);

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conflict resolver declined: {}", self.0)
    }
}

impl std::error::Error for ResolveError {}

struct Overlay {
    attrs: AttrMap,
    /// The serial this thread's view was based on, used to detect whether
    /// another commit has moved `serial` forward underneath it.
    base_serial: Serial,
    /// The attribute map as of `base_serial`, handed to a conflict resolver
    /// as its `old_state` argument if a concurrent writer also touched this
    /// object before this thread's commit.
    base_attrs: AttrMap,
}

struct Inner {
    oid: Mutex<Option<Oid>>,
    serial: AtomicU64,
    jar: OnceLock<Weak<dyn DatabaseHandle>>,
    /// `None` means ghost: known but not yet loaded from the log.
    shared: ArcSwapOption<AttrMap>,
    overlays: Mutex<HashMap<ThreadId, Overlay>>,
    sticky: AtomicBool,
    resolver: Mutex<Option<Arc<dyn ConflictResolver>>>,
}

/// A handle to one persistent object. Clones share identity: two `Handle`s
/// with the same `oid` (or the same unpersisted origin) always observe the
/// same state.
#[derive(Clone)]
pub struct Handle(Arc<Inner>);

impl Handle {
    /// A freshly created object, born local to the calling thread with no
    /// OID until it is first committed.
    pub fn new_local(attrs: AttrMap) -> Self {
        let mut overlays = HashMap::new();
        let base_attrs = attrs.clone();
        overlays.insert(
            std::thread::current().id(),
            Overlay { attrs, base_serial: 0, base_attrs },
        );
        Handle(Arc::new(Inner {
            oid: Mutex::new(None),
            serial: AtomicU64::new(0),
            jar: OnceLock::new(),
            shared: ArcSwapOption::from(None),
            overlays: Mutex::new(overlays),
            sticky: AtomicBool::new(false),
            resolver: Mutex::new(None),
        }))
    }

    /// A ghost: known to exist at `oid` but not yet materialized.
    pub(crate) fn new_ghost(oid: Oid, serial: Serial, jar: Weak<dyn DatabaseHandle>) -> Self {
        let inner = Inner {
            oid: Mutex::new(Some(oid)),
            serial: AtomicU64::new(serial),
            jar: OnceLock::new(),
            shared: ArcSwapOption::from(None),
            overlays: Mutex::new(HashMap::new()),
            sticky: AtomicBool::new(false),
            resolver: Mutex::new(None),
        };
        let _ = inner.jar.set(jar);
        Handle(Arc::new(inner))
    }

    pub fn oid(&self) -> Option<Oid> {
        *self.0.oid.lock().unwrap()
    }

    pub fn serial(&self) -> Serial {
        self.0.serial.load(Ordering::SeqCst)
    }

    pub fn is_sticky(&self) -> bool {
        self.0.sticky.load(Ordering::SeqCst)
    }

    pub fn mark_sticky(&self) {
        self.0.sticky.store(true, Ordering::SeqCst);
    }

    pub fn is_local(&self) -> bool {
        self.0.overlays.lock().unwrap().contains_key(&std::thread::current().id())
    }

    pub fn is_ghost(&self) -> bool {
        !self.is_local() && self.0.shared.load().is_none()
    }

    pub fn is_shared(&self) -> bool {
        !self.is_local() && self.0.shared.load().is_some()
    }

    pub fn resolver(&self) -> Option<Arc<dyn ConflictResolver>> {
        self.0.resolver.lock().unwrap().clone()
    }

    pub fn set_resolver(&self, resolver: Arc<dyn ConflictResolver>) {
        *self.0.resolver.lock().unwrap() = Some(resolver);
    }

    /// Loads shared state from the log if this handle is still a ghost.
    /// A no-op for local or already-shared handles.
    fn ensure_materialized(&self) -> CResult<()> {
        if self.0.shared.load().is_some() {
            return Ok(());
        }
        let oid = self.oid().ok_or_else(|| {
            Error::Internal("ghost handle has no oid".to_string())
        })?;
        let jar = self
            .0
            .jar
            .get()
            .and_then(|w| w.upgrade())
            .ok_or_else(|| Error::Storage("object's database has been closed".to_string()))?;
        let (attrs, serial) = jar.materialize(oid)?;
        self.0.shared.store(Some(Arc::new(attrs)));
        self.0.serial.store(serial, Ordering::SeqCst);
        Ok(())
    }

    /// Ensures the calling thread has a private overlay, materializing a
    /// ghost first if necessary. Idempotent.
    pub fn checkout(&self) -> CResult<()> {
        if self.is_local() {
            return Ok(());
        }
        self.ensure_materialized()?;
        let base = self.serial();
        let attrs = (*self.0.shared.load().as_ref().unwrap().as_ref()).clone();
        let base_attrs = attrs.clone();
        self.0.overlays.lock().unwrap().insert(
            std::thread::current().id(),
            Overlay { attrs, base_serial: base, base_attrs },
        );
        Ok(())
    }

    /// The effective attribute map as seen by the calling thread: its own
    /// overlay if it has checked one out, otherwise the shared snapshot
    /// (materializing a ghost on demand).
    pub fn attrs_snapshot(&self) -> CResult<AttrMap> {
        if let Some(overlay) = self.0.overlays.lock().unwrap().get(&std::thread::current().id()) {
            return Ok(overlay.attrs.clone());
        }
        self.ensure_materialized()?;
        Ok((*self.0.shared.load().as_ref().unwrap().as_ref()).clone())
    }

    pub fn get(&self, key: &str) -> CResult<Option<crate::value::Value>> {
        Ok(self.attrs_snapshot()?.get(key).cloned())
    }

    /// Writes `key` into the calling thread's overlay. The calling thread
    /// must already own an overlay via an explicit prior `checkout()`; a
    /// write to an object still in `shared` state is rejected rather than
    /// silently promoting it to `local`.
    pub fn set(&self, key: String, value: crate::value::Value) -> CResult<()> {
        self.0
            .overlays
            .lock()
            .unwrap()
            .get_mut(&std::thread::current().id())
            .ok_or_else(|| {
                Error::ReadOnly(format!(
                    "object {:?} has no checked-out overlay on this thread; call checkout() first",
                    self.oid()
                ))
            })?
            .attrs
            .insert(key, value);
        Ok(())
    }

    /// Removes and returns the calling thread's overlay, if any, without
    /// touching shared state. Used both to stage a commit's write and to
    /// discard on abort.
    pub(crate) fn take_overlay(&self) -> Option<AttrMap> {
        self.0
            .overlays
            .lock()
            .unwrap()
            .remove(&std::thread::current().id())
            .map(|o| o.attrs)
    }

    /// The serial the calling thread's overlay was checked out against,
    /// `None` if the thread has no overlay.
    pub(crate) fn overlay_base_serial(&self) -> Option<Serial> {
        self.0
            .overlays
            .lock()
            .unwrap()
            .get(&std::thread::current().id())
            .map(|o| o.base_serial)
    }

    /// The attribute map as of the calling thread's checkout point, handed
    /// to a conflict resolver as `old_state`. `None` if the thread has no
    /// overlay.
    pub(crate) fn overlay_base_attrs(&self) -> Option<AttrMap> {
        self.0
            .overlays
            .lock()
            .unwrap()
            .get(&std::thread::current().id())
            .map(|o| o.base_attrs.clone())
    }

    /// True if another transaction has committed a newer version since the
    /// calling thread's overlay was checked out.
    pub(crate) fn has_write_conflict(&self) -> bool {
        match self.overlay_base_serial() {
            Some(base) => base != self.serial(),
            None => false,
        }
    }

    /// Assigns an OID to a previously unpersisted object and attaches it to
    /// its owning database, during commit's reachability walk.
    pub(crate) fn assign_oid(&self, oid: Oid, jar: Weak<dyn DatabaseHandle>) {
        *self.0.oid.lock().unwrap() = Some(oid);
        let _ = self.0.jar.set(jar);
    }

    /// Binds this handle to its owning database without assigning an OID,
    /// used when a brand-new local object is created through
    /// `Database::new_object` so later jar lookups never race its first
    /// commit.
    pub(crate) fn bind_jar(&self, jar: Weak<dyn DatabaseHandle>) {
        let _ = self.0.jar.set(jar);
    }

    /// The current shared snapshot, bypassing any overlay. `None` for a
    /// still-ghost handle. Used to hand a conflict resolver the
    /// concurrently-committed `new_state`.
    pub(crate) fn shared_snapshot(&self) -> Option<AttrMap> {
        self.0.shared.load().as_ref().map(|a| (**a).clone())
    }

    /// Replaces the calling thread's overlay contents with a resolver's
    /// merged result and re-bases it against the object's current serial,
    /// so the commit that follows sees no further conflict for this object.
    pub(crate) fn replace_overlay_attrs(&self, attrs: AttrMap) {
        let serial = self.serial();
        let mut overlays = self.0.overlays.lock().unwrap();
        if let Some(overlay) = overlays.get_mut(&std::thread::current().id()) {
            overlay.attrs = attrs;
            overlay.base_serial = serial;
        }
    }

    /// Applied during catch-up: folds in a newer committed version without
    /// disturbing any other thread's overlay. Used both for objects this
    /// thread has no stake in and, after a resolved write conflict, to
    /// record the concurrently-committed version as the new baseline.
    pub(crate) fn apply_catch_up(&self, attrs: AttrMap, serial: Serial) {
        self.0.shared.store(Some(Arc::new(attrs)));
        self.0.serial.store(serial, Ordering::SeqCst);
    }

    /// Publishes `attrs` as the new shared snapshot and bumps the serial.
    /// Called once a commit succeeds.
    pub(crate) fn promote_to_shared(&self, attrs: AttrMap, serial: Serial) {
        self.0.shared.store(Some(Arc::new(attrs)));
        self.0.serial.store(serial, Ordering::SeqCst);
        self.0.overlays.lock().unwrap().remove(&std::thread::current().id());
    }
}

impl PartialEq for Handle {
    /// Two handles are equal iff they share identity (same underlying
    /// object), never by comparing attribute contents.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Handle {}

impl std::hash::Hash for Handle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state)
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("oid", &self.oid())
            .field("serial", &self.serial())
            .finish()
    }
}
