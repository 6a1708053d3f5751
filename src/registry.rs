//! Process-wide mapping from [`Oid`] to the one live [`Handle`] that object
//! has in this process, per `spec.md` §4.3. Every persistent object is
//! inserted here exactly once, either when it's first committed or the first
//! time some other object's reference to it is resolved; a lookup miss
//! creates a ghost rather than failing.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use crate::object::{DatabaseHandle, Handle};
use crate::oid::Oid;

/// Guards a `HashMap<Oid, Handle>`. Lookups are O(1) under the mutex;
/// contention is expected to be low since reads vastly outnumber the writes
/// that add new entries (`spec.md` §5).
#[derive(Default)]
pub struct Registry {
    objects: Mutex<HashMap<Oid, Handle>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { objects: Mutex::new(HashMap::new()) }
    }

    /// Number of distinct objects this process has ever seen, live or
    /// ghost. Backs `Database::len`.
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live handle for `oid`, creating a ghost bound to `jar` on first
    /// sight. Never returns two different handles for the same `oid`.
    pub(crate) fn get_or_create_ghost(&self, oid: Oid, jar: Weak<dyn DatabaseHandle>) -> Handle {
        let mut objects = self.objects.lock().unwrap();
        objects
            .entry(oid)
            .or_insert_with(|| Handle::new_ghost(oid, 0, jar))
            .clone()
    }

    /// Records that `handle` now occupies `oid`, normally right after a
    /// fresh OID was assigned during commit. Overwrites nothing: by
    /// construction OIDs are assigned exactly once and `oid` cannot already
    /// be present unless caller logic is broken.
    pub fn insert(&self, oid: Oid, handle: Handle) {
        self.objects.lock().unwrap().insert(oid, handle);
    }

    pub fn get(&self, oid: Oid) -> Option<Handle> {
        self.objects.lock().unwrap().get(&oid).cloned()
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.objects.lock().unwrap().contains_key(&oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CResult;
    use crate::value::AttrMap;

    struct NullHost;
    impl DatabaseHandle for NullHost {
        fn materialize(&self, _oid: Oid) -> CResult<(AttrMap, crate::oid::Serial)> {
            Ok((AttrMap::new(), 0))
        }
    }

    #[test]
    fn repeated_lookups_return_the_same_handle() {
        let registry = Registry::new();
        let host: std::sync::Arc<dyn DatabaseHandle> = std::sync::Arc::new(NullHost);
        let weak = std::sync::Arc::downgrade(&host);

        let a = registry.get_or_create_ghost(Oid::new(1), weak.clone());
        let b = registry.get_or_create_ghost(Oid::new(1), weak);
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_oids_get_distinct_handles() {
        let registry = Registry::new();
        let host: std::sync::Arc<dyn DatabaseHandle> = std::sync::Arc::new(NullHost);
        let weak = std::sync::Arc::downgrade(&host);

        let a = registry.get_or_create_ghost(Oid::new(1), weak.clone());
        let b = registry.get_or_create_ghost(Oid::new(2), weak);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }
}
