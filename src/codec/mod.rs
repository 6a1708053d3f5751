//! Turns an object's attribute map into bytes and back.
//!
//! The codec is stateless across calls: every reference it encounters is
//! resolved or substituted through a hook supplied by the caller (in
//! practice, [`crate::database::Database`]). This keeps the codec ignorant
//! of the registry, the log, and threading, matching the narrow
//! `ObjectCodec` collaborator the host language's own pickler plays in the
//! source system.
//!
//! Object references are flattened to `(oid,)` per `spec.md` §3. Blobs have
//! no durable oid of their own (`spec.md` §6's `BLB` record carries none),
//! so a blob reference instead flattens to its ordinal position among the
//! blob payloads appended in the *same transaction* as the object — the
//! codec's save path extracts pending blob bytes via the `blob_writer` hook
//! exactly as `spec.md` §4.1 describes ("the codec records a payload marker
//! and the transaction writer appends the bytes after the object record"),
//! and the load path resolves a marker against that transaction's blob span
//! list, supplied by the caller alongside the encoded bytes.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

use crate::blob::PersistentBlob;
use crate::error::{CResult, Error};
use crate::object::Handle;
use crate::oid::Oid;
use crate::value::{AttrMap, Value};

/// The wire form of a single attribute value. Structurally identical to
/// [`Value`] except that object references flatten to their `oid` and blob
/// references flatten to a transaction-scoped marker.
#[derive(Serialize, Deserialize)]
enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Ref(u64),
    BlobRef(u32),
    List(Vec<WireValue>),
}

type WireAttrMap = BTreeMap<String, WireValue>;

/// Looks up (or creates a ghost for) the live [`Handle`] a reference `oid`
/// names. Implemented by `Database` so the codec never depends on the
/// registry directly.
pub trait RefResolver {
    fn resolve_ref(&self, oid: Oid) -> CResult<Handle>;
}

/// Stateless encode/decode of an object's attribute map.
///
/// `encode` requires every `Value::Object` it meets to already carry an
/// `oid`, and every `Value::Blob` to already be committed (have a span) —
/// the caller (the transaction manager, during commit) is responsible for
/// assigning OIDs to every reachable object and appending every pending
/// blob before encoding is attempted.
pub struct AttrCodec;

impl AttrCodec {
    pub fn new() -> Self {
        AttrCodec
    }

    /// `tx_blobs` is this transaction's blob spans in append order — the
    /// same list `decode` is later handed for the matching transaction, so a
    /// `Value::Blob`'s ordinal position in it round-trips as a stable marker
    /// regardless of where in the file the transaction itself lands.
    pub fn encode(&self, attrs: &AttrMap, tx_blobs: &[(u64, u64)]) -> CResult<Vec<u8>> {
        let mut wire: WireAttrMap = BTreeMap::new();
        for (key, value) in attrs {
            wire.insert(key.clone(), self.encode_value(value, tx_blobs)?);
        }
        bincode::serialize(&wire).map_err(Error::from)
    }

    fn encode_value(&self, value: &Value, tx_blobs: &[(u64, u64)]) -> CResult<WireValue> {
        Ok(match value {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(i) => WireValue::Int(*i),
            Value::Float(f) => WireValue::Float(*f),
            Value::Str(s) => WireValue::Str(s.clone()),
            Value::Bytes(b) => WireValue::Bytes(b.clone()),
            Value::Object(h) => {
                let oid = h.oid().ok_or_else(|| {
                    Error::Internal(
                        "encode called on an object reference with no oid".to_string(),
                    )
                })?;
                WireValue::Ref(oid.value())
            }
            Value::Blob(b) => {
                let span = b.committed_span().ok_or_else(|| {
                    Error::Internal("encode called on an uncommitted blob reference".to_string())
                })?;
                let marker = tx_blobs.iter().position(|s| *s == span).ok_or_else(|| {
                    Error::Internal(
                        "encode called on a blob whose span wasn't appended in this transaction"
                            .to_string(),
                    )
                })?;
                WireValue::BlobRef(marker as u32)
            }
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.encode_value(item, tx_blobs)?);
                }
                WireValue::List(out)
            }
        })
    }

    /// Decodes `bytes` as it was written in the transaction whose blob spans
    /// are `tx_blobs`, resolving object references through `refs` and
    /// wrapping blob references as committed [`PersistentBlob`]s rooted at
    /// `blob_host`.
    pub fn decode(
        &self,
        bytes: &[u8],
        tx_blobs: &[(u64, u64)],
        refs: &dyn RefResolver,
        blob_host: std::sync::Weak<dyn crate::blob::BlobHost>,
    ) -> CResult<AttrMap> {
        let wire: WireAttrMap = bincode::deserialize(bytes).map_err(Error::from)?;
        let mut attrs = AttrMap::new();
        for (key, value) in wire {
            attrs.insert(key, self.decode_value(value, tx_blobs, refs, &blob_host)?);
        }
        Ok(attrs)
    }

    fn decode_value(
        &self,
        value: WireValue,
        tx_blobs: &[(u64, u64)],
        refs: &dyn RefResolver,
        blob_host: &std::sync::Weak<dyn crate::blob::BlobHost>,
    ) -> CResult<Value> {
        Ok(match value {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::Int(i),
            WireValue::Float(f) => Value::Float(f),
            WireValue::Str(s) => Value::Str(s),
            WireValue::Bytes(b) => Value::Bytes(b),
            WireValue::Ref(raw) => Value::Object(refs.resolve_ref(Oid::new(raw))?),
            WireValue::BlobRef(marker) => {
                let (offset, length) = tx_blobs.get(marker as usize).copied().ok_or_else(|| {
                    Error::Storage(format!("blob marker {marker} not found in transaction"))
                })?;
                Value::Blob(PersistentBlob::from_committed(offset, length, blob_host.clone()))
            }
            WireValue::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.decode_value(item, tx_blobs, refs, blob_host)?);
                }
                Value::List(out)
            }
        })
    }

    /// Every `Value::Object` an attribute map references directly (and one
    /// level into any `Value::List`), used by the reachability walk and the
    /// snapshot emitter's graph traversal.
    pub fn collect_refs(attrs: &AttrMap) -> Vec<Handle> {
        let mut out = Vec::new();
        for value in attrs.values() {
            value.for_each_object_ref(&mut |h| out.push(h.clone()));
        }
        out
    }

    /// Every not-yet-committed `Value::Blob` an attribute map references,
    /// used by the transaction manager to append pending blob bytes before
    /// encoding.
    pub fn collect_pending_blobs(attrs: &AttrMap) -> Vec<PersistentBlob> {
        let mut out = Vec::new();
        for value in attrs.values() {
            value.for_each_blob_ref(&mut |b| {
                if !b.is_committed() {
                    out.push(b.clone());
                }
            });
        }
        out
    }
}

impl Default for AttrCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::sync::{Arc, Weak};

    struct FakeRefs {
        objects: RefCell<HashMap<u64, Handle>>,
    }

    impl RefResolver for FakeRefs {
        fn resolve_ref(&self, oid: Oid) -> CResult<Handle> {
            Ok(self.objects.borrow().get(&oid.value()).unwrap().clone())
        }
    }

    fn no_blob_host() -> Weak<dyn crate::blob::BlobHost> {
        struct Nobody;
        impl crate::blob::BlobHost for Nobody {
            fn read_blob_span(&self, _offset: u64, _length: u64) -> CResult<Vec<u8>> {
                Err(Error::Internal("no blob host in test".to_string()))
            }
        }
        let owner: Arc<dyn crate::blob::BlobHost> = Arc::new(Nobody);
        Arc::downgrade(&owner)
    }

    #[test]
    fn scalars_round_trip() {
        let codec = AttrCodec::new();
        let mut attrs = AttrMap::new();
        attrs.insert("name".to_string(), Value::Str("alice".to_string()));
        attrs.insert("age".to_string(), Value::Int(30));
        attrs.insert("balance".to_string(), Value::Float(1.5));
        attrs.insert("active".to_string(), Value::Bool(true));
        attrs.insert("nothing".to_string(), Value::Null);

        let bytes = codec.encode(&attrs, &[]).unwrap();
        let refs = FakeRefs { objects: RefCell::new(HashMap::new()) };
        let decoded = codec.decode(&bytes, &[], &refs, no_blob_host()).unwrap();
        assert_eq!(decoded, attrs);
    }

    struct NullHost;
    impl crate::object::DatabaseHandle for NullHost {
        fn materialize(&self, _oid: Oid) -> CResult<(AttrMap, crate::oid::Serial)> {
            Ok((AttrMap::new(), 0))
        }
    }

    #[test]
    fn object_reference_round_trips_through_oid() {
        let codec = AttrCodec::new();
        let referenced = Handle::new_local(AttrMap::new());
        let host: Arc<dyn crate::object::DatabaseHandle> = Arc::new(NullHost);
        referenced.assign_oid(Oid::new(7), Arc::downgrade(&host));

        let mut attrs = AttrMap::new();
        attrs.insert("friend".to_string(), Value::Object(referenced.clone()));
        let bytes = codec.encode(&attrs, &[]).unwrap();

        let mut objects = HashMap::new();
        objects.insert(7u64, referenced.clone());
        let refs = FakeRefs { objects: RefCell::new(objects) };
        let decoded = codec.decode(&bytes, &[], &refs, no_blob_host()).unwrap();
        match decoded.get("friend").unwrap() {
            Value::Object(h) => assert_eq!(h.oid(), Some(Oid::new(7))),
            other => panic!("expected Value::Object, got {other:?}"),
        }
    }

    #[test]
    fn encode_rejects_unpersisted_reference() {
        let codec = AttrCodec::new();
        let unsaved = Handle::new_local(AttrMap::new());
        let mut attrs = AttrMap::new();
        attrs.insert("friend".to_string(), Value::Object(unsaved));
        assert!(codec.encode(&attrs, &[]).is_err());
    }

    #[test]
    fn encode_rejects_uncommitted_blob() {
        let codec = AttrCodec::new();
        let mut attrs = AttrMap::new();
        attrs.insert("payload".to_string(), Value::Blob(PersistentBlob::new(b"hi".to_vec())));
        assert!(codec.encode(&attrs, &[]).is_err());
    }

    #[test]
    fn committed_blob_round_trips_through_its_span() {
        let codec = AttrCodec::new();
        let blob = PersistentBlob::from_committed(40, 3, no_blob_host());
        let mut attrs = AttrMap::new();
        attrs.insert("payload".to_string(), Value::Blob(blob));
        let bytes = codec.encode(&attrs, &[(40, 3)]).unwrap();

        let refs = FakeRefs { objects: RefCell::new(HashMap::new()) };
        let decoded = codec.decode(&bytes, &[(40, 3)], &refs, no_blob_host()).unwrap();
        match decoded.get("payload").unwrap() {
            Value::Blob(b) => assert!(b.is_committed()),
            other => panic!("expected Value::Blob, got {other:?}"),
        }
    }
}
