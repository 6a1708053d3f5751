//! Persistent binary streams ("blobs"): immutable payloads referenced from
//! an object's attribute map by `(offset, length)` inside the transaction
//! that wrote them, per `spec.md` §3 and §6. Unlike persistent objects,
//! blobs have no durable identifier of their own and never pass through the
//! Object Registry: the on-disk `BLB` record carries no oid, so a blob is
//! only ever reachable by following the reference from the object that
//! embeds it.

use std::io::{self, Cursor, Read};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::error::CResult;

/// Anything that can resolve a committed blob span back into bytes. Kept
/// object-safe and narrow so `PersistentBlob` doesn't need to know about
/// `Database` or the log's on-disk format. Public because `AttrCodec::decode`
/// takes a `Weak<dyn BlobHost>` and the codec itself is meant to be usable
/// outside this crate's own `Database`.
pub trait BlobHost: Send + Sync {
    fn read_blob_span(&self, offset: u64, length: u64) -> CResult<Vec<u8>>;
}

#[derive(Clone)]
enum Location {
    /// Created but not yet durable; bytes live entirely in memory.
    Pending(Arc<Vec<u8>>),
    /// Durable: bytes live in the log and are fetched on demand.
    Committed { offset: u64, length: u64 },
}

struct Inner {
    jar: OnceLock<Weak<dyn BlobHost>>,
    location: Mutex<Location>,
}

/// A handle to an immutable binary payload.
///
/// Cloning a `PersistentBlob` clones the handle, not the bytes: all clones
/// refer to the same underlying stream, mirroring how [`crate::object::Handle`]
/// clones share one object identity.
#[derive(Clone)]
pub struct PersistentBlob(Arc<Inner>);

impl PersistentBlob {
    /// Creates a new, uncommitted blob from in-memory bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        PersistentBlob(Arc::new(Inner {
            jar: OnceLock::new(),
            location: Mutex::new(Location::Pending(Arc::new(bytes))),
        }))
    }

    /// Wraps an already-durable span, as found by decoding a `BlobRef`
    /// marker against the transaction that wrote it.
    pub(crate) fn from_committed(offset: u64, length: u64, jar: Weak<dyn BlobHost>) -> Self {
        let inner = Inner {
            jar: OnceLock::new(),
            location: Mutex::new(Location::Committed { offset, length }),
        };
        let _ = inner.jar.set(jar);
        PersistentBlob(Arc::new(inner))
    }

    pub fn is_committed(&self) -> bool {
        matches!(*self.0.location.lock().unwrap(), Location::Committed { .. })
    }

    /// Bytes staged for append, if this blob hasn't been committed yet.
    pub(crate) fn pending_bytes(&self) -> Option<Arc<Vec<u8>>> {
        match &*self.0.location.lock().unwrap() {
            Location::Pending(bytes) => Some(bytes.clone()),
            Location::Committed { .. } => None,
        }
    }

    pub(crate) fn committed_span(&self) -> Option<(u64, u64)> {
        match *self.0.location.lock().unwrap() {
            Location::Committed { offset, length } => Some((offset, length)),
            Location::Pending(_) => None,
        }
    }

    /// Records that this blob is now durable at `(offset, length)` in the
    /// log owned by `jar`, and releases the in-memory copy so repeat reads
    /// go through the log instead.
    pub(crate) fn mark_committed(&self, offset: u64, length: u64, jar: Weak<dyn BlobHost>) {
        let _ = self.0.jar.set(jar);
        *self.0.location.lock().unwrap() = Location::Committed { offset, length };
    }

    /// Reads the entire payload into memory.
    pub fn read_all(&self) -> CResult<Vec<u8>> {
        match &*self.0.location.lock().unwrap() {
            Location::Pending(bytes) => Ok((**bytes).clone()),
            Location::Committed { offset, length } => {
                let jar = self
                    .0
                    .jar
                    .get()
                    .and_then(|w| w.upgrade())
                    .ok_or_else(|| {
                        crate::error::Error::Storage(
                            "blob's owning database has been closed".to_string(),
                        )
                    })?;
                jar.read_blob_span(*offset, *length)
            }
        }
    }

    /// Opens a forward-only reader over the payload.
    pub fn open_reader(&self) -> CResult<BlobReader> {
        Ok(BlobReader { cursor: Cursor::new(self.read_all()?), closed: false })
    }

    pub fn len(&self) -> CResult<u64> {
        match &*self.0.location.lock().unwrap() {
            Location::Pending(bytes) => Ok(bytes.len() as u64),
            Location::Committed { length, .. } => Ok(*length),
        }
    }

    pub fn is_empty(&self) -> CResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl PartialEq for PersistentBlob {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for PersistentBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentBlob").field("committed", &self.is_committed()).finish()
    }
}

/// A forward-only reader over a blob's bytes. Once exhausted it stays
/// exhausted: further reads return `Ok(0)` rather than re-opening the
/// stream, matching the one-shot iteration a caller expects from a byte
/// stream that has already reached its end.
pub struct BlobReader {
    cursor: Cursor<Vec<u8>>,
    closed: bool,
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        let n = self.cursor.read(buf)?;
        if n == 0 {
            self.closed = true;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_blob_reads_back_its_own_bytes() {
        let blob = PersistentBlob::new(b"hello".to_vec());
        assert!(!blob.is_committed());
        assert_eq!(blob.read_all().unwrap(), b"hello");
        assert_eq!(blob.len().unwrap(), 5);
    }

    #[test]
    fn reader_returns_eof_repeatedly_once_exhausted() {
        let blob = PersistentBlob::new(b"ab".to_vec());
        let mut reader = blob.open_reader().unwrap();
        let mut buf = [0u8; 8];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ab");
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}
