use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fs4::FileExt;

use crate::error::{CResult, Error};
use crate::log::record::{Trailer, FILE_MAGIC, TAG_BLB, TAG_OBJ, TRAILER_LEN};
use crate::oid::{Oid, TxId};

const HEADER_LEN: u64 = 8;

/// One fully-formed, successfully committed (or recorded-failed)
/// transaction, as replayed by [`Log::tx_catch_up`].
pub struct TransactionRecord {
    pub txid: TxId,
    /// `(oid, codec-encoded attribute bytes)` for every object touched.
    /// Empty for a failure-marker trailer.
    pub objects: Vec<(Oid, Vec<u8>)>,
    /// `(file offset of raw bytes, length)` for every blob payload appended
    /// in this transaction, in append order.
    pub blobs: Vec<(u64, u64)>,
    pub is_failure: bool,
}

/// The append-only transaction log. A single `Log` is shared by every
/// thread of this process that opened the same database; cross-process
/// coordination goes through advisory locks on the file itself.
pub struct Log {
    path: PathBuf,
    data: Mutex<File>,
    /// End offset of transaction `i` (1-indexed); `trailer_ends[0]` is the
    /// offset right after the file header, i.e. where txid 1 would start.
    trailer_ends: Mutex<Vec<u64>>,
    next_oid: AtomicU64,
    fsync: bool,
    locking: bool,
}

impl Log {
    pub fn open(path: PathBuf, create: bool, locking: bool, fsync: bool) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)?;

        let log = Log {
            path,
            data: Mutex::new(file),
            trailer_ends: Mutex::new(vec![HEADER_LEN]),
            next_oid: AtomicU64::new(0),
            fsync,
            locking,
        };

        log.recover_and_index()?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of transactions persisted so far, including recorded
    /// failures.
    pub fn tx_count(&self) -> u64 {
        (self.trailer_ends.lock().unwrap().len() - 1) as u64
    }

    /// Allocates a fresh OID. Only safe to call while holding the exclusive
    /// commit lock (via a live [`WriteGuard`]) after a catch-up, so that the
    /// counter reflects every object ever observed durably.
    pub fn new_oid(&self) -> Oid {
        Oid::new(self.next_oid.fetch_add(1, Ordering::SeqCst))
    }

    fn observe_oid(&self, oid: Oid) {
        let mut cur = self.next_oid.load(Ordering::SeqCst);
        let candidate = oid.value() + 1;
        while candidate > cur {
            match self.next_oid.compare_exchange(
                cur,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Scans backward from EOF for the most recent well-formed trailer,
    /// truncating trailing bytes left by a crashed writer, then scans
    /// forward once to build the in-memory trailer-offset index and seed
    /// the OID counter. Runs once at open.
    fn recover_and_index(&self) -> CResult<()> {
        let mut file = self.data.lock().unwrap();
        let file_len = file.metadata()?.len();

        if file_len == 0 {
            file.write_all(FILE_MAGIC)?;
            file.sync_all()?;
            return Ok(());
        }

        let mut magic = [0u8; HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut magic)?;
        if &magic != FILE_MAGIC {
            return Err(Error::Storage(format!(
                "{}: not a podb log file (bad magic)",
                self.path.display()
            )));
        }

        let mut end = file_len;
        let good_end = loop {
            if end < HEADER_LEN + TRAILER_LEN {
                break HEADER_LEN;
            }
            match self.try_read_trailer_ending_at(&mut file, end) {
                Some(tx_start) => {
                    // Verify the transaction body between tx_start and the
                    // trailer's own start is intact.
                    let trailer_start = end - TRAILER_LEN;
                    if tx_start <= trailer_start
                        && self.verify_span(&mut file, tx_start, trailer_start).is_ok()
                    {
                        break end;
                    }
                    end -= 1;
                }
                None => end -= 1,
            }
        };

        if good_end < file_len {
            log::warn!(
                "{}: truncating {} trailing bytes left by an incomplete writer",
                self.path.display(),
                file_len - good_end
            );
            file.set_len(good_end)?;
            file.sync_all()?;
        }

        // Forward scan to rebuild the trailer index and OID counter.
        let mut pos = HEADER_LEN;
        let mut ends = vec![HEADER_LEN];
        while pos < good_end {
            let (_trailer, objects, end) = self.read_transaction_at(&mut file, pos)?;
            for (oid, _) in &objects {
                self.observe_oid(*oid);
            }
            pos = end;
            ends.push(pos);
        }

        log::info!(
            "{}: recovered {} transactions ({} bytes)",
            self.path.display(),
            ends.len() - 1,
            good_end
        );

        *self.trailer_ends.lock().unwrap() = ends;
        Ok(())
    }

    /// Returns `Some(prev_trailer_offset)` if a syntactically valid trailer
    /// ends exactly at `end`.
    fn try_read_trailer_ending_at(&self, file: &mut File, end: u64) -> Option<u64> {
        if end < TRAILER_LEN {
            return None;
        }
        let start = end - TRAILER_LEN;
        let mut buf = vec![0u8; TRAILER_LEN as usize];
        file.seek(SeekFrom::Start(start)).ok()?;
        file.read_exact(&mut buf).ok()?;
        let mut cursor = Cursor::new(buf);
        let trailer = Trailer::read_from(&mut cursor).ok()?;
        Some(trailer.prev_trailer_offset)
    }

    /// Recomputes the CRC of the transaction body in `[start, end)` and
    /// compares it against the trailer immediately following `end`.
    fn verify_span(&self, file: &mut File, start: u64, end: u64) -> CResult<()> {
        let mut body = vec![0u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut body)?;
        let mut trailer_buf = vec![0u8; TRAILER_LEN as usize];
        file.read_exact(&mut trailer_buf)?;
        let trailer = Trailer::read_from(&mut Cursor::new(trailer_buf))?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        if hasher.finalize() != trailer.crc32 {
            return Err(Error::Storage("crc mismatch".to_string()));
        }

        let n_objs = count_obj_records(&body)?;
        if n_objs != trailer.n_objs {
            return Err(Error::Storage("object count mismatch".to_string()));
        }
        Ok(())
    }

    /// Reads one full transaction (object/blob records + trailer) starting
    /// at `pos`, returning the trailer and the decoded `(oid, bytes)` pairs.
    /// Does not look at blob payload bytes beyond recording their span.
    fn read_transaction_at(
        &self,
        file: &mut File,
        pos: u64,
    ) -> CResult<(Trailer, Vec<(Oid, Vec<u8>)>, u64)> {
        let (trailer, objects, _blobs, end) = self.parse_transaction(file, pos)?;
        Ok((trailer, objects, end))
    }

    /// Parses one transaction's records starting at `pos`, returning the
    /// trailer, decoded objects, blob spans, and the byte offset right
    /// after the trailer (where the next transaction, if any, begins).
    fn parse_transaction(
        &self,
        file: &mut File,
        pos: u64,
    ) -> CResult<(Trailer, Vec<(Oid, Vec<u8>)>, Vec<(u64, u64)>, u64)> {
        let mut cursor = pos;
        let mut objects = Vec::new();
        let mut blobs = Vec::new();
        loop {
            let mut tag = [0u8; 1];
            file.seek(SeekFrom::Start(cursor))?;
            file.read_exact(&mut tag)?;
            match tag[0] {
                TAG_OBJ => {
                    let len = file.read_u32::<LittleEndian>()? as usize;
                    let mut payload = vec![0u8; len];
                    file.read_exact(&mut payload)?;
                    if payload.len() < 8 {
                        return Err(Error::Storage("truncated object payload".to_string()));
                    }
                    let oid = Oid::new(u64::from_le_bytes(payload[..8].try_into().unwrap()));
                    objects.push((oid, payload[8..].to_vec()));
                    cursor += 1 + 4 + len as u64;
                }
                TAG_BLB => {
                    let len = file.read_u64::<LittleEndian>()?;
                    let payload_offset = cursor + 1 + 8;
                    blobs.push((payload_offset, len));
                    cursor = payload_offset + len;
                }
                crate::log::record::TAG_TX => {
                    file.seek(SeekFrom::Start(cursor))?;
                    let trailer = Trailer::read_from(file)?;
                    let end = cursor + TRAILER_LEN;
                    return Ok((trailer, objects, blobs, end));
                }
                other => {
                    return Err(Error::Storage(format!("unknown record tag {other}")));
                }
            }
        }
    }

    /// Acquires the exclusive commit lock, blocking other writers in this
    /// process and (via an advisory file lock) in any other process
    /// sharing the file.
    pub fn tx_begin_write(&self) -> CResult<WriteGuard<'_>> {
        let guard = self.data.lock().unwrap();
        if self.locking {
            guard.lock_exclusive().map_err(|e| {
                Error::Storage(format!("failed to acquire commit lock: {e}"))
            })?;
        }
        let base_offset = guard.metadata()?.len();
        Ok(WriteGuard {
            log: self,
            file: guard,
            buffer: Vec::new(),
            blob_spans: Vec::new(),
            n_objs: 0,
            base_offset,
            finished: false,
        })
    }

    /// Replays every transaction committed after `last_seen_txid`, under a
    /// shared lock, newest-available state included.
    pub fn tx_catch_up(&self, last_seen_txid: TxId) -> CResult<Vec<TransactionRecord>> {
        let mut file = self.data.lock().unwrap();
        if self.locking {
            file.lock_shared().map_err(|e| {
                Error::Storage(format!("failed to acquire shared lock: {e}"))
            })?;
        }
        let result = self.catch_up_locked(&mut file, last_seen_txid);
        if self.locking {
            let _ = file.unlock();
        }
        result
    }

    /// Scans the file for any transactions appended since this handle last
    /// indexed it — by another process, or another `Database` sharing the
    /// same file in this one — extending `trailer_ends` in place. The
    /// caller must already hold at least a shared lock on `file`.
    fn refresh_index_locked(&self, file: &mut File) -> CResult<()> {
        let file_len = file.metadata()?.len();
        let mut pos = *self.trailer_ends.lock().unwrap().last().unwrap();
        let mut new_ends = Vec::new();
        while pos < file_len {
            let (_trailer, objects, end) = self.read_transaction_at(file, pos)?;
            for (oid, _) in &objects {
                self.observe_oid(*oid);
            }
            pos = end;
            new_ends.push(pos);
        }
        if !new_ends.is_empty() {
            self.trailer_ends.lock().unwrap().extend(new_ends);
        }
        Ok(())
    }

    /// Catch-up logic shared by [`Log::tx_catch_up`] (which takes its own
    /// shared lock) and [`WriteGuard::catch_up`] (which reuses the exclusive
    /// lock a write already holds, since the underlying `Mutex<File>` isn't
    /// reentrant).
    fn catch_up_locked(
        &self,
        file: &mut File,
        last_seen_txid: TxId,
    ) -> CResult<Vec<TransactionRecord>> {
        self.refresh_index_locked(file)?;
        let ends = self.trailer_ends.lock().unwrap().clone();
        let tx_count = (ends.len() - 1) as u64;
        if last_seen_txid >= tx_count {
            return Ok(Vec::new());
        }

        let mut pos = ends[last_seen_txid as usize];
        let mut out = Vec::new();
        for txid in (last_seen_txid + 1)..=tx_count {
            let (trailer, objects, blobs, end) = self.parse_transaction(file, pos)?;
            debug_assert_eq!(trailer.txid, txid);
            pos = end;
            out.push(TransactionRecord {
                txid,
                is_failure: trailer.is_failure_marker(),
                objects,
                blobs,
            });
        }
        Ok(out)
    }

    /// Random-access read of one already-committed transaction by its
    /// `txid`, used to materialize a ghost: the caller looks up which
    /// transaction last wrote a given `oid` (via an in-memory index kept
    /// alongside the Object Registry) and then re-reads that transaction in
    /// full so the object's blob references resolve against the same
    /// transaction's blob list they were encoded against.
    pub fn read_transaction(&self, txid: TxId) -> CResult<TransactionRecord> {
        let ends = self.trailer_ends.lock().unwrap().clone();
        if txid == 0 || txid as usize >= ends.len() {
            return Err(Error::Storage(format!("no such transaction: {txid}")));
        }
        let start = ends[(txid - 1) as usize];
        let mut file = self.data.lock().unwrap();
        let (trailer, objects, blobs, _end) = self.parse_transaction(&mut file, start)?;
        Ok(TransactionRecord { txid: trailer.txid, objects, blobs, is_failure: trailer.is_failure_marker() })
    }

    /// Random-access read of a committed blob payload.
    pub fn read_blob(&self, offset: u64, length: u64) -> CResult<Vec<u8>> {
        let mut file = self.data.lock().unwrap();
        let mut buf = vec![0u8; length as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

fn count_obj_records(body: &[u8]) -> CResult<u32> {
    let mut n = 0u32;
    let mut pos = 0usize;
    while pos < body.len() {
        let tag = body[pos];
        pos += 1;
        match tag {
            TAG_OBJ => {
                let len = u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap()) as usize;
                pos += 4 + len;
                n += 1;
            }
            TAG_BLB => {
                let len = u64::from_le_bytes(body[pos..pos + 8].try_into().unwrap()) as usize;
                pos += 8 + len;
            }
            other => return Err(Error::Storage(format!("unknown record tag {other}"))),
        }
    }
    Ok(n)
}

/// A single in-progress append session holding the exclusive commit lock.
pub struct WriteGuard<'a> {
    log: &'a Log,
    file: std::sync::MutexGuard<'a, File>,
    buffer: Vec<u8>,
    blob_spans: Vec<(u64, u64)>,
    n_objs: u32,
    base_offset: u64,
    finished: bool,
}

impl<'a> WriteGuard<'a> {
    /// Replays every transaction committed after `last_seen_txid`, reusing
    /// this guard's already-held exclusive lock rather than taking a second,
    /// conflicting lock on the same file (the underlying `Mutex<File>` is
    /// not reentrant, so calling `Log::tx_catch_up` here would deadlock).
    pub fn catch_up(&mut self, last_seen_txid: TxId) -> CResult<Vec<TransactionRecord>> {
        self.log.catch_up_locked(&mut self.file, last_seen_txid)
    }

    /// This transaction's blob spans staged so far, in append order — the
    /// same order `TransactionRecord::blobs` will report once committed, so
    /// it can be handed to `AttrCodec::encode` to mint stable ordinal
    /// markers for `Value::Blob` references.
    pub fn blob_spans(&self) -> &[(u64, u64)] {
        &self.blob_spans
    }

    /// Stages an object record: `oid` is embedded as a fixed 8-byte prefix
    /// so the log can index it without invoking the codec.
    pub fn append_object(&mut self, oid: Oid, encoded: &[u8]) {
        let mut payload = Vec::with_capacity(8 + encoded.len());
        payload.write_u64::<LittleEndian>(oid.value()).expect("Vec<u8> writes never fail");
        payload.extend_from_slice(encoded);

        self.buffer.push(TAG_OBJ);
        self.buffer.write_u32::<LittleEndian>(payload.len() as u32).expect("Vec<u8> writes never fail");
        self.buffer.extend_from_slice(&payload);
        self.n_objs += 1;
    }

    /// Stages a blob payload, returning its eventual `(offset, length)`
    /// inside the file once this transaction is committed.
    pub fn append_blob(&mut self, bytes: &[u8]) -> (u64, u64) {
        let header_len = 1 + 8u64;
        let payload_offset = self.base_offset + self.buffer.len() as u64 + header_len;

        self.buffer.push(TAG_BLB);
        self.buffer.write_u64::<LittleEndian>(bytes.len() as u64).expect("Vec<u8> writes never fail");
        self.buffer.extend_from_slice(bytes);

        let span = (payload_offset, bytes.len() as u64);
        self.blob_spans.push(span);
        span
    }

    /// Finalizes the transaction with a real trailer (`n_objs` object
    /// records) and returns the assigned txid.
    pub fn commit(mut self) -> CResult<TxId> {
        let txid = self.write_trailer(self.n_objs)?;
        self.finished = true;
        Ok(txid)
    }

    /// Finalizes the transaction as a recorded failure: the object/blob
    /// bytes staged so far are discarded and a zero-object trailer is
    /// written so `tx_count` still advances.
    pub fn commit_failure_marker(mut self) -> CResult<TxId> {
        self.buffer.clear();
        self.blob_spans.clear();
        self.n_objs = 0;
        let txid = self.write_trailer(0)?;
        self.finished = true;
        Ok(txid)
    }

    fn write_trailer(&mut self, n_objs: u32) -> CResult<TxId> {
        let ends = self.log.trailer_ends.lock().unwrap();
        let prev_trailer_offset = *ends.last().unwrap();
        let txid = (ends.len()) as TxId;
        drop(ends);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.buffer);
        let crc32 = hasher.finalize();

        let trailer = Trailer { txid, n_objs, prev_trailer_offset, crc32 };
        trailer.write_to(&mut self.buffer)?;

        self.file.seek(SeekFrom::Start(self.base_offset))?;
        self.file.write_all(&self.buffer)?;
        if self.log.fsync {
            self.file.sync_all()?;
        }

        let end_offset = self.base_offset + self.buffer.len() as u64;
        self.log.trailer_ends.lock().unwrap().push(end_offset);
        Ok(txid)
    }

    /// Aborts before any bytes reach the file. Equivalent to dropping the
    /// guard, spelled out for readability at call sites.
    pub fn abort(mut self) {
        self.finished = true;
    }
}

impl<'a> Drop for WriteGuard<'a> {
    fn drop(&mut self) {
        if !self.finished {
            log::debug!("write guard dropped without commit() or abort(); discarding");
        }
        if self.log.locking {
            if let Err(err) = self.file.unlock() {
                log::error!("failed to release commit lock: {err}");
            }
        }
    }
}
