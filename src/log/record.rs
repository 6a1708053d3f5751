//! On-disk record tags and the transaction trailer.
//!
//! ```text
//! file      := magic(8 bytes) record*
//! record    := obj_record* tx_trailer
//! obj_record:= tag(1)=OBJ len(u32) payload(bytes)
//!            | tag(1)=BLB len(u64) payload(bytes)
//! tx_trailer:= tag(1)=TX  txid(u64) n_objs(u32)
//!              prev_trailer_offset(u64) crc32(u32)
//!              magic_end(8 bytes)
//! ```
//!
//! All integers are little-endian. A trailer with `n_objs == 0` records a
//! failed commit attempt: readers skip it when rebuilding object state but
//! count it towards `tx_count`.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{CResult, Error};
use crate::oid::TxId;

/// Identifies the file format and its version. Chosen to be self-describing
/// and unlikely to collide with an unrelated file opened by mistake.
pub const FILE_MAGIC: &[u8; 8] = b"PODBLOG1";

/// Terminates every trailer, giving the crash-recovery scanner a fixed
/// byte pattern to search backwards for.
pub const TRAILER_MAGIC: &[u8; 8] = b"PODBEND\0";

pub const TAG_OBJ: u8 = 1;
pub const TAG_BLB: u8 = 2;
pub const TAG_TX: u8 = 3;

/// Size in bytes of an encoded `Trailer`, header tag included.
pub const TRAILER_LEN: u64 = 1 + 8 + 4 + 8 + 4 + 8;

/// A transaction trailer as it appears on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub txid: TxId,
    pub n_objs: u32,
    pub prev_trailer_offset: u64,
    pub crc32: u32,
}

impl Trailer {
    /// A trailer with `n_objs == 0` marks a recorded commit failure: the
    /// transaction counter still advances, but there is no state to replay.
    pub fn is_failure_marker(&self) -> bool {
        self.n_objs == 0
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> CResult<()> {
        w.write_u8(TAG_TX)?;
        w.write_u64::<LittleEndian>(self.txid)?;
        w.write_u32::<LittleEndian>(self.n_objs)?;
        w.write_u64::<LittleEndian>(self.prev_trailer_offset)?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        w.write_all(TRAILER_MAGIC)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> CResult<Self> {
        let tag = r.read_u8()?;
        if tag != TAG_TX {
            return Err(Error::Storage(format!("expected trailer tag, found {tag}")));
        }
        let txid = r.read_u64::<LittleEndian>()?;
        let n_objs = r.read_u32::<LittleEndian>()?;
        let prev_trailer_offset = r.read_u64::<LittleEndian>()?;
        let crc32 = r.read_u32::<LittleEndian>()?;
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != TRAILER_MAGIC {
            return Err(Error::Storage("bad trailer magic".to_string()));
        }
        Ok(Trailer { txid, n_objs, prev_trailer_offset, crc32 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn trailer_round_trips() {
        let t = Trailer { txid: 42, n_objs: 3, prev_trailer_offset: 128, crc32: 0xdead_beef };
        let mut buf = Vec::new();
        t.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, TRAILER_LEN);
        let mut cursor = Cursor::new(buf);
        let read_back = Trailer::read_from(&mut cursor).unwrap();
        assert_eq!(t, read_back);
    }

    #[test]
    fn failure_marker_has_zero_objs() {
        let t = Trailer { txid: 1, n_objs: 0, prev_trailer_offset: 0, crc32: 0 };
        assert!(t.is_failure_marker());
    }

    #[test]
    fn rejects_truncated_magic() {
        let mut buf = Vec::new();
        buf.push(TAG_TX);
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(b"WRONGMAG");
        let mut cursor = Cursor::new(buf);
        assert!(Trailer::read_from(&mut cursor).is_err());
    }
}
