//! Persisted residency status.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! +---------+---------+-----------+-----------+----------------+---------+
//! | magic 8 | ver u16 | size u64  | page u64  | bitmap blocks  | crc u32 |
//! +---------+---------+-----------+-----------+----------------+---------+
//! ```
//!
//! The checksum covers everything before it, so a partial write is
//! detected before any field is relied on. A status file whose declared
//! geometry disagrees with the cache file it accompanies is invalid and is
//! discarded by the caller (full refetch), never repaired.

use super::{residency::ResidencyTable, Error};
use bytes::{Buf, BufMut};

const MAGIC: &[u8; 8] = b"pgstatus";
const VERSION: u16 = 1;

/// Fixed bytes before the bitmap.
const HEADER: usize = 8 + 2 + 8 + 8;

/// Serialize the status for `table` guarding a dataset of `file_size`
/// bytes split into `page_size` pages.
pub(super) fn encode(file_size: u64, page_size: u64, table: &ResidencyTable) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER + table.blocks().len() + 4);
    buf.put_slice(MAGIC);
    buf.put_u16(VERSION);
    buf.put_u64(file_size);
    buf.put_u64(page_size);
    buf.put_slice(table.blocks());
    let checksum = crc32fast::hash(&buf);
    buf.put_u32(checksum);
    buf
}

/// Parse persisted status, validating it against the geometry the session
/// expects. Every header field is checked before the bitmap is touched.
pub(super) fn decode(
    mut buf: &[u8],
    file_size: u64,
    page_size: u64,
) -> Result<ResidencyTable, Error> {
    if buf.len() < HEADER + 4 {
        return Err(Error::CorruptStatus);
    }
    let stored = u32::from_be_bytes(buf[buf.len() - 4..].try_into().unwrap());
    let computed = crc32fast::hash(&buf[..buf.len() - 4]);
    if stored != computed {
        return Err(Error::CorruptStatus);
    }
    buf = &buf[..buf.len() - 4];

    let mut magic = [0u8; 8];
    buf.copy_to_slice(&mut magic);
    if &magic != MAGIC {
        return Err(Error::CorruptStatus);
    }
    if buf.get_u16() != VERSION {
        return Err(Error::CorruptStatus);
    }
    if buf.get_u64() != file_size || buf.get_u64() != page_size {
        return Err(Error::CorruptStatus);
    }

    let pages = (file_size.div_ceil(page_size)) as usize;
    ResidencyTable::from_blocks(buf.to_vec(), pages).ok_or(Error::CorruptStatus)
}
