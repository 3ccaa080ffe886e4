//! Records and the shared record-reference encoding.
//!
//! A record reference is the 8-byte `ptr` of a leaf slot or the `rid` of a
//! duplicate-table entry, plus flag bits: empty records store nothing, tiny
//! records (< 8 bytes) live in the pointer itself with their size in its
//! high byte, 8-byte records fill the pointer, and everything larger is a
//! blob id.

use crate::{
    blob,
    env::EnvState,
    error::Error,
    types::{DbResult, Result},
};

/// A record passed to or returned from the database.
///
/// `size` is the total record size. With `InsertFlags::PARTIAL`, `data`
/// holds only the `partial_size` bytes to be written at `partial_offset`;
/// everything outside that window is zero-filled for a fresh record and
/// left untouched on overwrite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub data: Vec<u8>,
    pub size: u32,
    pub partial_offset: u32,
    pub partial_size: u32,
}

impl Record {
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            size: data.len() as u32,
            partial_offset: 0,
            partial_size: 0,
        }
    }

    pub fn partial(size: u32, partial_offset: u32, data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            size,
            partial_offset,
            partial_size: data.len() as u32,
        }
    }

    pub(crate) fn validate_partial(&self) -> DbResult {
        if self.partial_size as usize != self.data.len() {
            return Err(Error::InvalidParameter);
        }
        if self.partial_offset as u64 + self.partial_size as u64 > self.size as u64 {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    /// A partial write covering the full record is a plain write.
    pub(crate) fn is_effectively_full(&self) -> bool {
        self.partial_offset == 0 && self.partial_size == self.size
    }
}

// persisted slot/entry flag bits
pub(crate) const KEY_FLAG_EXTENDED: u8 = 0x01;
pub(crate) const KEY_FLAG_HAS_DUPLICATES: u8 = 0x02;
pub(crate) const REC_FLAG_INLINE_TINY: u8 = 0x04;
pub(crate) const REC_FLAG_INLINE_SMALL: u8 = 0x08;
pub(crate) const REC_FLAG_EMPTY: u8 = 0x10;

pub(crate) const REC_FLAGS_MASK: u8 =
    REC_FLAG_INLINE_TINY | REC_FLAG_INLINE_SMALL | REC_FLAG_EMPTY;

fn is_inline(flags: u8) -> bool {
    flags & REC_FLAGS_MASK != 0
}

fn decode_inline(rid: u64, flags: u8) -> Vec<u8> {
    let bytes = rid.to_le_bytes();
    if flags & REC_FLAG_EMPTY != 0 {
        Vec::new()
    } else if flags & REC_FLAG_INLINE_TINY != 0 {
        let len = bytes[7] as usize;
        bytes[..len].to_vec()
    } else {
        bytes.to_vec()
    }
}

fn encode_inline(content: &[u8]) -> (u64, u8) {
    debug_assert!(content.len() <= 8);
    if content.is_empty() {
        return (0, REC_FLAG_EMPTY);
    }
    let mut bytes = [0u8; 8];
    bytes[..content.len()].copy_from_slice(content);
    if content.len() == 8 {
        (u64::from_le_bytes(bytes), REC_FLAG_INLINE_SMALL)
    } else {
        bytes[7] = content.len() as u8;
        (u64::from_le_bytes(bytes), REC_FLAG_INLINE_TINY)
    }
}

/// Store a record, reusing `old` when one exists. Returns the new record
/// reference; the returned flags carry only record bits.
pub(crate) fn store_record(
    state: &mut EnvState,
    old: Option<(u64, u8)>,
    record: &Record,
    partial: bool,
) -> Result<(u64, u8)> {
    let mut partial = partial;
    if partial {
        record.validate_partial()?;
        if record.is_effectively_full() {
            partial = false;
        }
    }
    if !partial && record.data.len() != record.size as usize {
        return Err(Error::InvalidParameter);
    }

    let old_blob = match old {
        Some((rid, flags)) if !is_inline(flags) && rid != 0 => Some(rid),
        _ => None,
    };

    // the blob manager resolves partial windows itself; only transitions
    // from or to inline storage need the full content materialized here
    if record.size as usize > 8 {
        let rid = match old_blob {
            Some(old_id) => blob::overwrite(state, old_id, record, partial)?,
            None => {
                if let Some((old_rid, old_flags)) = old {
                    // inline -> blob with a partial window: seed with the
                    // old inline content
                    if partial {
                        let mut content = decode_inline(old_rid, old_flags);
                        content.resize(record.size as usize, 0);
                        let window = record.partial_offset as usize;
                        content[window..window + record.data.len()]
                            .copy_from_slice(&record.data);
                        let full = Record::from_slice(&content);
                        return Ok((blob::allocate(state, &full, false)?, 0));
                    }
                }
                blob::allocate(state, record, partial)?
            }
        };
        return Ok((rid, 0));
    }

    // inline result; resolve the partial window against the old content
    let mut content = if partial {
        match old {
            Some((rid, flags)) if is_inline(flags) => decode_inline(rid, flags),
            Some(_) => blob::read(state, old.unwrap().0, None)?,
            None => Vec::new(),
        }
    } else {
        record.data.clone()
    };
    if partial {
        content.resize(record.size as usize, 0);
        let window = record.partial_offset as usize;
        content[window..window + record.data.len()].copy_from_slice(&record.data);
    }

    if let Some(old_id) = old_blob {
        blob::free(state, old_id)?;
    }
    Ok(encode_inline(&content))
}

/// Materialize a record's bytes. `window` reads a partial range.
pub(crate) fn fetch_record(
    state: &mut EnvState,
    rid: u64,
    flags: u8,
    window: Option<(u32, u32)>,
) -> Result<Vec<u8>> {
    if is_inline(flags) {
        let content = decode_inline(rid, flags);
        return Ok(match window {
            Some((offset, size)) => {
                let start = std::cmp::min(offset as usize, content.len());
                let end = std::cmp::min(start + size as usize, content.len());
                content[start..end].to_vec()
            }
            None => content,
        });
    }
    blob::read(state, rid, window)
}


/// Release a record's backing storage.
pub(crate) fn free_record(state: &mut EnvState, rid: u64, flags: u8) -> DbResult {
    if !is_inline(flags) && rid != 0 {
        blob::free(state, rid)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_encoding_round_trip() {
        let (rid, flags) = encode_inline(b"abc");
        assert_eq!(flags, REC_FLAG_INLINE_TINY);
        assert_eq!(decode_inline(rid, flags), b"abc".to_vec());

        let (rid, flags) = encode_inline(b"12345678");
        assert_eq!(flags, REC_FLAG_INLINE_SMALL);
        assert_eq!(decode_inline(rid, flags), b"12345678".to_vec());

        let (rid, flags) = encode_inline(b"");
        assert_eq!(flags, REC_FLAG_EMPTY);
        assert_eq!(rid, 0);
        assert!(decode_inline(rid, flags).is_empty());
    }

    #[test]
    fn tiny_record_keeps_size_in_the_high_byte() {
        let (rid, _) = encode_inline(b"xy");
        assert_eq!(rid.to_le_bytes()[7], 2);
    }
}
