//! Record codec: the higher-level data types (blocks, lists, strings, maps,
//! templates, nodes, properties) encoded on top of segment byte buffers.

pub mod block;
pub mod list;
pub mod map;
pub mod node;
pub mod property;
pub mod string;
pub mod template;
pub mod value;

use crate::error::{Error, Result};
use crate::id::{RecordId, SegmentId};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Branching factor for the list B-tree and the segment-internal alignment
/// unit referenced throughout the record codec.
pub const LEVEL_SIZE: usize = 255;

/// Fan-out of a map's hash-trie branch node.
pub const BUCKETS_PER_LEVEL: usize = 32;

/// Inline small-string / small-blob limit (top bit of the head byte clear).
pub const SMALL_LIMIT: usize = 0x7F;

/// Medium string/blob limit (two-byte length prefix).
pub const MEDIUM_LIMIT: usize = 0x3FFF + SMALL_LIMIT;

/// The type tag stored alongside every root entry in a segment header, and
/// alongside every record id a node/property/list/map stores internally.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum RecordType {
    Block = 0,
    List = 1,
    String = 2,
    Value = 3,
    Map = 4,
    Template = 5,
    Node = 6,
    Property = 7,
}

impl RecordType {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Block),
            1 => Ok(Self::List),
            2 => Ok(Self::String),
            3 => Ok(Self::Value),
            4 => Ok(Self::Map),
            5 => Ok(Self::Template),
            6 => Ok(Self::Node),
            7 => Ok(Self::Property),
            other => Err(Error::Decode(format!("unknown record type tag {other}"))),
        }
    }
}

/// A decoder cursor over a single segment's record payload: random-access
/// big-endian reads at caller-supplied offsets, matching the segment
/// reader's `readByte/readShort/readInt/readLong/readBytes` contract.
#[derive(Clone, Copy)]
pub struct RecordCursor<'a> {
    payload: &'a [u8],
}

impl<'a> RecordCursor<'a> {
    #[must_use]
    pub fn new(payload: &'a [u8]) -> Self {
        Self { payload }
    }

    fn slice_at(&self, offset: u32, len: usize) -> Result<&'a [u8]> {
        let offset = offset as usize;
        self.payload
            .get(offset..offset + len)
            .ok_or_else(|| Error::Decode(format!("record read out of bounds at {offset}")))
    }

    pub fn read_byte(&self, offset: u32) -> Result<u8> {
        Ok(self.slice_at(offset, 1)?[0])
    }

    pub fn read_short(&self, offset: u32) -> Result<u16> {
        let bytes = self.slice_at(offset, 2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_int(&self, offset: u32) -> Result<u32> {
        let bytes = self.slice_at(offset, 4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_long(&self, offset: u32) -> Result<u64> {
        let bytes = self.slice_at(offset, 8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(arr))
    }

    pub fn read_bytes(&self, offset: u32, len: usize) -> Result<&'a [u8]> {
        self.slice_at(offset, len)
    }
}

/// Sentinel ref-index meaning "record lives in this same segment".
const SAME_SEGMENT: u16 = 0xFFFF;

/// An unresolved pointer to another record: either local to the segment
/// currently being decoded, or to one of the segments listed in that
/// segment's `refs` header, addressed by index. This is the wire form every
/// record type uses to point at child records; callers resolve it against
/// the owning [`crate::segment::Segment`] with [`resolve`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RecordRef {
    pub ref_index: Option<u16>,
    pub offset: u32,
}

impl RecordRef {
    #[must_use]
    pub fn same_segment(offset: u32) -> Self {
        Self {
            ref_index: None,
            offset,
        }
    }

    #[must_use]
    pub fn in_segment(ref_index: u16, offset: u32) -> Self {
        Self {
            ref_index: Some(ref_index),
            offset,
        }
    }

    pub fn encode<W: std::io::Write>(&self, out: &mut W) -> Result<()> {
        out.write_u16::<BigEndian>(self.ref_index.unwrap_or(SAME_SEGMENT))?;
        out.write_u32::<BigEndian>(self.offset)?;
        Ok(())
    }

    pub fn decode(cursor: &RecordCursor<'_>, offset: u32) -> Result<(Self, u32)> {
        let raw_index = cursor.read_short(offset)?;
        let ref_offset = cursor.read_int(offset + 2)?;
        let ref_index = if raw_index == SAME_SEGMENT {
            None
        } else {
            Some(raw_index)
        };
        Ok((
            Self {
                ref_index,
                offset: ref_offset,
            },
            offset + Self::WIRE_LEN,
        ))
    }

    /// Bytes a single encoded `RecordRef` occupies.
    pub const WIRE_LEN: u32 = 6;
}

/// Resolves a [`RecordRef`] decoded from `owning_segment` into a fully
/// qualified [`RecordId`], using the owning segment's declared `refs` list.
pub fn resolve(owning_segment: &crate::segment::Segment, r: RecordRef) -> Result<RecordId> {
    let segment_id = owning_segment.resolve_ref_index(r.ref_index)?;
    Ok(RecordId::new(segment_id, r.offset))
}

/// Encodes a `RecordId` as a `RecordRef` relative to `builder`, interning
/// the target segment into the builder's reference list if it isn't the
/// segment currently being built.
pub fn make_ref(
    builder: &mut crate::segment::Builder,
    current_segment: SegmentId,
    target: RecordId,
) -> Result<RecordRef> {
    if target.segment_id == current_segment {
        Ok(RecordRef::same_segment(target.offset))
    } else {
        let idx = builder.add_ref(target.segment_id)?;
        Ok(RecordRef::in_segment(idx, target.offset))
    }
}

/// Rounds `len` up to the next [`crate::id::ALIGN`] boundary.
#[must_use]
pub fn aligned_len(len: usize) -> usize {
    let align = crate::id::ALIGN as usize;
    (len + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn cursor_reads_big_endian() {
        let payload = [0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x03];
        let cursor = RecordCursor::new(&payload);
        assert_eq!(cursor.read_short(0).unwrap(), 1);
        assert_eq!(cursor.read_int(4).unwrap(), 3);
    }

    #[test]
    fn cursor_detects_out_of_bounds() {
        let payload = [0u8; 4];
        let cursor = RecordCursor::new(&payload);
        assert!(cursor.read_long(0).is_err());
    }

    #[test]
    fn aligned_len_rounds_up() {
        assert_eq!(aligned_len(0), 0);
        assert_eq!(aligned_len(1), 16);
        assert_eq!(aligned_len(16), 16);
        assert_eq!(aligned_len(17), 32);
    }
}
