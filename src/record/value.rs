//! `VALUE` record: a property's blob payload. Shares the small/medium/large
//! size classes with `STRING`, plus two external reference modes used by
//! blobs that live outside the record tree entirely (see
//! [`crate::node_store::NodeStore::create_blob`]).

use crate::error::{Error, Result};
use crate::id::SegmentId;
use crate::record::string::{read_string, write_string};
use crate::record::{make_ref, resolve, RecordRef};
use crate::segment::{Builder, Segment, SegmentSource};
use byteorder::WriteBytesExt;

const TAG_EXTERNAL_SHORT_MASK: u8 = 0xE0;
const TAG_EXTERNAL_LONG: u8 = 0xF0;
const EXTERNAL_SHORT_MAX_LEN: usize = 0x0F;

/// Writes `bytes` inline, using the same size classes as `STRING`.
pub fn write_inline(builder: &mut Builder, current_segment: SegmentId, bytes: &[u8]) -> Result<u32> {
    write_string(builder, current_segment, bytes)
}

/// Reads an inline value written with [`write_inline`].
pub fn read_inline(source: &dyn SegmentSource, segment: &Segment, offset: u32) -> Result<Vec<u8>> {
    read_string(source, segment, offset)
}

/// Writes `blob_id` (an opaque identifier for out-of-tree blob storage, e.g.
/// a chain of `BULK` segment ids) as an external reference, choosing the
/// short inline form when it fits in 15 bytes and falling back to a `STRING`
/// record otherwise.
pub fn write_external(
    builder: &mut Builder,
    current_segment: SegmentId,
    blob_id: &str,
) -> Result<u32> {
    let id_bytes = blob_id.as_bytes();

    if id_bytes.len() <= EXTERNAL_SHORT_MAX_LEN {
        let mut buf = Vec::with_capacity(1 + id_bytes.len());
        buf.push(TAG_EXTERNAL_SHORT_MASK | (id_bytes.len() as u8));
        buf.extend_from_slice(id_bytes);
        return Ok(builder.write_record(&buf));
    }

    let id_string_offset = write_string(builder, current_segment, id_bytes)?;
    let mut buf = Vec::with_capacity(1 + RecordRef::WIRE_LEN as usize);
    buf.write_u8(TAG_EXTERNAL_LONG)?;
    let r = make_ref(
        builder,
        current_segment,
        crate::id::RecordId::new(current_segment, id_string_offset),
    )?;
    r.encode(&mut buf)?;
    Ok(builder.write_record(&buf))
}

/// Reads an external blob-id reference written with [`write_external`].
pub fn read_external(source: &dyn SegmentSource, segment: &Segment, offset: u32) -> Result<String> {
    let cursor = segment.cursor();
    let tag = cursor.read_byte(offset)?;

    if tag & 0xF0 == TAG_EXTERNAL_SHORT_MASK {
        let len = (tag & 0x0F) as usize;
        let bytes = cursor.read_bytes(offset + 1, len)?;
        return String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Decode(format!("external short id not utf-8: {e}")));
    }

    if tag == TAG_EXTERNAL_LONG {
        let (r, _) = RecordRef::decode(&cursor, offset + 1)?;
        let target = resolve(segment, r)?;
        let target_segment = if target.segment_id == segment.id() {
            segment.clone()
        } else {
            source.load(target.segment_id)?
        };
        let bytes = read_string(source, &target_segment, target.offset)?;
        return String::from_utf8(bytes)
            .map_err(|e| Error::Decode(format!("external long id not utf-8: {e}")));
    }

    Err(Error::Decode(format!("unknown value external tag {tag:#x}")))
}

/// `true` if the byte at `offset` is tagged as one of the two external
/// reference forms (as opposed to an inline small/medium/large value).
pub fn is_external(segment: &Segment, offset: u32) -> Result<bool> {
    let tag = segment.cursor().read_byte(offset)?;
    Ok(tag & 0xE0 == TAG_EXTERNAL_SHORT_MASK || tag == TAG_EXTERNAL_LONG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{SegmentKind, Version};
    use test_log::test;

    struct Null;
    impl SegmentSource for Null {
        fn load(&self, id: SegmentId) -> Result<Segment> {
            Err(Error::SegmentNotFound(id))
        }
    }

    #[test]
    fn inline_roundtrip() -> Result<()> {
        let segment_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut builder = Builder::new(0);
        let offset = write_inline(&mut builder, segment_id, b"blob bytes")?;
        let (bytes, _) = builder.seal(segment_id)?;
        let segment = Segment::parse(segment_id, bytes.into())?;

        assert!(!is_external(&segment, offset)?);
        assert_eq!(read_inline(&Null, &segment, offset)?, b"blob bytes");
        Ok(())
    }

    #[test]
    fn external_short_roundtrip() -> Result<()> {
        let segment_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut builder = Builder::new(0);
        let offset = write_external(&mut builder, segment_id, "abc123")?;
        let (bytes, _) = builder.seal(segment_id)?;
        let segment = Segment::parse(segment_id, bytes.into())?;

        assert!(is_external(&segment, offset)?);
        assert_eq!(read_external(&Null, &segment, offset)?, "abc123");
        Ok(())
    }

    #[test]
    fn external_long_roundtrip() -> Result<()> {
        let segment_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut builder = Builder::new(0);
        let long_id = "bulk-segment-chain-".to_string() + &"a".repeat(40);
        let offset = write_external(&mut builder, segment_id, &long_id)?;
        let (bytes, _) = builder.seal(segment_id)?;
        let segment = Segment::parse(segment_id, bytes.into())?;

        assert!(is_external(&segment, offset)?);
        assert_eq!(read_external(&Null, &segment, offset)?, long_id);
        Ok(())
    }
}
