//! `STRING` record: UTF-8 text in one of three size classes (small, medium,
//! large). Large strings chain `BLOCK` records through a `LIST`.

use crate::error::{Error, Result};
use crate::id::{RecordId, SegmentId};
use crate::record::block::{chunk, read_block, write_block};
use crate::record::list::{list_get, list_len, write_list};
use crate::record::{make_ref, resolve, RecordRef, MEDIUM_LIMIT, SMALL_LIMIT};
use crate::segment::{Builder, Segment, SegmentSource};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

const TAG_MEDIUM: u8 = 0x80;
const TAG_LARGE: u8 = 0xC0;

/// Writes `s` as a `STRING` record, returning its offset.
pub fn write_string(builder: &mut Builder, current_segment: SegmentId, s: &[u8]) -> Result<u32> {
    if s.len() <= SMALL_LIMIT {
        let mut buf = Vec::with_capacity(1 + s.len());
        buf.push(s.len() as u8);
        buf.extend_from_slice(s);
        return Ok(builder.write_record(&buf));
    }

    if s.len() <= MEDIUM_LIMIT {
        let mut buf = Vec::with_capacity(3 + s.len());
        buf.push(TAG_MEDIUM);
        buf.write_u16::<BigEndian>(s.len() as u16)?;
        buf.extend_from_slice(s);
        return Ok(builder.write_record(&buf));
    }

    let mut block_ids = Vec::new();
    for piece in chunk(s) {
        let offset = write_block(builder, piece);
        block_ids.push(RecordId::new(current_segment, offset));
    }
    let list_offset = write_list(builder, current_segment, &block_ids)?;

    let mut buf = Vec::with_capacity(9 + RecordRef::WIRE_LEN as usize);
    buf.push(TAG_LARGE);
    buf.write_u64::<BigEndian>(s.len() as u64)?;
    let r = make_ref(builder, current_segment, RecordId::new(current_segment, list_offset))?;
    r.encode(&mut buf)?;
    Ok(builder.write_record(&buf))
}

/// Reads a `STRING` record at `offset`.
pub fn read_string(source: &dyn SegmentSource, segment: &Segment, offset: u32) -> Result<Vec<u8>> {
    let cursor = segment.cursor();
    let tag = cursor.read_byte(offset)?;

    if tag & 0x80 == 0 {
        let len = tag as usize;
        return Ok(cursor.read_bytes(offset + 1, len)?.to_vec());
    }

    if tag == TAG_MEDIUM {
        let len = cursor.read_short(offset + 1)? as usize;
        return Ok(cursor.read_bytes(offset + 3, len)?.to_vec());
    }

    if tag == TAG_LARGE {
        let len = cursor.read_long(offset + 1)? as usize;
        let (r, _) = RecordRef::decode(&cursor, offset + 9)?;
        let list_record = resolve(segment, r)?;

        let list_segment = if list_record.segment_id == segment.id() {
            segment.clone()
        } else {
            source.load(list_record.segment_id)?
        };

        let block_count = list_len(&list_segment, list_record.offset)?;
        let mut out = Vec::with_capacity(len);

        for i in 0..block_count {
            let block_id = list_get(source, &list_segment, list_record.offset, i)?;
            let block_segment = if block_id.segment_id == list_segment.id() {
                list_segment.clone()
            } else {
                source.load(block_id.segment_id)?
            };

            let remaining = len - out.len();
            let this_len = remaining.min(crate::record::block::MAX_BLOCK_SIZE);
            out.extend_from_slice(read_block(&block_segment.cursor(), block_id.offset, this_len)?);
        }

        return Ok(out);
    }

    Err(Error::Decode(format!("unknown string tag {tag:#x}")))
}
