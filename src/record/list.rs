//! `LIST` record: a length-prefixed, complete `LEVEL_SIZE`-ary tree of
//! record ids. Indexing by position is `O(log_LEVEL_SIZE N)`.

use crate::error::{Error, Result};
use crate::id::{RecordId, SegmentId};
use crate::record::{make_ref, resolve, RecordRef, LEVEL_SIZE};
use crate::segment::{Builder, Segment, SegmentSource};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

const TAG_LEAF: u8 = 0;
const TAG_BRANCH: u8 = 1;

fn depth_for(n: usize) -> u32 {
    if n <= 1 {
        return 1;
    }
    let mut depth = 1u32;
    let mut capacity = LEVEL_SIZE as u128;
    while (capacity as usize) < n {
        capacity *= LEVEL_SIZE as u128;
        depth += 1;
    }
    depth
}

fn child_capacity(depth: u32) -> usize {
    LEVEL_SIZE.pow(depth - 1)
}

/// Writes `entries` as a list record, returning the offset of its root node.
pub fn write_list(
    builder: &mut Builder,
    current_segment: SegmentId,
    entries: &[RecordId],
) -> Result<u32> {
    write_level(builder, current_segment, entries, depth_for(entries.len()))
}

fn write_level(
    builder: &mut Builder,
    current_segment: SegmentId,
    entries: &[RecordId],
    depth: u32,
) -> Result<u32> {
    if depth <= 1 {
        let mut buf = Vec::new();
        buf.write_u8(TAG_LEAF)?;
        buf.write_u32::<BigEndian>(entries.len() as u32)?;
        for entry in entries {
            let r = make_ref(builder, current_segment, *entry)?;
            r.encode(&mut buf)?;
        }
        return Ok(builder.write_record(&buf));
    }

    let capacity = child_capacity(depth);
    let mut child_ids = Vec::new();
    for chunk in entries.chunks(capacity) {
        let offset = write_level(builder, current_segment, chunk, depth - 1)?;
        child_ids.push(RecordId::new(current_segment, offset));
    }

    let mut buf = Vec::new();
    buf.write_u8(TAG_BRANCH)?;
    buf.write_u32::<BigEndian>(entries.len() as u32)?;
    buf.write_u32::<BigEndian>(capacity as u32)?;
    for child in &child_ids {
        let r = make_ref(builder, current_segment, *child)?;
        r.encode(&mut buf)?;
    }
    Ok(builder.write_record(&buf))
}

/// Number of entries stored under the list rooted at `offset`.
pub fn list_len(segment: &Segment, offset: u32) -> Result<usize> {
    let cursor = segment.cursor();
    let tag = cursor.read_byte(offset)?;
    match tag {
        TAG_LEAF | TAG_BRANCH => Ok(cursor.read_int(offset + 1)? as usize),
        other => Err(Error::Decode(format!("unknown list tag {other}"))),
    }
}

/// Reads the entry at position `index` in the list rooted at `offset`.
pub fn list_get(
    source: &dyn SegmentSource,
    segment: &Segment,
    offset: u32,
    index: usize,
) -> Result<RecordId> {
    let cursor = segment.cursor();
    let tag = cursor.read_byte(offset)?;
    let count = cursor.read_int(offset + 1)? as usize;

    if index >= count {
        return Err(Error::Decode(format!(
            "list index {index} out of range (len {count})"
        )));
    }

    match tag {
        TAG_LEAF => {
            let (r, _) = RecordRef::decode(&cursor, offset + 5 + RecordRef::WIRE_LEN * index as u32)?;
            resolve(segment, r)
        }
        TAG_BRANCH => {
            let capacity = cursor.read_int(offset + 5)? as usize;
            let child_index = index / capacity;
            let child_pos = index % capacity;

            let (r, _) =
                RecordRef::decode(&cursor, offset + 9 + RecordRef::WIRE_LEN * child_index as u32)?;
            let child_segment_id = segment.resolve_ref_index(r.ref_index)?;
            let child_segment = if child_segment_id == segment.id() {
                segment.clone()
            } else {
                source.load(child_segment_id)?
            };

            list_get(source, &child_segment, r.offset, child_pos)
        }
        other => Err(Error::Decode(format!("unknown list tag {other}"))),
    }
}

/// Materializes the whole list, in order. Prefer [`list_get`] for point
/// lookups on large lists.
pub fn list_to_vec(
    source: &dyn SegmentSource,
    segment: &Segment,
    offset: u32,
) -> Result<Vec<RecordId>> {
    let len = list_len(segment, offset)?;
    (0..len)
        .map(|i| list_get(source, segment, offset, i))
        .collect()
}
