//! `MAP` record: a hash-trie over 32-bit key hashes, fan-out
//! [`crate::record::BUCKETS_PER_LEVEL`] per level, with `Diff` nodes for
//! structural sharing between successive versions of the same map.

use crate::error::{Error, Result};
use crate::id::{RecordId, SegmentId};
use crate::record::string::{read_string, write_string};
use crate::record::{make_ref, resolve, RecordRef, BUCKETS_PER_LEVEL};
use crate::segment::{Builder, Segment, SegmentSource};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

const TAG_LEAF: u8 = 0;
const TAG_BRANCH: u8 = 1;
const TAG_DIFF: u8 = 2;

const TOMBSTONE: u8 = 1;
const LIVE: u8 = 0;

const SLICE_BITS: u32 = 5;
const MAX_DEPTH: u32 = 7; // 7 * 5 = 35 bits, covers the full 32-bit hash space

/// Hashes `key` into the 32-bit space the trie slices on.
#[must_use]
pub fn hash_key(key: &[u8]) -> u32 {
    (xxhash_rust::xxh3::xxh3_64(key) & 0xFFFF_FFFF) as u32
}

fn slice_at(hash: u32, depth: u32) -> u32 {
    (hash >> (depth * SLICE_BITS)) & 0x1F
}

struct Entry {
    hash: u32,
    key: Vec<u8>,
    value: RecordId,
}

fn write_leaf(builder: &mut Builder, current_segment: SegmentId, entries: &[Entry]) -> Result<u32> {
    let mut sorted: Vec<&Entry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.hash);

    let mut buf = Vec::new();
    buf.push(TAG_LEAF);
    buf.write_u32::<BigEndian>(sorted.len() as u32)?;

    for entry in sorted {
        buf.write_u32::<BigEndian>(entry.hash)?;
        let key_offset = write_string(builder, current_segment, &entry.key)?;
        let key_ref = make_ref(builder, current_segment, RecordId::new(current_segment, key_offset))?;
        key_ref.encode(&mut buf)?;
        let value_ref = make_ref(builder, current_segment, entry.value)?;
        value_ref.encode(&mut buf)?;
    }

    Ok(builder.write_record(&buf))
}

fn build(
    builder: &mut Builder,
    current_segment: SegmentId,
    entries: Vec<Entry>,
    depth: u32,
) -> Result<u32> {
    if entries.len() <= BUCKETS_PER_LEVEL || depth >= MAX_DEPTH {
        return write_leaf(builder, current_segment, &entries);
    }

    let mut groups: Vec<Vec<Entry>> = (0..BUCKETS_PER_LEVEL).map(|_| Vec::new()).collect();
    for entry in entries {
        let slice = slice_at(entry.hash, depth) as usize;
        groups[slice].push(entry);
    }

    let mut bitmap: u32 = 0;
    let mut child_offsets = Vec::new();
    for (slice, group) in groups.into_iter().enumerate() {
        if group.is_empty() {
            continue;
        }
        bitmap |= 1 << slice;
        let child_offset = build(builder, current_segment, group, depth + 1)?;
        child_offsets.push(RecordId::new(current_segment, child_offset));
    }

    let mut buf = Vec::new();
    buf.push(TAG_BRANCH);
    buf.write_u32::<BigEndian>(bitmap)?;
    for child in &child_offsets {
        let r = make_ref(builder, current_segment, *child)?;
        r.encode(&mut buf)?;
    }
    Ok(builder.write_record(&buf))
}

/// Builds a fresh map record (no diff layering) from `entries`.
pub fn write_map(
    builder: &mut Builder,
    current_segment: SegmentId,
    entries: Vec<(Vec<u8>, RecordId)>,
) -> Result<u32> {
    let entries = entries
        .into_iter()
        .map(|(key, value)| Entry {
            hash: hash_key(&key),
            key,
            value,
        })
        .collect();
    build(builder, current_segment, entries, 0)
}

/// Looks up `key` in the map rooted at `offset`.
pub fn map_get(
    source: &dyn SegmentSource,
    segment: &Segment,
    offset: u32,
    key: &[u8],
) -> Result<Option<RecordId>> {
    map_get_at(source, segment, offset, key, hash_key(key), 0)
}

fn map_get_at(
    source: &dyn SegmentSource,
    segment: &Segment,
    offset: u32,
    key: &[u8],
    hash: u32,
    depth: u32,
) -> Result<Option<RecordId>> {
    let cursor = segment.cursor();
    let tag = cursor.read_byte(offset)?;

    match tag {
        TAG_LEAF => {
            let count = cursor.read_int(offset + 1)? as usize;
            let mut pos = offset + 5;
            for _ in 0..count {
                let entry_hash = cursor.read_int(pos)?;
                let (key_ref, next) = RecordRef::decode(&cursor, pos + 4)?;
                let (value_ref, next) = RecordRef::decode(&cursor, next)?;
                pos = next;

                if entry_hash != hash {
                    continue;
                }

                let key_record = resolve(segment, key_ref)?;
                let key_segment = load(source, segment, key_record.segment_id)?;
                let stored_key = read_string(source, &key_segment, key_record.offset)?;

                if stored_key == key {
                    return Ok(Some(resolve(segment, value_ref)?));
                }
            }
            Ok(None)
        }
        TAG_BRANCH => {
            let bitmap = cursor.read_int(offset + 1)?;
            let slice = slice_at(hash, depth);
            if bitmap & (1 << slice) == 0 {
                return Ok(None);
            }
            let child_index = (bitmap & ((1u32 << slice) - 1)).count_ones() as u32;
            let (child_ref, _) =
                RecordRef::decode(&cursor, offset + 5 + RecordRef::WIRE_LEN * child_index)?;
            let child_record = resolve(segment, child_ref)?;
            let child_segment = load(source, segment, child_record.segment_id)?;
            map_get_at(source, &child_segment, child_record.offset, key, hash, depth + 1)
        }
        TAG_DIFF => {
            let (base_ref, next) = RecordRef::decode(&cursor, offset + 1)?;
            let overlay_count = cursor.read_int(next)? as usize;
            let mut pos = next + 4;

            for _ in 0..overlay_count {
                let entry_hash = cursor.read_int(pos)?;
                let (key_ref, after_key) = RecordRef::decode(&cursor, pos + 4)?;
                let (value_ref, after_value) = RecordRef::decode(&cursor, after_key)?;
                let tombstone = cursor.read_byte(after_value)?;
                pos = after_value + 1;

                if entry_hash != hash {
                    continue;
                }

                let key_record = resolve(segment, key_ref)?;
                let key_segment = load(source, segment, key_record.segment_id)?;
                let stored_key = read_string(source, &key_segment, key_record.offset)?;

                if stored_key == key {
                    if tombstone == TOMBSTONE {
                        return Ok(None);
                    }
                    return Ok(Some(resolve(segment, value_ref)?));
                }
            }

            let base_record = resolve(segment, base_ref)?;
            let base_segment = load(source, segment, base_record.segment_id)?;
            map_get_at(source, &base_segment, base_record.offset, key, hash, depth)
        }
        other => Err(Error::Decode(format!("unknown map tag {other}"))),
    }
}

fn load(source: &dyn SegmentSource, current: &Segment, id: SegmentId) -> Result<Segment> {
    if id == current.id() {
        Ok(current.clone())
    } else {
        source.load(id)
    }
}

/// Materializes every live `(key, value)` entry in the map rooted at
/// `offset`, resolving `Diff` overlays over their base and honoring
/// tombstones. Used by node enumeration (child name iteration) and by the
/// garbage collector's reachability walk, both of which need the full
/// entry set rather than a single-key lookup.
pub fn map_iter(
    source: &dyn SegmentSource,
    segment: &Segment,
    offset: u32,
) -> Result<Vec<(Vec<u8>, RecordId)>> {
    let mut out: std::collections::BTreeMap<Vec<u8>, Option<RecordId>> = std::collections::BTreeMap::new();
    collect_into(source, segment, offset, &mut out)?;
    Ok(out
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key, v)))
        .collect())
}

fn collect_into(
    source: &dyn SegmentSource,
    segment: &Segment,
    offset: u32,
    out: &mut std::collections::BTreeMap<Vec<u8>, Option<RecordId>>,
) -> Result<()> {
    let cursor = segment.cursor();
    let tag = cursor.read_byte(offset)?;

    match tag {
        TAG_LEAF => {
            let count = cursor.read_int(offset + 1)? as usize;
            let mut pos = offset + 5;
            for _ in 0..count {
                let _hash = cursor.read_int(pos)?;
                let (key_ref, next) = RecordRef::decode(&cursor, pos + 4)?;
                let (value_ref, next) = RecordRef::decode(&cursor, next)?;
                pos = next;

                let key_record = resolve(segment, key_ref)?;
                let key_segment = load(source, segment, key_record.segment_id)?;
                let key = read_string(source, &key_segment, key_record.offset)?;
                let value_record = resolve(segment, value_ref)?;

                out.entry(key).or_insert(Some(value_record));
            }
            Ok(())
        }
        TAG_BRANCH => {
            let bitmap = cursor.read_int(offset + 1)?;
            let child_count = bitmap.count_ones();
            for i in 0..child_count {
                let (child_ref, _) = RecordRef::decode(&cursor, offset + 5 + RecordRef::WIRE_LEN * i)?;
                let child_record = resolve(segment, child_ref)?;
                let child_segment = load(source, segment, child_record.segment_id)?;
                collect_into(source, &child_segment, child_record.offset, out)?;
            }
            Ok(())
        }
        TAG_DIFF => {
            let (base_ref, next) = RecordRef::decode(&cursor, offset + 1)?;
            let overlay_count = cursor.read_int(next)? as usize;
            let mut pos = next + 4;

            for _ in 0..overlay_count {
                let _hash = cursor.read_int(pos)?;
                let (key_ref, after_key) = RecordRef::decode(&cursor, pos + 4)?;
                let (value_ref, after_value) = RecordRef::decode(&cursor, after_key)?;
                let tombstone = cursor.read_byte(after_value)?;
                pos = after_value + 1;

                let key_record = resolve(segment, key_ref)?;
                let key_segment = load(source, segment, key_record.segment_id)?;
                let key = read_string(source, &key_segment, key_record.offset)?;

                let value = if tombstone == TOMBSTONE {
                    None
                } else {
                    Some(resolve(segment, value_ref)?)
                };
                out.entry(key).or_insert(value);
            }

            let base_record = resolve(segment, base_ref)?;
            let base_segment = load(source, segment, base_record.segment_id)?;
            collect_into(source, &base_segment, base_record.offset, out)
        }
        other => Err(Error::Decode(format!("unknown map tag {other}"))),
    }
}

/// Returns a new map with `key` bound to `value`, sharing structure with
/// the map rooted at `base_offset` in `base_segment` via a `Diff` layer.
/// `base_segment` need not be `current_segment` — the base map commonly
/// lives in an earlier segment than the one being built.
pub fn map_put(
    builder: &mut Builder,
    current_segment: SegmentId,
    base_segment: SegmentId,
    base_offset: u32,
    key: &[u8],
    value: RecordId,
) -> Result<u32> {
    write_diff(builder, current_segment, base_segment, base_offset, key, Some(value))
}

/// Returns a new map with `key` removed. A no-op (`base_offset` unchanged)
/// if `key` is already absent, per the map-removal law.
pub fn map_remove(
    source: &dyn SegmentSource,
    builder: &mut Builder,
    current_segment: SegmentId,
    base: &Segment,
    base_offset: u32,
    key: &[u8],
) -> Result<u32> {
    if map_get(source, base, base_offset, key)?.is_none() {
        return Ok(base_offset);
    }
    write_diff(builder, current_segment, base.id(), base_offset, key, None)
}

fn write_diff(
    builder: &mut Builder,
    current_segment: SegmentId,
    base_segment: SegmentId,
    base_offset: u32,
    key: &[u8],
    value: Option<RecordId>,
) -> Result<u32> {
    let mut buf = Vec::new();
    buf.push(TAG_DIFF);

    let base_ref = make_ref(
        builder,
        current_segment,
        RecordId::new(base_segment, base_offset),
    )?;
    base_ref.encode(&mut buf)?;

    buf.write_u32::<BigEndian>(1)?; // overlay_count

    buf.write_u32::<BigEndian>(hash_key(key))?;
    let key_offset = write_string(builder, current_segment, key)?;
    let key_ref = make_ref(builder, current_segment, RecordId::new(current_segment, key_offset))?;
    key_ref.encode(&mut buf)?;

    let (value_ref, tombstone) = match value {
        Some(v) => (make_ref(builder, current_segment, v)?, LIVE),
        None => (RecordRef::same_segment(0), TOMBSTONE),
    };
    value_ref.encode(&mut buf)?;
    buf.write_u8(tombstone)?;

    Ok(builder.write_record(&buf))
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

    struct FakeSource(std::collections::HashMap<SegmentId, Segment>);
    impl SegmentSource for FakeSource {
        fn load(&self, id: SegmentId) -> Result<Segment> {
            self.0.get(&id).cloned().ok_or(Error::SegmentNotFound(id))
        }
    }

    #[test]
    fn put_then_get_round_trips() -> Result<()> {
        let segment_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut builder = Builder::new(0);
        let empty = write_map(&mut builder, segment_id, vec![])?;

        let value = RecordId::new(segment_id, 0);
        let after_put = map_put(&mut builder, segment_id, segment_id, empty, b"k", value)?;

        let (bytes, _) = builder.seal(segment_id)?;
        let segment = Segment::parse(segment_id, bytes.into())?;

        assert_eq!(map_get(&Null, &segment, after_put, b"k")?, Some(value));
        assert_eq!(map_get(&Null, &segment, after_put, b"missing")?, None);
        Ok(())
    }

    #[test]
    fn put_over_base_in_different_segment() -> Result<()> {
        let base_segment_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut base_builder = Builder::new(0);
        let base_value = RecordId::new(base_segment_id, 0);
        let base_offset = write_map(&mut base_builder, base_segment_id, vec![(b"a".to_vec(), base_value)])?;
        let (base_bytes, _) = base_builder.seal(base_segment_id)?;
        let base_segment = Segment::parse(base_segment_id, base_bytes.into())?;

        let current_segment_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut builder = Builder::new(0);
        let value = RecordId::new(current_segment_id, 16);
        let after_put = map_put(&mut builder, current_segment_id, base_segment_id, base_offset, b"b", value)?;
        let (bytes, _) = builder.seal(current_segment_id)?;
        let segment = Segment::parse(current_segment_id, bytes.into())?;

        let mut segments = std::collections::HashMap::new();
        segments.insert(base_segment_id, base_segment);
        let source = FakeSource(segments);

        assert_eq!(map_get(&source, &segment, after_put, b"b")?, Some(value));
        assert_eq!(map_get(&source, &segment, after_put, b"a")?, Some(base_value));
        Ok(())
    }

    #[test]
    fn remove_present_key_clears_it() -> Result<()> {
        let segment_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut builder = Builder::new(0);
        let empty = write_map(&mut builder, segment_id, vec![])?;
        let value = RecordId::new(segment_id, 0);
        let after_put = map_put(&mut builder, segment_id, segment_id, empty, b"k", value)?;

        let (bytes, _) = builder.seal(segment_id)?;
        let segment = Segment::parse(segment_id, bytes.into())?;

        let mut builder2 = Builder::new(0);
        let after_remove =
            map_remove(&Null, &mut builder2, segment_id, &segment, after_put, b"k")?;
        let (bytes2, _) = builder2.seal(segment_id)?;
        let segment2 = Segment::parse(segment_id, bytes2.into())?;
        assert_eq!(map_get(&Null, &segment2, after_remove, b"k")?, None);
        Ok(())
    }

    #[test]
    fn remove_absent_key_is_noop() -> Result<()> {
        let segment_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut builder = Builder::new(0);
        let empty = write_map(&mut builder, segment_id, vec![])?;
        let (bytes, _) = builder.seal(segment_id)?;
        let segment = Segment::parse(segment_id, bytes.into())?;

        let mut builder2 = Builder::new(0);
        let after_remove =
            map_remove(&Null, &mut builder2, segment_id, &segment, empty, b"absent")?;
        assert_eq!(after_remove, empty);
        Ok(())
    }

    #[test]
    fn colliding_hashes_beyond_fanout_still_resolve() -> Result<()> {
        // Force every key through the same slice at every depth by reusing
        // one precomputed hash's low bits is impractical with a real hash
        // function, so instead exercise the boundary by writing more than
        // BUCKETS_PER_LEVEL + 1 entries and trusting the real hash
        // distribution to exercise branch nodes, then spot check a few.
        let segment_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut builder = Builder::new(0);

        let entries: Vec<(Vec<u8>, RecordId)> = (0..(BUCKETS_PER_LEVEL as u32 + 1))
            .map(|i| (format!("key-{i}").into_bytes(), RecordId::new(segment_id, (i * 16) % 4096)))
            .collect();

        let offset = write_map(&mut builder, segment_id, entries.clone())?;
        let (bytes, _) = builder.seal(segment_id)?;
        let segment = Segment::parse(segment_id, bytes.into())?;

        for (key, value) in &entries {
            assert_eq!(map_get(&Null, &segment, offset, key)?, Some(*value));
        }
        Ok(())
    }

    #[test]
    fn map_iter_reflects_put_and_remove_over_base() -> Result<()> {
        let segment_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut builder = Builder::new(0);

        let base_entries = vec![
            (b"a".to_vec(), RecordId::new(segment_id, 0)),
            (b"b".to_vec(), RecordId::new(segment_id, 16)),
        ];
        let base = write_map(&mut builder, segment_id, base_entries.clone())?;
        let after_put = map_put(&mut builder, segment_id, segment_id, base, b"c", RecordId::new(segment_id, 32))?;

        let (bytes, _) = builder.seal(segment_id)?;
        let segment = Segment::parse(segment_id, bytes.into())?;

        let mut all = map_iter(&Null, &segment, after_put)?;
        all.sort();
        assert_eq!(
            all,
            vec![
                (b"a".to_vec(), RecordId::new(segment_id, 0)),
                (b"b".to_vec(), RecordId::new(segment_id, 16)),
                (b"c".to_vec(), RecordId::new(segment_id, 32)),
            ]
        );

        let mut builder2 = Builder::new(0);
        let after_remove = map_remove(&Null, &mut builder2, segment_id, &segment, after_put, b"b")?;
        let (bytes2, _) = builder2.seal(segment_id)?;
        let segment2 = Segment::parse(segment_id, bytes2.into())?;

        let mut remaining = map_iter(&Null, &segment2, after_remove)?;
        remaining.sort();
        assert_eq!(
            remaining,
            vec![
                (b"a".to_vec(), RecordId::new(segment_id, 0)),
                (b"c".to_vec(), RecordId::new(segment_id, 32)),
            ]
        );
        Ok(())
    }
}
