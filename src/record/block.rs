//! `BLOCK` record: a short, opaque byte run inline in one segment.
//!
//! Blocks carry no length prefix of their own — the record referencing a
//! block (a `STRING`/`VALUE` large form, or a `LIST` leaf) always knows how
//! many bytes to read, since it tracked the length when it wrote the block.

use crate::error::Result;
use crate::record::RecordCursor;
use crate::segment::Builder;

/// Maximum bytes held by a single block before the caller must split across
/// multiple blocks (large strings/blobs chain blocks via a `LIST`).
pub const MAX_BLOCK_SIZE: usize = 4096;

/// Writes `bytes` (must be `<= MAX_BLOCK_SIZE`) as one `BLOCK` record,
/// returning its offset.
pub fn write_block(builder: &mut Builder, bytes: &[u8]) -> u32 {
    debug_assert!(bytes.len() <= MAX_BLOCK_SIZE);
    builder.write_record(bytes)
}

/// Reads `len` bytes of a block at `offset`.
pub fn read_block<'a>(cursor: &RecordCursor<'a>, offset: u32, len: usize) -> Result<&'a [u8]> {
    cursor.read_bytes(offset, len)
}

/// Splits `bytes` into `MAX_BLOCK_SIZE`-sized chunks for multi-block
/// (large string/value) encoding.
#[must_use]
pub fn chunk(bytes: &[u8]) -> Vec<&[u8]> {
    bytes.chunks(MAX_BLOCK_SIZE).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn block_roundtrip() {
        let mut builder = Builder::new(0);
        let offset = write_block(&mut builder, b"abc");
        let (bytes, header_len) = builder.seal(crate::id::SegmentId::new_random(
            crate::id::SegmentKind::Data,
            crate::id::Version::CURRENT,
        ))
        .unwrap();
        let segment = crate::segment::Segment::parse(
            crate::id::SegmentId::from_raw_parts(1, 1),
            bytes.into(),
        )
        .unwrap();
        let _ = header_len;
        let read = read_block(&segment.cursor(), offset, 3).unwrap();
        assert_eq!(read, b"abc");
    }

    #[test]
    fn chunking_splits_large_input() {
        let data = vec![7u8; MAX_BLOCK_SIZE * 2 + 10];
        let chunks = chunk(&data);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), MAX_BLOCK_SIZE);
        assert_eq!(chunks[2].len(), 10);
    }
}
