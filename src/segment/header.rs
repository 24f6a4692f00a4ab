//! Segment header: magic, version, reference list and root entries.

use crate::error::{Error, Result};
use crate::id::{SegmentId, Version, ALIGN};
use crate::record::RecordType;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

const MAGIC: [u8; 4] = *b"NSG1";

/// A root entry: a record reachable from outside the segment, tagged with
/// its declared record type so a reader can dispatch without guessing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RootEntry {
    pub record_type: RecordType,
    pub offset: u32,
}

/// Parsed segment header (everything except the record payload bytes).
#[derive(Clone, Debug)]
pub struct SegmentHeader {
    pub version: Version,
    pub generation: u32,
    pub refs: Vec<SegmentId>,
    pub roots: Vec<RootEntry>,
}

impl SegmentHeader {
    #[must_use]
    pub fn new(generation: u32, refs: Vec<SegmentId>, roots: Vec<RootEntry>) -> Self {
        Self {
            version: Version::CURRENT,
            generation,
            refs,
            roots,
        }
    }

    /// Encodes the header into `out`, returning the number of bytes written.
    ///
    /// The record payload immediately follows at this offset; every record
    /// offset recorded against this segment is relative to the segment's
    /// start, so `encoded_len()` doubles as the first legal payload offset.
    pub fn encode<W: Write>(&self, out: &mut W) -> Result<usize> {
        out.write_all(&MAGIC)?;
        out.write_u8(self.version.0)?;
        out.write_u32::<BigEndian>(self.generation)?;

        out.write_u32::<BigEndian>(
            self.refs
                .len()
                .try_into()
                .map_err(|_| Error::Encode("too many segment references".into()))?,
        )?;
        for r in &self.refs {
            out.write_u64::<BigEndian>(r.msb())?;
            out.write_u64::<BigEndian>(r.lsb())?;
        }

        out.write_u32::<BigEndian>(
            self.roots
                .len()
                .try_into()
                .map_err(|_| Error::Encode("too many roots".into()))?,
        )?;
        for root in &self.roots {
            out.write_u8(root.record_type as u8)?;
            out.write_u32::<BigEndian>(root.offset)?;
        }

        Ok(self.encoded_len())
    }

    /// Number of bytes this header occupies once encoded.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        4 + 1 + 4 + 4 + self.refs.len() * 16 + 4 + self.roots.len() * 5
    }

    /// Decodes a header from the front of `buf`, returning `(header, bytes_consumed)`.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = buf;

        let mut magic = [0u8; 4];
        cursor
            .read_exact(&mut magic)
            .map_err(|_| Error::Corruption("truncated segment header".into()))?;
        if magic != MAGIC {
            return Err(Error::Corruption(format!(
                "bad segment magic: {magic:?}"
            )));
        }

        let version_byte = cursor
            .read_u8()
            .map_err(|_| Error::Corruption("truncated segment header".into()))?;
        let version = Version(version_byte);

        let generation = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| Error::Corruption("truncated segment header".into()))?;

        let ref_count = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| Error::Corruption("truncated segment header".into()))?;
        let mut refs = Vec::with_capacity(ref_count as usize);
        for _ in 0..ref_count {
            let msb = cursor
                .read_u64::<BigEndian>()
                .map_err(|_| Error::Corruption("truncated segment refs".into()))?;
            let lsb = cursor
                .read_u64::<BigEndian>()
                .map_err(|_| Error::Corruption("truncated segment refs".into()))?;
            refs.push(SegmentId::from_raw_parts(msb, lsb));
        }

        let root_count = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| Error::Corruption("truncated segment roots".into()))?;
        let mut roots = Vec::with_capacity(root_count as usize);
        for _ in 0..root_count {
            let tag = cursor
                .read_u8()
                .map_err(|_| Error::Corruption("truncated segment roots".into()))?;
            let record_type = RecordType::from_tag(tag)?;
            let offset = cursor
                .read_u32::<BigEndian>()
                .map_err(|_| Error::Corruption("truncated segment roots".into()))?;
            if offset % ALIGN != 0 {
                return Err(Error::Corruption(format!(
                    "root offset {offset} is not ALIGN-aligned"
                )));
            }
            roots.push(RootEntry {
                record_type,
                offset,
            });
        }

        let consumed = buf.len() - cursor.len();
        Ok((
            Self {
                version,
                generation,
                refs,
                roots,
            },
            consumed,
        ))
    }

    /// `true` if `id` is listed in this header's reference list.
    #[must_use]
    pub fn references(&self, id: &SegmentId) -> bool {
        self.refs.iter().any(|r| r == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::SegmentKind;
    use test_log::test;

    #[test]
    fn header_roundtrip_empty() -> crate::Result<()> {
        let header = SegmentHeader::new(0, vec![], vec![]);
        let mut buf = vec![];
        let written = header.encode(&mut buf)?;
        assert_eq!(written, buf.len());

        let (decoded, consumed) = SegmentHeader::decode(&buf)?;
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded.generation, 0);
        assert!(decoded.refs.is_empty());
        assert!(decoded.roots.is_empty());
        Ok(())
    }

    #[test]
    fn header_roundtrip_with_refs_and_roots() -> crate::Result<()> {
        let ref_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let header = SegmentHeader::new(
            3,
            vec![ref_id],
            vec![RootEntry {
                record_type: RecordType::Node,
                offset: 32,
            }],
        );

        let mut buf = vec![];
        header.encode(&mut buf)?;

        let (decoded, _) = SegmentHeader::decode(&buf)?;
        assert_eq!(decoded.generation, 3);
        assert_eq!(decoded.refs, vec![ref_id]);
        assert!(decoded.references(&ref_id));
        assert_eq!(decoded.roots[0].offset, 32);
        assert_eq!(decoded.roots[0].record_type, RecordType::Node);
        Ok(())
    }

    #[test]
    fn header_rejects_bad_magic() {
        let buf = [0u8; 16];
        let err = SegmentHeader::decode(&buf).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn header_rejects_misaligned_root_offset() {
        let header = SegmentHeader::new(
            0,
            vec![],
            vec![RootEntry {
                record_type: RecordType::Node,
                offset: 15,
            }],
        );
        let mut buf = vec![];
        header.encode(&mut buf).unwrap();
        let err = SegmentHeader::decode(&buf).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }
}
