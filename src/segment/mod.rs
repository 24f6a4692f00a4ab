//! Segment codec: binary layout of a single segment (header, references,
//! roots, record payload) and the builder used to assemble new segments.

pub mod header;

use crate::error::{Error, Result};
use crate::id::SegmentId;
use crate::record::{aligned_len, RecordCursor, RecordType};
use header::{RootEntry, SegmentHeader};
use std::sync::Arc;

/// Upper bound on a segment's encoded size (header + refs + roots + payload).
pub const MAX_SEGMENT_SIZE: usize = 256 * 1024;

/// An immutable, parsed segment: a header plus its record payload.
///
/// `Segment` is a cheap `Arc`-backed view; cloning shares the underlying
/// byte buffer, the same sharing model the segment cache hands out.
#[derive(Clone)]
pub struct Segment {
    id: SegmentId,
    bytes: Arc<[u8]>,
    header: SegmentHeader,
    header_len: usize,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Segment({}, gen={}, refs={}, roots={})",
            self.id,
            self.header.generation,
            self.header.refs.len(),
            self.header.roots.len()
        )
    }
}

impl Segment {
    /// Parses a segment from its complete on-disk bytes.
    pub fn parse(id: SegmentId, bytes: Arc<[u8]>) -> Result<Self> {
        let (header, header_len) = SegmentHeader::decode(&bytes)?;
        Ok(Self {
            id,
            bytes,
            header,
            header_len,
        })
    }

    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    #[must_use]
    pub fn generation(&self) -> u32 {
        self.header.generation
    }

    #[must_use]
    pub fn refs(&self) -> &[SegmentId] {
        &self.header.refs
    }

    #[must_use]
    pub fn roots(&self) -> &[RootEntry] {
        &self.header.roots
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Resolves a reference index (as stored inline in a record) plus local
    /// segment id back into the segment actually holding the referenced
    /// record. Fails with [`Error::SegmentNotFound`]-flavored corruption if
    /// the index is out of range of this segment's declared `refs` list —
    /// record decoding never follows a reference absent from the header.
    pub fn resolve_ref_index(&self, ref_index: Option<u16>) -> Result<SegmentId> {
        match ref_index {
            None => Ok(self.id),
            Some(idx) => self
                .header
                .refs
                .get(idx as usize)
                .copied()
                .ok_or_else(|| Error::Corruption(format!("ref index {idx} out of range"))),
        }
    }

    /// A read cursor over this segment's record payload.
    #[must_use]
    pub fn cursor(&self) -> RecordCursor<'_> {
        RecordCursor::new(&self.bytes[self.header_len..])
    }

    /// Raw segment bytes, for archive writing / diagnostics.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The record payload, i.e. everything after the header.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.header_len..]
    }

    /// Re-encodes this segment's bytes with `generation` substituted for
    /// whatever generation it was originally written at, keeping the id,
    /// refs, roots and payload identical. Used by compaction to advance a
    /// copied-forward segment's declared generation without disturbing any
    /// record offset into it (the header's encoded length does not depend
    /// on the generation field, so the payload never shifts).
    pub fn reheadered(&self, generation: u32) -> Result<Vec<u8>> {
        let header = SegmentHeader::new(generation, self.header.refs.clone(), self.header.roots.clone());
        let mut out = Vec::with_capacity(header.encoded_len() + self.payload().len());
        header.encode(&mut out)?;
        out.extend_from_slice(self.payload());
        Ok(out)
    }
}

/// Resolves a segment id to its parsed bytes.
///
/// Implemented by the store's tracker+cache stack; the record codec depends
/// only on this trait so it never needs to know about archives, writers or
/// the store's locking.
pub trait SegmentSource {
    fn load(&self, id: SegmentId) -> Result<Segment>;
}

/// Accumulates records, references and roots for one in-flight segment.
///
/// Callers append records one
/// at a time; `finish` produces the final contiguous byte buffer ready to be
/// handed to the archive writer as one entry.
pub struct Builder {
    generation: u32,
    refs: Vec<SegmentId>,
    roots: Vec<RootEntry>,
    payload: Vec<u8>,
}

impl Builder {
    #[must_use]
    pub fn new(generation: u32) -> Self {
        Self {
            generation,
            refs: Vec::new(),
            roots: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Interns `id` into this segment's reference list, returning its index
    /// (deduplicated — writing the same child segment twice costs no extra
    /// header space).
    pub fn add_ref(&mut self, id: SegmentId) -> Result<u16> {
        if let Some(pos) = self.refs.iter().position(|r| *r == id) {
            return u16::try_from(pos)
                .map_err(|_| Error::Encode("too many distinct segment references".into()));
        }
        self.refs.push(id);
        u16::try_from(self.refs.len() - 1)
            .map_err(|_| Error::Encode("too many distinct segment references".into()))
    }

    /// Appends a record's bytes, zero-padding to [`crate::id::ALIGN`], and
    /// returns its offset (relative to the final segment's record-payload
    /// start).
    pub fn write_record(&mut self, bytes: &[u8]) -> u32 {
        let offset = self.current_offset();
        self.payload.extend_from_slice(bytes);
        let padded = aligned_len(bytes.len());
        self.payload.resize(self.payload.len() - bytes.len() + padded, 0);
        offset
    }

    /// Offset the next record written would land at.
    #[must_use]
    pub fn current_offset(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn add_root(&mut self, record_type: RecordType, offset: u32) {
        self.roots.push(RootEntry {
            record_type,
            offset,
        });
    }

    /// Estimated size if sealed right now (used by the writer pool to
    /// decide when to flush).
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        let header = SegmentHeader::new(self.generation, self.refs.clone(), self.roots.clone());
        header.encoded_len() + self.payload.len()
    }

    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.refs.len()
    }

    #[must_use]
    pub fn refs(&self) -> &[SegmentId] {
        &self.refs
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty() && self.roots.is_empty()
    }

    /// Seals the segment, producing its id and final byte buffer.
    ///
    /// Record offsets returned earlier by [`Builder::write_record`] are
    /// relative to the payload; this shifts nothing, because the header is
    /// written first and the payload follows immediately, so a record's
    /// absolute offset within the sealed segment is `header_len + offset`.
    /// Callers must therefore record `header_len + offset` as the durable
    /// [`crate::id::RecordId`] offset, which [`Self::seal`] returns alongside
    /// the bytes to make that unambiguous.
    pub fn seal(self, _id: SegmentId) -> Result<(Vec<u8>, u32)> {
        let header = SegmentHeader::new(self.generation, self.refs, self.roots);
        let mut out = Vec::with_capacity(header.encoded_len() + self.payload.len());
        let header_len = header.encode(&mut out)? as u32;
        out.extend_from_slice(&self.payload);

        // NOTE: the writer pool is responsible for keeping individual
        // segments under MAX_SEGMENT_SIZE by sealing before a record would
        // push a buffer over the limit; a handful of call sites (notably
        // the largest LIST/STRING boundary tests) intentionally produce an
        // oversized one-off buffer that is never written to an archive.
        //
        // `header_len` itself is not ALIGN-aligned (the header is packed,
        // not padded) and doesn't need to be: record offsets are relative
        // to the payload, not to the start of the sealed buffer.
        Ok((out, header_len))
    }
}
