//! Archive writer: appends segment entries to a `data<NNNNN><gen>.tar` file
//! and seals it with `.gph`/`.brf`/`.idx` footer entries plus a trailer
//! block recording their offsets, so a reader never has to scan the file.

use super::entry::{padded_len, EntryHeader, BLOCK_SIZE, TRAILER_MAGIC};
use crate::error::Result;
use crate::file::{FOOTER_BLOB_REFS, FOOTER_GRAPH, FOOTER_INDEX};
use crate::id::SegmentId;
use byteorder::{BigEndian, WriteBytesExt};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// One `(offset, len)` pointer into the sealed file, used by the trailer.
#[derive(Copy, Clone, Debug)]
struct FooterPointer {
    offset: u64,
    len: u64,
}

/// Appends entries to a single archive file.
pub struct ArchiveWriter {
    path: PathBuf,
    file: BufWriter<File>,
    size: u64,
    index: HashMap<SegmentId, (u64, u64, u32)>,
    graph: HashMap<SegmentId, Vec<SegmentId>>,
    blob_refs: HashSet<String>,
    /// Segment bytes kept in memory until this writer is sealed, so a
    /// segment written moments ago can be read back before its archive file
    /// has a trailer (and thus before an [`super::reader::ArchiveReader`]
    /// could open it).
    buffered: HashMap<SegmentId, std::sync::Arc<[u8]>>,
}

impl ArchiveWriter {
    /// Creates a brand-new archive file at `path`. Fails if it already exists.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: BufWriter::new(file),
            size: 0,
            index: HashMap::new(),
            graph: HashMap::new(),
            blob_refs: HashSet::new(),
            buffered: HashMap::new(),
        })
    }

    /// `true` if `id` was appended to this (still-unsealed) writer.
    #[must_use]
    pub fn contains(&self, id: SegmentId) -> bool {
        self.index.contains_key(&id)
    }

    /// Returns the in-memory bytes for a segment appended to this writer,
    /// if any. `None` once the writer has been sealed (the buffer is
    /// dropped at that point; reads go through an `ArchiveReader` instead).
    #[must_use]
    pub fn read_buffered(&self, id: SegmentId) -> Option<std::sync::Arc<[u8]>> {
        self.buffered.get(&id).cloned()
    }

    /// Every `(id, payload_len, generation)` appended so far, for GC's byte
    /// estimate and cleanup pass to account for segments not yet sealed
    /// into a readable archive.
    pub fn entries(&self) -> impl Iterator<Item = (SegmentId, u64, u32)> + '_ {
        self.index.iter().map(|(id, (_, len, gen))| (*id, *len, *gen))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// `true` once `size()` has reached `max_file_size`; the caller should
    /// seal this writer and open a fresh archive file for the next segment.
    #[must_use]
    pub fn should_seal(&self, max_file_size: u64) -> bool {
        self.size >= max_file_size
    }

    /// Appends one sealed segment's bytes as a new archive entry.
    ///
    /// `refs` is the segment's own reference list, recorded again here (in
    /// the `.gph` footer) so a reader can answer reachability questions
    /// without re-parsing every segment header.
    pub fn append_segment(
        &mut self,
        id: SegmentId,
        generation: u32,
        bytes: &[u8],
        refs: &[SegmentId],
    ) -> Result<()> {
        let offset = self.write_entry(&id.archive_entry_name(generation), generation, bytes)?;
        self.index.insert(id, (offset, bytes.len() as u64, generation));
        if id.is_data() {
            self.graph.insert(id, refs.to_vec());
        }
        self.buffered.insert(id, bytes.to_vec().into());
        Ok(())
    }

    /// Records an external blob id observed while writing, for downstream
    /// blob garbage collection.
    pub fn add_blob_ref(&mut self, blob_id: String) {
        self.blob_refs.insert(blob_id);
    }

    fn write_entry(&mut self, name: &str, generation: u32, payload: &[u8]) -> Result<u64> {
        let offset = self.size;
        let header = EntryHeader {
            name: name.to_string(),
            payload_len: payload.len() as u64,
            generation,
        };
        header.encode(&mut self.file)?;
        self.file.write_all(payload)?;

        let total = BLOCK_SIZE + payload.len() as u64;
        let padded = padded_len(total);
        let pad = padded - total;
        if pad > 0 {
            self.file.write_all(&vec![0u8; pad as usize])?;
        }
        self.size += padded;
        Ok(offset)
    }

    fn encode_graph(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(self.graph.len() as u32).ok();
        for (id, refs) in &self.graph {
            buf.write_u64::<BigEndian>(id.msb()).ok();
            buf.write_u64::<BigEndian>(id.lsb()).ok();
            buf.write_u32::<BigEndian>(refs.len() as u32).ok();
            for r in refs {
                buf.write_u64::<BigEndian>(r.msb()).ok();
                buf.write_u64::<BigEndian>(r.lsb()).ok();
            }
        }
        buf
    }

    fn encode_blob_refs(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(self.blob_refs.len() as u32).ok();
        for blob_id in &self.blob_refs {
            let bytes = blob_id.as_bytes();
            buf.write_u32::<BigEndian>(bytes.len() as u32).ok();
            buf.extend_from_slice(bytes);
        }
        buf
    }

    fn encode_index(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(self.index.len() as u32).ok();
        for (id, (offset, len, generation)) in &self.index {
            buf.write_u64::<BigEndian>(id.msb()).ok();
            buf.write_u64::<BigEndian>(id.lsb()).ok();
            buf.write_u64::<BigEndian>(*offset).ok();
            buf.write_u64::<BigEndian>(*len).ok();
            buf.write_u32::<BigEndian>(*generation).ok();
        }
        buf
    }

    /// Seals the archive: writes the `.gph`/`.brf`/`.idx` footer entries,
    /// appends a trailer block pointing at them, fsyncs and closes the
    /// file. The returned path is ready to be opened as an
    /// [`super::reader::ArchiveReader`].
    pub fn seal(mut self) -> Result<PathBuf> {
        let graph_bytes = self.encode_graph();
        let blob_refs_bytes = self.encode_blob_refs();
        let index_bytes = self.encode_index();

        let graph_offset = self.write_entry(FOOTER_GRAPH, 0, &graph_bytes)?;
        let blob_refs_offset = self.write_entry(FOOTER_BLOB_REFS, 0, &blob_refs_bytes)?;
        let index_offset = self.write_entry(FOOTER_INDEX, 0, &index_bytes)?;

        let pointers = [
            FooterPointer {
                offset: graph_offset,
                len: graph_bytes.len() as u64,
            },
            FooterPointer {
                offset: blob_refs_offset,
                len: blob_refs_bytes.len() as u64,
            },
            FooterPointer {
                offset: index_offset,
                len: index_bytes.len() as u64,
            },
        ];

        let mut trailer = Vec::with_capacity(BLOCK_SIZE as usize);
        trailer.write_all(&TRAILER_MAGIC)?;
        for p in &pointers {
            trailer.write_u64::<BigEndian>(p.offset)?;
            trailer.write_u64::<BigEndian>(p.len)?;
        }
        trailer.resize(BLOCK_SIZE as usize, 0);

        self.file.write_all(&trailer)?;
        self.size += BLOCK_SIZE;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        Ok(self.path)
    }
}
